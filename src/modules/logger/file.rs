// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::code::ErrorCode;
use crate::modules::error::SyncResult;
use crate::modules::logger::LocalTimer;
use crate::modules::settings::cli::Settings;
use crate::raise_error;
use std::path::Path;
use std::sync::OnceLock;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;

pub static LOG_WORKER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

pub fn setup_file_logger(settings: &Settings, level: Level) -> SyncResult<()> {
    let log_dir = settings.mailbridge_log_dir.as_deref().ok_or_else(|| {
        raise_error!(
            "'mailbridge_log_dir' must be set when logging to file".into(),
            ErrorCode::MissingConfiguration
        )
    })?;

    let (writer, guard) = sync_log_writer(log_dir, settings.mailbridge_max_log_files)?;
    // A second initialization keeps the first guard alive; its writer stays valid.
    let _ = LOG_WORKER_GUARD.set(guard);

    let layer = fmt::layer()
        .with_timer(LocalTimer)
        .with_ansi(settings.mailbridge_ansi_logs)
        .with_level(true)
        .with_writer(writer)
        .with_target(true);

    let registry = tracing_subscriber::registry().with(LevelFilter::from_level(level));
    let result = if settings.mailbridge_json_logs {
        tracing::subscriber::set_global_default(registry.with(layer.json()))
    } else {
        tracing::subscriber::set_global_default(registry.with(layer))
    };
    result.map_err(|e| {
        raise_error!(
            format!("Failed to install file logger: {e}"),
            ErrorCode::InternalError
        )
    })
}

fn sync_log_writer(log_dir: &Path, max_files: usize) -> SyncResult<(NonBlocking, WorkerGuard)> {
    let rolling = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("sync")
        .max_log_files(max_files)
        .build(log_dir)
        .map_err(|e| {
            raise_error!(
                format!("Failed to initialize rolling file appender: {e}"),
                ErrorCode::InternalError
            )
        })?;
    Ok(tracing_appender::non_blocking(rolling))
}
