// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::code::ErrorCode;
use crate::modules::error::SyncResult;
use crate::modules::logger::file::setup_file_logger;
use crate::modules::settings::cli::Settings;
use crate::raise_error;
use chrono::Local;
use tracing::Level;
use tracing_subscriber::fmt::{format::Writer, time::FormatTime};

mod file;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Installs the global tracing subscriber. Call once, before starting the sync service.
pub fn initialize_logging(settings: &Settings) -> SyncResult<()> {
    let level = parse_log_level(&settings.mailbridge_log_level)?;
    if settings.mailbridge_log_to_file {
        setup_file_logger(settings, level)
    } else {
        setup_stdout_logger(settings, level)
    }
}

fn setup_stdout_logger(settings: &Settings, level: Level) -> SyncResult<()> {
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(settings.mailbridge_ansi_logs)
        .with_writer(std::io::stdout)
        .with_level(true)
        .with_target(true)
        .with_timer(LocalTimer);

    let result = if settings.mailbridge_json_logs {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    result.map_err(|e| {
        raise_error!(
            format!("Failed to install stdout logger: {e}"),
            ErrorCode::InternalError
        )
    })
}

fn parse_log_level(value: &str) -> SyncResult<Level> {
    value.parse::<Level>().map_err(|_| {
        raise_error!(
            format!(
                "Invalid log level specified. Use one of: error, warn, info, debug, trace. \
                 The log level you currently specified is 'mailbridge_log_level'='{}'",
                value
            ),
            ErrorCode::InvalidParameter
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_parsing() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        let err = parse_log_level("chatty").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParameter);
    }

    #[test]
    fn file_logging_requires_directory() {
        let mut settings = Settings::new_for_test();
        settings.mailbridge_log_to_file = true;
        settings.mailbridge_log_dir = None;
        let err = initialize_logging(&settings).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingConfiguration);
    }
}
