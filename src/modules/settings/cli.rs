// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use clap::{builder::ValueParser, Parser};
use std::{path::PathBuf, time::Duration};

/// Process-level configuration for the sync engine.
///
/// Parsed once by the embedding application (`Settings::parse()`), then handed
/// to the logger and to [`SyncServiceConfig::from_settings`](crate::modules::sync::service::SyncServiceConfig::from_settings).
/// Nothing inside the pipeline reads the environment directly.
#[derive(Debug, Clone, Parser)]
#[clap(
    name = "mailbridge-sync",
    about = "Mailbox synchronization engine: pulls remote message history, builds it and hands it to the local store.",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Settings {
    /// Log level (default: "info")
    #[clap(long, default_value = "info", env, help = "Set the log level for the sync engine")]
    pub mailbridge_log_level: String,

    #[clap(long, default_value = "true", env, help = "Enable ANSI formatted logs")]
    pub mailbridge_ansi_logs: bool,

    #[clap(long, default_value = "false", env, help = "Enable JSON formatted logs")]
    pub mailbridge_json_logs: bool,

    /// If false, logs will be printed to stdout
    #[clap(
        long,
        default_value = "false",
        env,
        help = "Enable log file output (otherwise logs go to stdout)"
    )]
    pub mailbridge_log_to_file: bool,

    #[clap(
        long,
        env,
        help = "Directory for rolling log files, required when logging to file",
        value_parser = ValueParser::new(|s: &str| {
            let path = PathBuf::from(s);
            if !path.is_absolute() {
                return Err("Path must be an absolute directory path".to_string());
            }
            Ok(path)
        })
    )]
    pub mailbridge_log_dir: Option<PathBuf>,

    #[clap(
        long,
        default_value = "5",
        env,
        help = "Set the maximum number of rolled log files"
    )]
    pub mailbridge_max_log_files: usize,

    #[clap(
        long,
        default_value = "2147483648",
        env,
        help = "Upper bound in bytes for memory used by the sync pipeline (clamped to [800MB, total/2])"
    )]
    pub mailbridge_max_sync_memory: u64,

    #[clap(
        long,
        default_value = "false",
        env,
        help = "Force the sync limits down to the minimum supported hardware spec"
    )]
    pub mailbridge_sync_force_minimum_spec: bool,

    #[clap(
        long,
        default_value = "128",
        env,
        help = "Number of message metadata rows requested per page",
        value_parser = clap::value_parser!(u32).range(2..)
    )]
    pub mailbridge_metadata_page_size: u32,

    #[clap(
        long,
        default_value = "200",
        env,
        help = "Maximum number of messages in a single download batch",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub mailbridge_max_messages_per_batch: u32,

    #[clap(
        long,
        default_value = "8",
        env,
        help = "Capacity of the bounded channels between pipeline stages",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub mailbridge_stage_channel_capacity: u32,

    #[clap(
        long,
        default_value = "20",
        env,
        help = "Seconds a handler waits before restarting a failed sync"
    )]
    pub mailbridge_sync_cool_down_secs: u64,
}

impl Settings {
    /// Pause between a failed sync attempt and the next one.
    pub fn sync_cool_down(&self) -> Duration {
        Duration::from_secs(self.mailbridge_sync_cool_down_secs)
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        Self {
            mailbridge_log_level: "info".to_string(),
            mailbridge_ansi_logs: false,
            mailbridge_json_logs: false,
            mailbridge_log_to_file: false,
            mailbridge_log_dir: None,
            mailbridge_max_log_files: 5,
            mailbridge_max_sync_memory: 2 * 1024 * 1024 * 1024,
            mailbridge_sync_force_minimum_spec: false,
            mailbridge_metadata_page_size: 128,
            mailbridge_max_messages_per_batch: 200,
            mailbridge_stage_channel_capacity: 8,
            mailbridge_sync_cool_down_secs: 20,
        }
    }
}
