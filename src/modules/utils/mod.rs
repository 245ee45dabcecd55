// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[macro_export]
macro_rules! mailbridge_version {
    () => {
        env!("CARGO_PKG_VERSION")
    };
}

#[macro_export]
macro_rules! raise_error {
    ($msg:expr, $code:expr) => {
        $crate::modules::error::SyncError::Generic {
            message: $msg,
            location: snafu::Location::default(),
            code: $code,
        }
    };
}

#[macro_export]
macro_rules! total_memory {
    () => {{
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        sys.total_memory()
    }};
}

pub const MEGABYTE: u64 = 1024 * 1024;
pub const GIGABYTE: u64 = 1024 * MEGABYTE;

pub fn to_mb(bytes: u64) -> u64 {
    bytes / MEGABYTE
}

/// Sleeps for `duration` unless `token` fires first. Returns `false` when cancelled.
pub async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
