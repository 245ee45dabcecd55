// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::sync::LazyLock;

use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

pub const NO_UNLOCKED_KEYRING: &str = "no_unlocked_keyring";
pub const BUILD_FAILED: &str = "build_failed";

// Metric name constants
pub const METRIC_SYNC_MESSAGE_BUILD_FAILURES_TOTAL: &str =
    "mailbridge_sync_message_build_failures_total";
pub const METRIC_SYNC_MESSAGES_APPLIED_TOTAL: &str = "mailbridge_sync_messages_applied_total";
pub const METRIC_SYNC_MESSAGES_SKIPPED_TOTAL: &str = "mailbridge_sync_messages_skipped_total";
pub const METRIC_SYNC_API_COOL_DOWN_TOTAL: &str = "mailbridge_sync_api_cool_down_total";
pub const METRIC_SYNC_DOWNLOAD_PARALLELISM: &str = "mailbridge_sync_download_parallelism";

pub static MAILBRIDGE_SYNC_MESSAGE_BUILD_FAILURES_TOTAL: LazyLock<IntCounterVec> =
    LazyLock::new(|| {
        register_int_counter_vec!(
            METRIC_SYNC_MESSAGE_BUILD_FAILURES_TOTAL,
            "Total number of messages that could not be built during sync, grouped by reason",
            &["reason"]
        )
        .expect("Failed to register mailbridge_sync_message_build_failures_total")
    });

pub static MAILBRIDGE_SYNC_MESSAGES_APPLIED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        METRIC_SYNC_MESSAGES_APPLIED_TOTAL,
        "Total number of built messages handed to the local store"
    )
    .expect("Failed to register mailbridge_sync_messages_applied_total")
});

pub static MAILBRIDGE_SYNC_MESSAGES_SKIPPED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        METRIC_SYNC_MESSAGES_SKIPPED_TOTAL,
        "Total number of messages skipped because the remote reported them as unprocessable"
    )
    .expect("Failed to register mailbridge_sync_messages_skipped_total")
});

pub static MAILBRIDGE_SYNC_API_COOL_DOWN_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        METRIC_SYNC_API_COOL_DOWN_TOTAL,
        "Total number of cool-down waits caused by throttled or failing API calls"
    )
    .expect("Failed to register mailbridge_sync_api_cool_down_total")
});

pub static MAILBRIDGE_SYNC_DOWNLOAD_PARALLELISM: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(
        METRIC_SYNC_DOWNLOAD_PARALLELISM,
        "Current number of parallel downloads chosen by the adaptive rate control"
    )
    .expect("Failed to register mailbridge_sync_download_parallelism")
});
