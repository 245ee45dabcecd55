// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    // Client-side and configuration errors (10000–10999)
    InvalidParameter = 10000,
    MissingConfiguration = 10020,

    // Remote API errors (40000–40999)
    ApiCallFailed = 40030,
    ApiNotFound = 40040,
    ApiUnprocessable = 40050,
    TooManyRequest = 40060,
    ApiServerError = 40070,

    // Pipeline collaborator errors (50000–50999)
    StateProviderFailed = 50000,
    UpdateApplierFailed = 50010,
    KeyringUnlockFailed = 50020,
    MessageBuildFailed = 50030,

    // Lifecycle errors (60000–60999)
    Cancelled = 60000,
    NoMoreInput = 60010,

    // Internal system errors (70000–70999)
    InternalError = 70000,
}

impl ErrorCode {
    /// Maps a remote HTTP status onto the code the pipeline classifies on.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            404 => ErrorCode::ApiNotFound,
            422 => ErrorCode::ApiUnprocessable,
            429 => ErrorCode::TooManyRequest,
            500..=599 => ErrorCode::ApiServerError,
            _ => ErrorCode::ApiCallFailed,
        }
    }

    /// Throttling and server-side failures are retried by the rate-limited invoker.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ErrorCode::TooManyRequest | ErrorCode::ApiServerError)
    }
}
