// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::raise_error;
use code::ErrorCode;
use snafu::{Location, Snafu};

pub mod code;

#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum SyncError {
    #[snafu(display("{message}"))]
    Generic {
        message: String,
        #[snafu(implicit)]
        location: Location,
        code: ErrorCode,
    },
}

pub type SyncResult<T, E = SyncError> = std::result::Result<T, E>;

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Generic { code, .. } => *code,
        }
    }

    /// Builds the error a remote call returns for a non-success HTTP status.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        raise_error!(message.into(), ErrorCode::from_http_status(status))
    }

    pub fn cancelled() -> Self {
        raise_error!("operation cancelled".into(), ErrorCode::Cancelled)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.code().is_rate_limited()
    }

    pub fn is_unprocessable(&self) -> bool {
        self.code() == ErrorCode::ApiUnprocessable
    }

    pub fn is_cancelled(&self) -> bool {
        self.code() == ErrorCode::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_classification() {
        assert!(SyncError::from_http_status(429, "slow down").is_rate_limited());
        assert!(SyncError::from_http_status(503, "unavailable").is_rate_limited());
        assert!(SyncError::from_http_status(422, "gone").is_unprocessable());
        assert!(!SyncError::from_http_status(422, "gone").is_rate_limited());
        assert_eq!(
            SyncError::from_http_status(401, "unauthorized").code(),
            ErrorCode::ApiCallFailed
        );
        assert!(SyncError::cancelled().is_cancelled());
    }

    #[test]
    fn display_shows_message() {
        let err = raise_error!("boom".into(), ErrorCode::InternalError);
        assert_eq!(err.to_string(), "boom");
    }
}
