use std::sync::Arc;
use thiserror::Error;

pub mod failure;

pub use failure::{ConnectionFailure, FailureKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Transport errors
    NetworkFailure,
    InvalidResponseBody,
    UnexpectedResponseCode,
    UnexpectedStreamElement,
    UnknownError,

    // Persistence errors
    StoreReadError,
    StoreWriteError,
    StoreInvalidData,
    IndexMalformed,

    // Synchronization errors
    SourceShutdown,
    SourcesExhausted,
    ManagerClosed,

    // Awaitable errors
    AwaitTimeout,
    AwaitAlreadyCompleted,

    // Configuration errors
    ConfigInvalid,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NetworkFailure => "NETWORK_FAILURE",
            ErrorCode::InvalidResponseBody => "INVALID_RESPONSE_BODY",
            ErrorCode::UnexpectedResponseCode => "UNEXPECTED_RESPONSE_CODE",
            ErrorCode::UnexpectedStreamElement => "UNEXPECTED_STREAM_ELEMENT_TYPE",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
            ErrorCode::StoreReadError => "STORE_READ_ERROR",
            ErrorCode::StoreWriteError => "STORE_WRITE_ERROR",
            ErrorCode::StoreInvalidData => "STORE_INVALID_DATA",
            ErrorCode::IndexMalformed => "INDEX_MALFORMED",
            ErrorCode::SourceShutdown => "SOURCE_SHUTDOWN",
            ErrorCode::SourcesExhausted => "SOURCES_EXHAUSTED",
            ErrorCode::ManagerClosed => "MANAGER_CLOSED",
            ErrorCode::AwaitTimeout => "AWAIT_TIMEOUT",
            ErrorCode::AwaitAlreadyCompleted => "AWAIT_ALREADY_COMPLETED",
            ErrorCode::ConfigInvalid => "CONFIG_INVALID",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkFailure
                | ErrorCode::InvalidResponseBody
                | ErrorCode::UnexpectedStreamElement
                | ErrorCode::UnknownError
                | ErrorCode::StoreReadError
                | ErrorCode::StoreWriteError
                | ErrorCode::AwaitTimeout
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error type shared by every layer of the sync core.
///
/// Cloning is cheap: the source is reference counted so one start outcome
/// can be handed to every caller waiting on it.
#[derive(Error, Debug, Clone)]
#[error("[{code}] {message}")]
pub struct SyncError {
    pub code: ErrorCode,
    pub message: String,
    /// HTTP status for `UnexpectedResponseCode` errors.
    pub status: Option<u16>,
    #[source]
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl SyncError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
            source: None,
        }
    }

    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
            source: Some(Arc::new(source)),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkFailure, message)
    }

    pub fn invalid_body(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidResponseBody, message)
    }

    /// An HTTP response with a status the transport did not expect.
    pub fn unexpected_response(status: u16) -> Self {
        Self {
            code: ErrorCode::UnexpectedResponseCode,
            message: format!("Unexpected response code: {}", status),
            status: Some(status),
            source: None,
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnknownError, message)
    }

    pub fn shutdown() -> Self {
        Self::new(ErrorCode::SourceShutdown, "Data source was shut down")
    }

    pub fn exhausted() -> Self {
        Self::new(
            ErrorCode::SourcesExhausted,
            "All data sources were exhausted without producing data",
        )
    }

    pub fn closed() -> Self {
        Self::new(ErrorCode::ManagerClosed, "Connectivity manager is shut down")
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigInvalid, message)
    }

    pub fn is_recoverable(&self) -> bool {
        match self.status {
            Some(status) => is_http_error_recoverable(status),
            None => self.code.is_recoverable(),
        }
    }

    pub fn is_store_error(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::StoreReadError
                | ErrorCode::StoreWriteError
                | ErrorCode::StoreInvalidData
                | ErrorCode::IndexMalformed
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::with_source(ErrorCode::StoreInvalidData, "Invalid JSON data", err)
    }
}

/// Whether a request that failed with `status` is worth retrying.
///
/// Client errors are permanent except for bad request, request timeout and
/// rate limiting.
pub fn is_http_error_recoverable(status: u16) -> bool {
    if (400..500).contains(&status) {
        matches!(status, 400 | 408 | 429)
    } else {
        true
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
