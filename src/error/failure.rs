//! User-facing connection failures.
//!
//! Transport-level signals never reach callers directly. Whatever a data
//! source reports is normalized into one of a closed set of failure kinds
//! and attached to the connection information.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use super::{is_http_error_recoverable, ErrorCode, SyncError};

/// Closed classification of connection failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    NetworkFailure,
    InvalidResponseBody,
    UnexpectedResponseCode { status: u16, retryable: bool },
    UnexpectedStreamElementType,
    UnknownError,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NetworkFailure => "NETWORK_FAILURE",
            FailureKind::InvalidResponseBody => "INVALID_RESPONSE_BODY",
            FailureKind::UnexpectedResponseCode { .. } => "UNEXPECTED_RESPONSE_CODE",
            FailureKind::UnexpectedStreamElementType => "UNEXPECTED_STREAM_ELEMENT_TYPE",
            FailureKind::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Build the response-code kind, deriving retryability from the status.
    pub fn unexpected_response(status: u16) -> Self {
        FailureKind::UnexpectedResponseCode {
            status,
            retryable: is_http_error_recoverable(status),
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A classified failure with its diagnostic cause.
///
/// The cause is kept for the lifetime of the process only; persisted copies
/// carry the kind and message.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ConnectionFailure {
    #[serde(flatten)]
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip)]
    #[source]
    pub cause: Option<Arc<SyncError>>,
}

impl ConnectionFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Map an error reported by a data source onto the failure taxonomy.
    pub fn classify(error: &SyncError) -> Self {
        let kind = match error.code {
            ErrorCode::NetworkFailure => FailureKind::NetworkFailure,
            ErrorCode::InvalidResponseBody | ErrorCode::StoreInvalidData => {
                FailureKind::InvalidResponseBody
            }
            ErrorCode::UnexpectedResponseCode => match error.status {
                Some(status) => FailureKind::unexpected_response(status),
                None => FailureKind::UnknownError,
            },
            ErrorCode::UnexpectedStreamElement => FailureKind::UnexpectedStreamElementType,
            _ => FailureKind::UnknownError,
        };
        Self {
            kind,
            message: error.message.clone(),
            cause: Some(Arc::new(error.clone())),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self.kind {
            FailureKind::UnexpectedResponseCode { retryable, .. } => retryable,
            FailureKind::UnknownError => false,
            _ => true,
        }
    }
}

impl PartialEq for ConnectionFailure {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.message == other.message
    }
}
