//! Error types for the bulk request engine.

use serde::Serialize;
use thiserror::Error;

/// Result type alias using the broadside error type.
pub type Result<T> = std::result::Result<T, BroadsideError>;

/// Main error type for the bulk request engine.
///
/// Apart from [`BroadsideError::NoRequests`], every variant produced by the engine is a
/// per-slot outcome: it lands in the `errors` array of a [`crate::Batch`] and never aborts
/// sibling requests.
#[derive(Error, Debug)]
pub enum BroadsideError {
    /// The batch contained zero requests. Returned before any stage is started.
    #[error("no requests provided")]
    NoRequests,

    /// The request did not complete before the batch deadline, or was abandoned while the
    /// pipeline was shutting down.
    #[error("request ignored")]
    RequestIgnored,

    /// The transport failed for a reason other than the batch deadline.
    #[error("http client error: {0}")]
    Transport(String),

    /// The transport returned neither a response nor an error.
    #[error("no response received")]
    NoResponseReceived,

    /// A response was received but its body could not be read to the end.
    #[error("error while reading response body: {0}")]
    BodyRead(String),

    /// The request could not be built (bad URL, bad header, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Kind tag for a [`BroadsideError`], for comparing outcomes without matching payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoRequests,
    RequestIgnored,
    Transport,
    NoResponseReceived,
    BodyRead,
    InvalidRequest,
    Serialization,
    Other,
}

impl ErrorKind {
    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NoRequests => "no_requests",
            ErrorKind::RequestIgnored => "request_ignored",
            ErrorKind::Transport => "transport",
            ErrorKind::NoResponseReceived => "no_response_received",
            ErrorKind::BodyRead => "body_read",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BroadsideError {
    /// The kind tag of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BroadsideError::NoRequests => ErrorKind::NoRequests,
            BroadsideError::RequestIgnored => ErrorKind::RequestIgnored,
            BroadsideError::Transport(_) | BroadsideError::HttpClient(_) => ErrorKind::Transport,
            BroadsideError::NoResponseReceived => ErrorKind::NoResponseReceived,
            BroadsideError::BodyRead(_) => ErrorKind::BodyRead,
            BroadsideError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            BroadsideError::Serialization(_) => ErrorKind::Serialization,
            BroadsideError::Other(_) => ErrorKind::Other,
        }
    }

    pub fn is_request_ignored(&self) -> bool {
        matches!(self, BroadsideError::RequestIgnored)
    }
}
