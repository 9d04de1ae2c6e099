//! Error taxonomy for the synchronization layer
//!
//! Every failure here is recovered at the subscription boundary and turned
//! into a `LoadState`; nothing is allowed to bubble up and take the host down.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Coarse classification of a [`SyncError`], stable across variants that
/// carry different payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    MalformedEvent,
    MalformedEntity,
    Timeout,
    Geocoding,
    Notification,
    Config,
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Channel failed to establish or dropped mid-stream.
    #[error("connection to {url} failed: {reason}")]
    Connection { url: String, reason: String },

    /// Payload failed to decode or failed required-field validation.
    #[error("malformed '{event}' event: {reason}")]
    MalformedEvent { event: String, reason: String },

    /// The backend answered but reported failure in its `EC`/`EM` envelope.
    #[error("backend error {code}: {message}")]
    Backend { code: i64, message: String },

    #[error("malformed entity: {0}")]
    MalformedEntity(String),

    /// No initial snapshot arrived before the readiness deadline.
    #[error("no data received within {0:?}")]
    Timeout(std::time::Duration),

    #[error("geocoding failed: {0}")]
    Geocoding(String),

    #[error("notification delivery failed: {0}")]
    Notification(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    pub fn connection(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connection { url: url.into(), reason: reason.to_string() }
    }

    pub fn malformed(event: impl Into<String>, reason: impl ToString) -> Self {
        Self::MalformedEvent { event: event.into(), reason: reason.to_string() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } | Self::Backend { .. } | Self::Http(_) => ErrorKind::Connection,
            Self::MalformedEvent { .. } | Self::Json(_) => ErrorKind::MalformedEvent,
            Self::MalformedEntity(_) => ErrorKind::MalformedEntity,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Geocoding(_) => ErrorKind::Geocoding,
            Self::Notification(_) => ErrorKind::Notification,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}
