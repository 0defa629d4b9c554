//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when decoding feed events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The event type is unknown.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The event payload is invalid.
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A feed line exceeded the maximum length and was discarded.
    #[error("feed line too long: {len} bytes (max {max})")]
    LineTooLong { len: usize, max: usize },

    /// A feed line was not valid UTF-8.
    #[error("feed line is not valid UTF-8")]
    InvalidUtf8,
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
