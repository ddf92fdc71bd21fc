//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when decoding or encoding events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The numeric state code is not in the state table.
    #[error("unknown device state code: {0}")]
    UnknownStateCode(u8),

    /// The state name is not in the state table.
    #[error("unknown device state name: {0}")]
    UnknownStateName(String),

    /// The numeric signal code is not a known opcode.
    #[error("unknown signal code: {0}")]
    UnknownSignal(u16),

    /// The event payload is invalid.
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
