//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering wire encode/decode failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize a message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a message.
    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}
