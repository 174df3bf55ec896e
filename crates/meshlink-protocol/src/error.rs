//! Error types for protocol operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid envelope format")]
    InvalidEnvelopeFormat,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid envelope kind: {0}")]
    InvalidEnvelopeKind(u8),

    #[error("Checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid message ID")]
    InvalidMessageId,

    #[error("Invalid peer ID: {0}")]
    InvalidPeerId(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("TTL exceeded")]
    TtlExceeded,

    #[error("Missing required field: {0}")]
    MissingField(String),
}
