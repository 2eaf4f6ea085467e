//! Error types for framing and document encoding.

use thiserror::Error;

/// Result type alias for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors raised while framing, unframing, or (de)serializing documents.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("truncated message: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("invalid message length {0}")]
    InvalidLength(i64),

    #[error("unknown opcode {0}")]
    UnknownOpCode(i32),

    #[error("unsupported message layout: {0}")]
    Unsupported(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        WireError::Io(err.to_string())
    }
}
