// Error type for wire-level failures.

use thiserror::Error;

pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("{what}: expected {expected} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{what}: unexpected length {actual}")]
    BadLength { what: &'static str, actual: usize },

    #[error("unknown stream type {0}")]
    UnknownStreamType(i32),

    #[error("unknown character stream command {0}")]
    UnknownCharacterCommand(i32),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when the error came from the transport rather than the bytes.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProtocolError::Io(_))
    }
}
