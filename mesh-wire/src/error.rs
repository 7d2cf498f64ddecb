//! Error types for the wire codec

use thiserror::Error;

/// Result type alias for wire codec operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while encoding or decoding wire data
#[derive(Debug, Error)]
pub enum Error {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    ShortPacket { expected: usize, actual: usize },

    #[error("bad header: {0}")]
    BadHeader(String),

    #[error("bad address: {0}")]
    BadAddress(String),

    #[error("directory encoding error: {0}")]
    Directory(#[from] serde_json::Error),
}
