//! Error types for mesh-tun

use std::io;
use thiserror::Error;

/// Result type alias for TUN device operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during TUN device operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Device creation error
    #[error("device creation error: {0}")]
    DeviceCreation(String),

    /// Route management error
    #[error("route error: {0}")]
    Route(String),

    /// Device has been closed
    #[error("device closed")]
    Closed,

    /// Operation not supported on this platform
    #[error("operation not supported: {0}")]
    NotSupported(String),
}

impl Error {
    /// Check if the error is a permission-related error
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied)
    }
}
