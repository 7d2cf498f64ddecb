//! Error types for the engine

use mesh_wire::VpnIp;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse the configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to bind the UDP listener
    #[error("failed to bind listener: {0}")]
    Bind(std::io::Error),

    /// Wire codec error
    #[error("wire error: {0}")]
    Wire(#[from] mesh_wire::Error),

    /// TUN device error
    #[error("TUN error: {0}")]
    Tun(#[from] mesh_tun::Error),

    /// Egress destination resolves to neither a peer nor a lighthouse
    #[error("no route to {vip}")]
    NoRoute { vip: VpnIp },

    /// Host-sync retries exhausted; the peer is unreachable
    #[error("handshake with {vip} timed out")]
    HandshakeTimeout { vip: VpnIp },

    /// The engine has been shut down
    #[error("shutdown")]
    Shutdown,

    /// The engine is already running
    #[error("engine is already running")]
    AlreadyRunning,
}

impl Error {
    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }
}
