//! Rumesh engine
//!
//! The packet forwarding and peer-discovery engine of the rumesh overlay:
//! the host map, the TUN⇄UDP bridge, the lighthouse directory, and the
//! host-sync handshake that bootstraps it all.

mod config;
mod engine;
mod error;
mod handshake;
mod hostmap;
mod inbound;
mod interfaces;
mod lighthouse;
mod listener;
mod outbound;

pub use config::{
    Config, ExperimentalConfig, LighthouseConfig, ListenConfig, LoggingConfig, RouteSettings,
    SharedConfig, TunSettings,
};
pub use engine::Engine;
pub use error::{Error, Result};
pub use handshake::{Handshake, MAX_RETRIES, RETRY_INTERVAL};
pub use hostmap::{ConnectionState, HostInfo, HostMap};
pub use inbound::Inbound;
pub use interfaces::{InsideWriter, OutsideWriter};
pub use lighthouse::Lighthouse;
pub use listener::{DatagramHandler, Listener, RECV_BUFFER_SIZE};
pub use outbound::Outbound;
