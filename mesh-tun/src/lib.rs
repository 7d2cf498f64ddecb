//! Rumesh TUN layer
//!
//! Linux TUN device creation and configuration for the rumesh overlay. The
//! device presents raw IPv4 packets to the engine; routes for the overlay
//! subnet are pointed at the interface with link scope.

mod config;
mod device;
mod error;
pub mod linux;
mod route;

pub use config::{TunConfig, TunConfigBuilder, DEFAULT_MTU, DEFAULT_TX_QUEUE_LEN};
pub use device::TunDevice;
pub use error::{Error, Result};
pub use route::{Route, RouteManager};
