//! Controller capabilities
//!
//! The controllers are a fixed, closed set; these traits name the two
//! capabilities they exchange. `InsideWriter` delivers a packet to the host
//! OS through the TUN device, `OutsideWriter` emits datagrams onto the
//! underlay. Tests substitute capture implementations for both.

use std::net::SocketAddr;

use async_trait::async_trait;

use mesh_wire::VpnIp;

use crate::error::Result;

/// Delivers an IP packet to the host OS (the "inside" of the tunnel)
#[async_trait]
pub trait InsideWriter: Send + Sync {
    async fn write_inside(&self, packet: &[u8]) -> Result<()>;
}

/// Emits datagrams onto the underlay (the "outside" of the tunnel)
#[async_trait]
pub trait OutsideWriter: Send + Sync {
    /// Send an already-framed buffer to a specific underlay address
    async fn write_to_addr(&self, packet: &[u8], addr: SocketAddr) -> Result<()>;

    /// Frame a raw IP packet and route it to an overlay address
    async fn write_to_vip(&self, packet: &[u8], vip: VpnIp) -> Result<()>;
}

#[async_trait]
impl InsideWriter for mesh_tun::TunDevice {
    async fn write_inside(&self, packet: &[u8]) -> Result<()> {
        self.write(packet).await.map_err(Into::into)
    }
}
