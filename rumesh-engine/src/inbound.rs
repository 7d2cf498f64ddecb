//! Inbound controller
//!
//! Consumes datagrams the listener delivers and dispatches them by message
//! type: handshakes to the handshake engine, directory traffic to the
//! lighthouse controller, and Message frames through the three-way routing
//! decision (deliver locally, bounce, or learn-and-drop).

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use mesh_wire::{swap_addresses, Header, InnerPacket, MessageType, UdpAddr, VpnIp, PROTO_ICMP};

use crate::handshake::Handshake;
use crate::hostmap::HostMap;
use crate::interfaces::{InsideWriter, OutsideWriter};
use crate::lighthouse::Lighthouse;
use crate::listener::DatagramHandler;
use crate::outbound::Outbound;

/// Ingress controller: UDP → (TUN | lighthouse | handshake)
pub struct Inbound {
    hosts: Arc<HostMap>,
    inside: Arc<dyn InsideWriter>,
    outbound: Arc<Outbound>,
    handshake: Arc<Handshake>,
    lighthouse: Arc<Lighthouse>,
    local_vpn_ip: VpnIp,
    relay_bounce: bool,
}

impl Inbound {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hosts: Arc<HostMap>,
        inside: Arc<dyn InsideWriter>,
        outbound: Arc<Outbound>,
        handshake: Arc<Handshake>,
        lighthouse: Arc<Lighthouse>,
        local_vpn_ip: VpnIp,
        relay_bounce: bool,
    ) -> Self {
        Self {
            hosts,
            inside,
            outbound,
            handshake,
            lighthouse,
            local_vpn_ip,
            relay_bounce,
        }
    }

    async fn handle_message(&self, addr: UdpAddr, raw: &[u8], payload: &[u8]) {
        let pk = match InnerPacket::parse(payload, true) {
            Ok(pk) => pk,
            Err(e) => {
                log::debug!("dropping message from {addr}: {e}");
                return;
            }
        };

        // Address learning: any validly framed packet tells us where its
        // sender lives. Skip frames claiming to come from ourselves.
        if pk.remote_ip != self.local_vpn_ip {
            self.hosts.update_host(pk.remote_ip, addr);
        }

        if pk.local_ip == self.local_vpn_ip {
            // Local delivery: swap the inner addresses so the host OS sees a
            // response-shaped packet.
            let mut packet = payload.to_vec();
            swap_addresses(&mut packet);
            log::debug!(
                "ingress {} -> {} from {} delivered locally",
                pk.remote_ip,
                pk.local_ip,
                addr
            );
            if let Err(e) = self.inside.write_inside(&packet).await {
                log::error!("tun write failed for {} from {}: {}", pk.remote_ip, addr, e);
            }
            return;
        }

        if pk.remote_ip == self.local_vpn_ip {
            // Our own egress came back. Experimental relay behavior: deliver
            // non-ICMP payloads locally and re-emit the frame to its sender.
            if !self.relay_bounce {
                log::debug!("dropping looped packet from {addr}");
                return;
            }
            if pk.protocol != PROTO_ICMP {
                if let Err(e) = self.inside.write_inside(payload).await {
                    log::error!("tun write failed for bounce from {addr}: {e}");
                }
            }
            if let Err(e) = self.outbound.write_to_addr(raw, addr.into()).await {
                log::error!("bounce to {addr} failed: {e}");
            }
            return;
        }

        // Transit traffic is not forwarded; the sender was learned above.
        log::debug!(
            "dropping transit packet {} -> {} from {}",
            pk.remote_ip,
            pk.local_ip,
            addr
        );
    }
}

#[async_trait]
impl DatagramHandler for Inbound {
    async fn handle(&self, addr: SocketAddr, raw: &[u8], payload: &[u8], header: &Header) {
        let addr = match UdpAddr::try_from(addr) {
            Ok(addr) => addr,
            Err(e) => {
                log::debug!("dropping datagram: {e}");
                return;
            }
        };

        match header.message_type {
            MessageType::Handshake => {
                if let Err(e) = self.handshake.handle(addr, header, payload).await {
                    log::warn!("handshake from {addr} failed: {e}");
                }
            }
            MessageType::Message => self.handle_message(addr, raw, payload).await,
            MessageType::Lighthouse => {
                let pk = match InnerPacket::parse(payload, true) {
                    Ok(pk) => pk,
                    Err(e) => {
                        log::debug!("dropping lighthouse frame from {addr}: {e}");
                        return;
                    }
                };
                if pk.remote_ip != self.local_vpn_ip {
                    self.hosts.update_host(pk.remote_ip, addr);
                }
                if let Err(e) = self
                    .lighthouse
                    .handle_request(addr, pk.remote_ip, header, payload)
                    .await
                {
                    log::warn!("lighthouse request from {addr} failed: {e}");
                }
            }
            MessageType::Test => {
                log::debug!("test frame from {addr}");
            }
            MessageType::Unknown(t) => {
                log::trace!("ignoring message type {t} from {addr}");
            }
        }
    }
}
