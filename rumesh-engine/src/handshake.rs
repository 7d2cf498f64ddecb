//! Host-sync handshake engine
//!
//! A two-message exchange bootstraps the host map: a node sends HostSync to a
//! peer (typically a lighthouse) and receives HostSyncReply carrying the
//! peer's directory. Per remote the initiator side is a small state machine,
//! Idle → AwaitingReply, completed by the reply or a bounded retry timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use mesh_wire::{
    build_ipv4_stub, Directory, HandshakeStage, Header, InnerPacket, UdpAddr, VpnIp, HEADER_LEN,
    IPV4_HEADER_LEN, PROTO_UDP,
};

use crate::error::{Error, Result};
use crate::hostmap::HostMap;
use crate::interfaces::OutsideWriter;
use crate::outbound::Outbound;

/// Attempts before a host-sync is declared failed
pub const MAX_RETRIES: u32 = 3;

/// Fixed backoff between attempts
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Handshake controller
pub struct Handshake {
    hosts: Arc<HostMap>,
    outbound: Arc<Outbound>,
    local_vpn_ip: VpnIp,
    /// Remotes with a HostSync in flight; the notify completes the wait
    pending: Mutex<HashMap<VpnIp, Arc<Notify>>>,
}

impl Handshake {
    pub fn new(hosts: Arc<HostMap>, outbound: Arc<Outbound>, local_vpn_ip: VpnIp) -> Self {
        Self {
            hosts,
            outbound,
            local_vpn_ip,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Ask `vip` at `addr` for its view of the mesh and wait for the reply.
    ///
    /// Retries up to [`MAX_RETRIES`] times with [`RETRY_INTERVAL`] backoff;
    /// on exhaustion surfaces [`Error::HandshakeTimeout`] and leaves any
    /// previously-known host state untouched.
    pub async fn host_sync(&self, vip: VpnIp, addr: UdpAddr) -> Result<()> {
        let notify = self
            .pending
            .lock()
            .unwrap()
            .entry(vip)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();

        let result = async {
            for attempt in 1..=MAX_RETRIES {
                self.send_host_sync(vip, addr).await?;
                match tokio::time::timeout(RETRY_INTERVAL, notify.notified()).await {
                    Ok(()) => {
                        log::info!("host-sync with {vip} complete");
                        return Ok(());
                    }
                    Err(_) => {
                        log::debug!("host-sync attempt {attempt}/{MAX_RETRIES} to {vip} at {addr} timed out");
                    }
                }
            }
            Err(Error::HandshakeTimeout { vip })
        }
        .await;

        self.pending.lock().unwrap().remove(&vip);
        result
    }

    async fn send_host_sync(&self, vip: VpnIp, addr: UdpAddr) -> Result<()> {
        let header = Header::handshake(HandshakeStage::HostSync, self.outbound.next_counter());
        let mut out = Vec::with_capacity(HEADER_LEN + IPV4_HEADER_LEN);
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&build_ipv4_stub(self.local_vpn_ip, vip, PROTO_UDP));
        self.outbound.write_to_addr(&out, addr.into()).await
    }

    /// Handle an inbound Handshake frame. `payload` is everything after the
    /// framing header: the IPv4 stub, then (for replies) the directory blob.
    pub async fn handle(&self, addr: UdpAddr, header: &Header, payload: &[u8]) -> Result<()> {
        let pk = InnerPacket::parse(payload, true)?;

        // The stub's source names the sender; learn it before anything else
        self.hosts.add_host(pk.remote_ip, addr);

        match HandshakeStage::try_from(header.message_subtype)? {
            HandshakeStage::HostSync => {
                let directory = self.hosts.directory();
                log::info!(
                    "host-sync request from {} at {}, replying with {} host(s)",
                    pk.remote_ip,
                    addr,
                    directory.len()
                );
                let reply = self.build_reply(pk.remote_ip, &directory)?;
                self.outbound.write_to_addr(&reply, addr.into()).await?;
            }
            HandshakeStage::HostSyncReply => {
                if payload.len() < IPV4_HEADER_LEN {
                    return Err(Error::Wire(mesh_wire::Error::ShortPacket {
                        expected: IPV4_HEADER_LEN,
                        actual: payload.len(),
                    }));
                }
                let directory = Directory::decode(&payload[IPV4_HEADER_LEN..])?;
                log::info!(
                    "host-sync reply from {} at {} with {} host(s)",
                    pk.remote_ip,
                    addr,
                    directory.len()
                );
                self.ingest(&directory);

                if let Some(notify) = self.pending.lock().unwrap().get(&pk.remote_ip) {
                    notify.notify_one();
                }
            }
        }
        Ok(())
    }

    fn build_reply(&self, initiator: VpnIp, directory: &Directory) -> Result<Vec<u8>> {
        let header = Header::handshake(HandshakeStage::HostSyncReply, self.outbound.next_counter());
        let blob = directory.encode()?;
        let mut out = Vec::with_capacity(HEADER_LEN + IPV4_HEADER_LEN + blob.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&build_ipv4_stub(self.local_vpn_ip, initiator, PROTO_UDP));
        out.extend_from_slice(&blob);
        Ok(out)
    }

    /// Fold a received directory into the host map, dropping entries that
    /// name this node and entries without a remote.
    fn ingest(&self, directory: &Directory) {
        for (vip, entry) in directory.iter() {
            if *vip == self.local_vpn_ip {
                continue;
            }
            let Some(remote) = entry.remote else { continue };
            self.hosts.update_host(*vip, remote);
            log::debug!("learned {vip} at {remote} from host-sync");
        }
    }
}
