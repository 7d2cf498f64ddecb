//! Lighthouse controller
//!
//! A lighthouse serves the directory of known peers; every other node queries
//! one. The controller also runs the periodic refresher that keeps a client's
//! host map warm via host-sync.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, Notify};

use mesh_wire::{
    build_ipv4_stub, Directory, Header, LighthouseOp, UdpAddr, VpnIp, HEADER_LEN,
    IPV4_HEADER_LEN, PROTO_UDP,
};

use crate::error::{Error, Result};
use crate::handshake::{Handshake, MAX_RETRIES, RETRY_INTERVAL};
use crate::hostmap::{HostInfo, HostMap};
use crate::interfaces::OutsideWriter;
use crate::outbound::Outbound;

/// Directory controller, in both its server and client roles
pub struct Lighthouse {
    am_lighthouse: bool,
    hosts: Arc<HostMap>,
    outbound: Arc<Outbound>,
    local_vpn_ip: VpnIp,
    /// Overlay addresses of the lighthouses this node queries
    lighthouse_vips: Vec<VpnIp>,
    refresh_interval: Duration,
    /// Queries blocked on a directory reply, keyed by the queried address
    waiters: Mutex<HashMap<VpnIp, Arc<Notify>>>,
}

impl Lighthouse {
    pub fn new(
        am_lighthouse: bool,
        lighthouse_vips: Vec<VpnIp>,
        refresh_interval: Duration,
        hosts: Arc<HostMap>,
        outbound: Arc<Outbound>,
        local_vpn_ip: VpnIp,
    ) -> Self {
        Self {
            am_lighthouse,
            hosts,
            outbound,
            local_vpn_ip,
            lighthouse_vips,
            refresh_interval,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Whether this node serves the directory itself
    pub fn is_lighthouse(&self) -> bool {
        self.am_lighthouse
    }

    /// Insert a peer into the directory, as if learned directly
    pub fn store(&self, info: &HostInfo) {
        match info.remote() {
            Some(remote) => {
                self.hosts.add_host(info.vpn_ip(), remote);
            }
            None => log::debug!("not storing {} without a remote", info.vpn_ip()),
        }
    }

    /// Look up `vip`.
    ///
    /// A lighthouse consults its own map. A client sends a directory lookup
    /// to its first resolved lighthouse and blocks until a reply populates
    /// the map, retrying with the handshake discipline; exhaustion surfaces
    /// [`Error::HandshakeTimeout`] ("peer unreachable").
    pub async fn query(&self, vip: VpnIp) -> Result<Arc<HostInfo>> {
        if let Some(info) = self.hosts.query_vpn_ip(vip) {
            return Ok(info);
        }
        if self.am_lighthouse {
            return Err(Error::NoRoute { vip });
        }

        let lighthouse_addr = self
            .lighthouse_vips
            .iter()
            .find_map(|lh| self.hosts.query_vpn_ip(*lh).and_then(|info| info.remote()))
            .ok_or(Error::NoRoute { vip })?;

        let notify = self
            .waiters
            .lock()
            .unwrap()
            .entry(vip)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();

        let result: Result<()> = async {
            for attempt in 1..=MAX_RETRIES {
                self.send_query(vip, lighthouse_addr).await?;
                match tokio::time::timeout(RETRY_INTERVAL, notify.notified()).await {
                    Ok(()) => return Ok(()),
                    Err(_) => {
                        log::debug!("lighthouse query attempt {attempt}/{MAX_RETRIES} for {vip} timed out")
                    }
                }
            }
            Ok(())
        }
        .await;

        self.waiters.lock().unwrap().remove(&vip);
        result?;

        self.hosts
            .query_vpn_ip(vip)
            .ok_or(Error::HandshakeTimeout { vip })
    }

    async fn send_query(&self, vip: VpnIp, lighthouse: UdpAddr) -> Result<()> {
        let header = Header::lighthouse(LighthouseOp::Query, self.outbound.next_counter());
        let mut out = Vec::with_capacity(HEADER_LEN + IPV4_HEADER_LEN);
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&build_ipv4_stub(self.local_vpn_ip, vip, PROTO_UDP));
        self.outbound.write_to_addr(&out, lighthouse.into()).await
    }

    /// Handle an inbound Lighthouse frame from `src_vip` at `addr`.
    ///
    /// On a lighthouse a query is answered with the currently-known entries;
    /// on a client a reply's entries are ingested as authoritative hints.
    pub async fn handle_request(
        &self,
        addr: UdpAddr,
        src_vip: VpnIp,
        header: &Header,
        payload: &[u8],
    ) -> Result<()> {
        match LighthouseOp::try_from(header.message_subtype)? {
            LighthouseOp::Query => {
                if !self.am_lighthouse {
                    log::debug!("ignoring directory query from {src_vip} at {addr}: not a lighthouse");
                    return Ok(());
                }
                self.hosts.update_host(src_vip, addr);

                let directory = self.hosts.directory();
                log::info!(
                    "directory query from {} at {}, replying with {} host(s)",
                    src_vip,
                    addr,
                    directory.len()
                );

                let reply_header =
                    Header::lighthouse(LighthouseOp::Reply, self.outbound.next_counter());
                let blob = directory.encode()?;
                let mut out = Vec::with_capacity(HEADER_LEN + IPV4_HEADER_LEN + blob.len());
                out.extend_from_slice(&reply_header.encode());
                out.extend_from_slice(&build_ipv4_stub(self.local_vpn_ip, src_vip, PROTO_UDP));
                out.extend_from_slice(&blob);
                self.outbound.write_to_addr(&out, addr.into()).await?;
            }
            LighthouseOp::Reply => {
                if payload.len() < IPV4_HEADER_LEN {
                    return Err(Error::Wire(mesh_wire::Error::ShortPacket {
                        expected: IPV4_HEADER_LEN,
                        actual: payload.len(),
                    }));
                }
                let directory = Directory::decode(&payload[IPV4_HEADER_LEN..])?;
                log::debug!(
                    "directory reply from {} at {} with {} host(s)",
                    src_vip,
                    addr,
                    directory.len()
                );

                for (vip, entry) in directory.iter() {
                    if *vip == self.local_vpn_ip {
                        continue;
                    }
                    let Some(remote) = entry.remote else { continue };
                    self.hosts.update_host(*vip, remote);

                    if let Some(notify) = self.waiters.lock().unwrap().get(vip) {
                        notify.notify_one();
                    }
                }
            }
        }
        Ok(())
    }

    /// Periodic refresher: host-sync with every configured lighthouse on the
    /// configured interval. Does nothing on a lighthouse.
    pub async fn run_refresher(&self, handshake: Arc<Handshake>, shutdown: broadcast::Sender<()>) {
        if self.am_lighthouse || self.lighthouse_vips.is_empty() {
            return;
        }

        let mut shutdown_rx = shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.refresh_interval);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    for vip in &self.lighthouse_vips {
                        let Some(addr) = self
                            .hosts
                            .query_vpn_ip(*vip)
                            .and_then(|info| info.remote())
                        else {
                            continue;
                        };
                        match handshake.host_sync(*vip, addr).await {
                            Ok(()) => {}
                            Err(Error::Shutdown) => return,
                            Err(e) => log::warn!("lighthouse refresh for {vip} failed: {e}"),
                        }
                    }
                }
            }
        }
        log::debug!("lighthouse refresher exited");
    }
}
