//! Outbound controller
//!
//! Owns the egress half of the data plane: frames packets read from the TUN
//! device and resolves their destination against the host map, falling back
//! to the first resolved lighthouse for unknown peers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use mesh_tun::TunDevice;
use mesh_wire::{Header, InnerPacket, UdpAddr, VpnIp, HEADER_LEN};

use crate::config::SharedConfig;
use crate::error::{Error, Result};
use crate::hostmap::{HostInfo, HostMap};
use crate::interfaces::OutsideWriter;

/// Egress controller: TUN → UDP
pub struct Outbound {
    socket: Arc<UdpSocket>,
    hosts: Arc<HostMap>,
    lighthouses: RwLock<Vec<Arc<HostInfo>>>,
    local_vpn_ip: VpnIp,
    counter: AtomicU64,
    config: SharedConfig,
    shutdown: AtomicBool,
}

impl Outbound {
    pub fn new(
        socket: Arc<UdpSocket>,
        hosts: Arc<HostMap>,
        local_vpn_ip: VpnIp,
        config: SharedConfig,
    ) -> Self {
        Self {
            socket,
            hosts,
            lighthouses: RwLock::new(Vec::new()),
            local_vpn_ip,
            counter: AtomicU64::new(0),
            config,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Publish the effective listen port, seed the host map from the static
    /// configuration, and resolve the lighthouse handles.
    pub async fn start(&self) -> Result<()> {
        let bound_port = self.socket.local_addr()?.port();
        {
            let mut config = self.config.write().unwrap();
            if config.listen.port == 0 {
                config.listen.port = bound_port;
            }
        }

        self.seed_static_host_map().await;
        self.resolve_lighthouses();

        log::info!(
            "outbound controller ready, local {} port {}",
            self.local_vpn_ip,
            bound_port
        );
        Ok(())
    }

    /// Resolve every `static_host_map` entry and add it to the host map.
    /// Entries that fail to parse or resolve are logged and skipped.
    async fn seed_static_host_map(&self) {
        let static_map = self.config.read().unwrap().static_host_map.clone();

        for (vip, endpoints) in static_map {
            let Some(endpoint) = endpoints.first() else {
                continue;
            };
            match resolve_endpoint(endpoint).await {
                Ok(addr) => {
                    self.hosts.add_host(vip, addr);
                    log::info!("static host {vip} at {addr}");
                }
                Err(e) => {
                    log::error!("skipping static host {vip}: {e}");
                }
            }
        }
    }

    /// Collect handles for the configured lighthouses. A lighthouse without a
    /// static host map entry cannot be used and is logged.
    fn resolve_lighthouses(&self) {
        let vips = self.config.read().unwrap().lighthouse.hosts.clone();
        let mut resolved = Vec::with_capacity(vips.len());
        for vip in vips {
            match self.hosts.query_vpn_ip(vip) {
                Some(info) => resolved.push(info),
                None => log::error!("lighthouse {vip} has no usable static host map entry"),
            }
        }
        *self.lighthouses.write().unwrap() = resolved;
    }

    /// The configured lighthouses that resolved to host map entries
    pub fn lighthouses(&self) -> Vec<Arc<HostInfo>> {
        self.lighthouses.read().unwrap().clone()
    }

    /// Next value of the monotonic send counter
    pub(crate) fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn check_running(&self) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    /// Latch the controller shut; subsequent writes fail with `Shutdown`
    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Send an already-framed buffer to a known underlay address
    pub async fn send_to_remote(&self, out: &[u8], addr: UdpAddr) -> Result<()> {
        self.check_running()?;
        self.socket.send_to(out, SocketAddr::from(addr)).await?;
        Ok(())
    }

    /// Frame `packet` as a Message and route it to `vip`
    async fn send_framed_message(&self, packet: &[u8], vip: VpnIp) -> Result<()> {
        let mut out = Vec::with_capacity(HEADER_LEN + packet.len());
        out.extend_from_slice(&Header::message(self.next_counter()).encode());
        out.extend_from_slice(packet);
        self.route(&out, vip).await
    }

    /// Route a framed buffer to `vip`: direct when the peer is known, else
    /// through the first resolved lighthouse, else `NoRoute`.
    async fn route(&self, out: &[u8], vip: VpnIp) -> Result<()> {
        self.check_running()?;

        if let Some(host) = self.hosts.query_vpn_ip(vip) {
            if let Some(remote) = host.remote() {
                log::debug!("egress {} -> {} via {}", self.local_vpn_ip, vip, remote);
                self.socket.send_to(out, SocketAddr::from(remote)).await?;
                return Ok(());
            }
        }

        // First configured lighthouse that resolved; the guard is released
        // before the send suspends.
        let fallback = self
            .lighthouses
            .read()
            .unwrap()
            .iter()
            .find_map(|lh| lh.remote().map(|remote| (lh.vpn_ip(), remote)));

        if let Some((lh_vip, remote)) = fallback {
            log::debug!(
                "egress {} -> {} redirected via lighthouse {} at {}",
                self.local_vpn_ip,
                vip,
                lh_vip,
                remote
            );
            self.socket.send_to(out, SocketAddr::from(remote)).await?;
            return Ok(());
        }

        Err(Error::NoRoute { vip })
    }

    /// Run the TUN-read → UDP-dispatch loop until shutdown or device close.
    /// TUN reads are strictly serial.
    pub async fn run(&self, tun: Arc<TunDevice>, shutdown: broadcast::Sender<()>) {
        let mut shutdown_rx = shutdown.subscribe();
        let mut buf = vec![0u8; usize::from(tun.mtu()) + HEADER_LEN];

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = tun.read(&mut buf) => match result {
                    Ok(0) => continue,
                    Ok(n) => {
                        let packet = &buf[..n];
                        let pk = match InnerPacket::parse(packet, false) {
                            Ok(pk) => pk,
                            Err(e) => {
                                log::debug!("dropping tun packet: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = self.send_framed_message(packet, pk.remote_ip).await {
                            log::warn!(
                                "egress drop {} -> {}: {}",
                                pk.local_ip,
                                pk.remote_ip,
                                e
                            );
                        }
                    }
                    Err(mesh_tun::Error::Closed) => break,
                    Err(e) => {
                        log::error!("tun read error: {e}");
                        break;
                    }
                }
            }
        }
        log::debug!("egress loop exited");
    }
}

#[async_trait]
impl OutsideWriter for Outbound {
    /// Send an already-framed buffer directly. Accepts any socket address
    /// shape for interop with generic I/O contracts; only the IP and port are
    /// used.
    async fn write_to_addr(&self, packet: &[u8], addr: SocketAddr) -> Result<()> {
        let addr = UdpAddr::try_from(addr)?;
        self.send_to_remote(packet, addr).await
    }

    async fn write_to_vip(&self, packet: &[u8], vip: VpnIp) -> Result<()> {
        self.send_framed_message(packet, vip).await
    }
}

/// Resolve one "host:port" endpoint to an IPv4 underlay address
async fn resolve_endpoint(endpoint: &str) -> Result<UdpAddr> {
    let mut addrs = tokio::net::lookup_host(endpoint)
        .await
        .map_err(|e| Error::Config(format!("cannot resolve {endpoint:?}: {e}")))?;
    addrs
        .find_map(|addr| UdpAddr::try_from(addr).ok())
        .ok_or_else(|| Error::Config(format!("{endpoint:?} has no IPv4 address")))
}
