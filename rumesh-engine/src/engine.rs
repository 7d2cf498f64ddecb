//! Engine supervisor
//!
//! Builds the device, listener, and controllers, runs the long-lived task
//! set, and tears everything down on the shutdown signal: workers first, then
//! the UDP sockets, and the TUN device last so in-flight ingress drains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;

use mesh_tun::{RouteManager, TunDevice};

use crate::config::{Config, SharedConfig};
use crate::error::{Error, Result};
use crate::handshake::Handshake;
use crate::hostmap::HostMap;
use crate::inbound::Inbound;
use crate::lighthouse::Lighthouse;
use crate::listener::Listener;
use crate::outbound::Outbound;

/// How long the task set gets to observe the shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// The packet forwarding and peer-discovery engine
pub struct Engine {
    config: SharedConfig,
    shutdown_tx: Option<broadcast::Sender<()>>,
    running: Arc<AtomicBool>,
}

impl Engine {
    /// Create an engine from a validated configuration
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            shutdown_tx: None,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The shared configuration. The effective listen port is visible here
    /// once the engine has started.
    pub fn config(&self) -> SharedConfig {
        self.config.clone()
    }

    /// The effective listen port (non-zero once the listener is bound)
    pub fn listen_port(&self) -> u16 {
        self.config.read().unwrap().listen.port
    }

    /// Create a shutdown handle before starting the engine, so a caller can
    /// stop it after moving it into a task.
    pub fn create_shutdown_handle(&mut self) -> broadcast::Sender<()> {
        let (tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(tx.clone());
        tx
    }

    /// The shutdown handle, if one exists yet
    pub fn shutdown_handle(&self) -> Option<broadcast::Sender<()>> {
        self.shutdown_tx.clone()
    }

    /// Signal the engine to shut down
    pub fn stop(&self) {
        if let Some(tx) = &self.shutdown_tx {
            let _ = tx.send(());
        }
    }

    /// Run the engine until the shutdown signal fires.
    ///
    /// Device setup errors and bind errors surface before any task starts;
    /// per-packet errors never end the run.
    pub async fn run(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        let result = self.run_inner().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        let shutdown_tx = match &self.shutdown_tx {
            Some(tx) => tx.clone(),
            None => self.create_shutdown_handle(),
        };
        // Subscribe before anything can fire the signal
        let mut shutdown_rx = shutdown_tx.subscribe();

        let cfg = self.config.read().unwrap().clone();
        let local_vpn_ip = cfg.local_vpn_ip();

        // Device first: nothing else is worth doing if we cannot get a tun
        let tun = Arc::new(TunDevice::create(cfg.tun_config()?)?);

        let routes = RouteManager::new(tun.name(), tun.mtu())?;
        let overlay_route = mesh_tun::Route::new(cfg.tun.cidr.trunc()).with_mtu(tun.mtu());
        routes.add(&overlay_route).await?;
        for settings in &cfg.tun.routes {
            let mut route = mesh_tun::Route::new(settings.cidr).with_mtu(settings.mtu);
            route.metric = settings.metric;
            route.install = settings.install;
            routes.add(&route).await?;
        }

        let listener = Listener::bind(
            cfg.listen.host_addr()?,
            cfg.listen.port,
            cfg.listen.routines,
            cfg.listen.batch,
        )?;

        let hosts = Arc::new(HostMap::new());
        let outbound = Arc::new(Outbound::new(
            listener.writer(),
            hosts.clone(),
            local_vpn_ip,
            self.config.clone(),
        ));
        outbound.start().await?;

        let handshake = Arc::new(Handshake::new(hosts.clone(), outbound.clone(), local_vpn_ip));
        let lighthouse = Arc::new(Lighthouse::new(
            cfg.lighthouse.am_lighthouse,
            cfg.lighthouse.hosts.clone(),
            Duration::from_secs(cfg.lighthouse.interval),
            hosts.clone(),
            outbound.clone(),
            local_vpn_ip,
        ));
        let inbound = Arc::new(Inbound::new(
            hosts.clone(),
            tun.clone(),
            outbound.clone(),
            handshake.clone(),
            lighthouse.clone(),
            local_vpn_ip,
            cfg.experimental.relay_bounce,
        ));

        let mut tasks = listener.spawn_workers(inbound.clone(), &shutdown_tx);

        {
            let outbound = outbound.clone();
            let tun = tun.clone();
            let shutdown = shutdown_tx.clone();
            tasks.push(tokio::spawn(async move {
                outbound.run(tun, shutdown).await;
            }));
        }

        {
            let lighthouse = lighthouse.clone();
            let handshake = handshake.clone();
            let shutdown = shutdown_tx.clone();
            tasks.push(tokio::spawn(async move {
                lighthouse.run_refresher(handshake, shutdown).await;
            }));
        }

        log::info!(
            "engine running: local {} on {} ({} known host(s))",
            local_vpn_ip,
            listener.local_addr(),
            hosts.len()
        );

        let _ = shutdown_rx.recv().await;
        log::info!("shutdown requested");

        // Latch the egress side so late callers see Shutdown
        outbound.shut_down();

        let abort_handles: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            log::warn!("task set did not exit within grace period; aborting");
            for handle in abort_handles {
                handle.abort();
            }
        }

        // Close the UDP side before the TUN device: dropping the last socket
        // handles closes the sockets, and the device goes last so pending
        // ingress writes drain.
        drop(inbound);
        drop(lighthouse);
        drop(handshake);
        drop(outbound);
        drop(listener);
        tun.close();

        log::info!("engine stopped");
        Ok(())
    }
}
