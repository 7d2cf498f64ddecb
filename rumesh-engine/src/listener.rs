//! UDP listener
//!
//! Binds the underlay socket and runs the reader tasks. With
//! `listen.routines > 1` each reader owns its own SO_REUSEPORT socket, so the
//! kernel fans incoming datagrams out across them; writes may go through any
//! of the sockets.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use mesh_wire::{Header, HEADER_LEN};

use crate::error::{Error, Result};

/// Size of one receive buffer; comfortably above the largest framed packet
pub const RECV_BUFFER_SIZE: usize = 2048;

/// Per-datagram dispatch callback.
///
/// `raw` is the whole datagram, `payload` the bytes after the framing header.
/// Implementations are invoked concurrently from multiple reader tasks.
#[async_trait]
pub trait DatagramHandler: Send + Sync {
    async fn handle(&self, addr: SocketAddr, raw: &[u8], payload: &[u8], header: &Header);
}

/// The bound underlay socket set
pub struct Listener {
    sockets: Vec<Arc<UdpSocket>>,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind `routines` sockets on `host:port`.
    ///
    /// With `port` 0 the OS assigns a port on the first bind and the
    /// remaining sockets reuse it; [`Listener::local_addr`] reports the
    /// effective address.
    pub fn bind(host: IpAddr, port: u16, routines: usize, batch: usize) -> Result<Self> {
        let routines = routines.max(1);
        let mut sockets = Vec::with_capacity(routines);
        let mut bind_port = port;

        for _ in 0..routines {
            let socket = bind_socket(SocketAddr::new(host, bind_port), routines > 1, batch)?;
            if bind_port == 0 {
                bind_port = socket.local_addr().map_err(Error::Bind)?.port();
            }
            sockets.push(Arc::new(socket));
        }

        let local_addr = sockets[0].local_addr().map_err(Error::Bind)?;
        log::info!("listening on {} ({} reader(s))", local_addr, routines);

        Ok(Self {
            sockets,
            local_addr,
        })
    }

    /// The bound address; the port is never 0 here
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A socket handle for egress writers
    pub fn writer(&self) -> Arc<UdpSocket> {
        self.sockets[0].clone()
    }

    /// Spawn one reader task per socket. Each task decodes the framing
    /// header, drops undecodable datagrams, and hands the rest to `handler`.
    /// Tasks exit on the shutdown signal or on a socket error.
    pub fn spawn_workers(
        &self,
        handler: Arc<dyn DatagramHandler>,
        shutdown: &broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        self.sockets
            .iter()
            .enumerate()
            .map(|(worker, socket)| {
                let socket = socket.clone();
                let handler = handler.clone();
                let mut shutdown_rx = shutdown.subscribe();

                tokio::spawn(async move {
                    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
                    loop {
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            result = socket.recv_from(&mut buf) => match result {
                                Ok((n, addr)) => {
                                    let raw = &buf[..n];
                                    let header = match Header::decode(raw) {
                                        Ok(header) => header,
                                        Err(e) => {
                                            log::debug!("dropping datagram from {addr}: {e}");
                                            continue;
                                        }
                                    };
                                    handler.handle(addr, raw, &raw[HEADER_LEN..], &header).await;
                                }
                                Err(e) => {
                                    log::error!("udp worker {worker} recv error: {e}");
                                    break;
                                }
                            }
                        }
                    }
                    log::debug!("udp worker {worker} exited");
                })
            })
            .collect()
    }
}

fn bind_socket(addr: SocketAddr, reuse_port: bool, batch: usize) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(Error::Bind)?;
    socket.set_reuse_address(true).map_err(Error::Bind)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true).map_err(Error::Bind)?;
    }
    if batch > 0 {
        // Best effort; the kernel clamps to its own limits
        let _ = socket.set_recv_buffer_size(batch * RECV_BUFFER_SIZE);
    }
    socket.set_nonblocking(true).map_err(Error::Bind)?;
    socket.bind(&addr.into()).map_err(Error::Bind)?;

    UdpSocket::from_std(socket.into()).map_err(Error::Bind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl DatagramHandler for CountingHandler {
        async fn handle(&self, _addr: SocketAddr, raw: &[u8], payload: &[u8], header: &Header) {
            assert_eq!(raw.len(), HEADER_LEN + payload.len());
            assert_eq!(header.message_type, mesh_wire::MessageType::Test);
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_dynamic_port_bind() {
        let listener = Listener::bind("127.0.0.1".parse().unwrap(), 0, 1, 64).unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_and_framing_drop() {
        let listener = Listener::bind("127.0.0.1".parse().unwrap(), 0, 1, 64).unwrap();
        let addr = listener.local_addr();

        let handler = Arc::new(CountingHandler {
            seen: AtomicUsize::new(0),
        });
        let (shutdown_tx, _) = broadcast::channel(1);
        let workers = listener.spawn_workers(handler.clone(), &shutdown_tx);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // One valid frame...
        let mut frame = Header::new(mesh_wire::MessageType::Test, 0, 1).encode().to_vec();
        frame.extend_from_slice(b"ping");
        sender.send_to(&frame, addr).await.unwrap();

        // ...and two that must be dropped by the framing check
        sender.send_to(b"short", addr).await.unwrap();
        let mut bad = frame.clone();
        bad[0] = 9;
        sender.send_to(&bad, addr).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(handler.seen.load(Ordering::SeqCst), 1);

        let _ = shutdown_tx.send(());
        for worker in workers {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), worker).await;
        }
    }
}
