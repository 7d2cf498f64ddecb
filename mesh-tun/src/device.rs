//! Async TUN device
//!
//! Wraps the non-blocking tun fd in tokio's `AsyncFd` so the engine's read
//! and write loops are plain async calls. One `read` returns one IP packet;
//! `write` loops until the whole packet has been accepted by the kernel.

use std::io;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use ipnet::Ipv4Net;
use tokio::io::unix::AsyncFd;

use crate::config::TunConfig;
use crate::error::{Error, Result};
use crate::linux;

struct TunFd {
    fd: RawFd,
    closed: AtomicBool,
}

impl TunFd {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // SAFETY: the fd was opened by us and is closed exactly once
            unsafe { libc::close(self.fd) };
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::os::fd::AsRawFd for TunFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TunFd {
    fn drop(&mut self) {
        self.close();
    }
}

/// A configured, up-and-running Linux TUN device
pub struct TunDevice {
    inner: AsyncFd<TunFd>,
    name: String,
    cidr: Ipv4Net,
    mtu: u16,
}

impl TunDevice {
    /// Create the device and configure it per `config`.
    ///
    /// Requires root or `CAP_NET_ADMIN`.
    pub fn create(config: TunConfig) -> Result<Self> {
        config.validate()?;

        let (fd, name) = linux::open_tun(&config.name, config.multiqueue)?;
        let tun_fd = TunFd {
            fd,
            closed: AtomicBool::new(false),
        };

        linux::configure(
            &name,
            config.local_addr(),
            config.cidr.netmask(),
            config.mtu,
            config.tx_queue_len,
        )?;

        let inner = AsyncFd::new(tun_fd).map_err(Error::Io)?;

        log::info!(
            "created tun device {} addr {} mtu {}",
            name,
            config.cidr,
            config.mtu
        );

        Ok(Self {
            inner,
            name,
            cidr: config.cidr,
            mtu: config.mtu,
        })
    }

    /// Interface name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interface MTU
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// The overlay subnet the device carries, host address included
    pub fn cidr(&self) -> Ipv4Net {
        self.cidr
    }

    /// This node's overlay address
    pub fn local_addr(&self) -> Ipv4Addr {
        self.cidr.addr()
    }

    /// Read one IP packet from the device
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if self.inner.get_ref().is_closed() {
                return Err(Error::Closed);
            }
            let mut guard = self.inner.readable().await.map_err(Error::Io)?;
            match guard.try_io(|inner| {
                let fd = inner.get_ref().fd;
                // SAFETY: buf is a valid writable slice and fd is open
                let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result.map_err(Error::Io),
                Err(_would_block) => continue,
            }
        }
    }

    /// Write one IP packet to the device, looping until the whole packet is
    /// written.
    pub async fn write(&self, buf: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            if self.inner.get_ref().is_closed() {
                return Err(Error::Closed);
            }
            let mut guard = self.inner.writable().await.map_err(Error::Io)?;
            match guard.try_io(|inner| {
                let fd = inner.get_ref().fd;
                let rest = &buf[written..];
                // SAFETY: rest is a valid readable slice and fd is open
                let n = unsafe { libc::write(fd, rest.as_ptr() as *const _, rest.len()) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(0)) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "tun accepted zero bytes",
                    )))
                }
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Close the device. Idempotent; in-flight reads and writes fail after
    /// this returns.
    pub fn close(&self) {
        log::info!("closing tun device {}", self.name);
        self.inner.get_ref().close();
    }
}

impl std::fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunDevice")
            .field("name", &self.name)
            .field("cidr", &self.cidr)
            .field("mtu", &self.mtu)
            .finish()
    }
}
