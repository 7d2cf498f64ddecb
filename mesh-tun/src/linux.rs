//! Linux TUN device plumbing
//!
//! Creates the device through `/dev/net/tun` and configures it with the
//! classic ifreq ioctl sequence: address, netmask, MTU, transmit queue
//! length, then IFF_UP | IFF_RUNNING.

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;

use crate::error::{Error, Result};

/// TUN interface flags
pub mod flags {
    /// TUN device (layer 3)
    pub const IFF_TUN: libc::c_short = 0x0001;
    /// No packet information header
    pub const IFF_NO_PI: libc::c_short = 0x1000;
    /// Enable multi-queue TUN
    pub const IFF_MULTI_QUEUE: libc::c_short = 0x0100;
    /// Interface is administratively up
    pub const IFF_UP: libc::c_short = 0x0001;
    /// Interface is operationally running
    pub const IFF_RUNNING: libc::c_short = 0x0040;
}

// TUNSETIFF = _IOW('T', 202, int)
const TUNSETIFF: libc::c_ulong = 0x400454ca;

const IFNAMSIZ: usize = 16;

#[repr(C)]
struct IfReqFlags {
    name: [u8; IFNAMSIZ],
    flags: libc::c_short,
    pad: [u8; 22],
}

#[repr(C)]
struct IfReqAddr {
    name: [u8; IFNAMSIZ],
    addr: libc::sockaddr_in,
    pad: [u8; 8],
}

#[repr(C)]
struct IfReqInt {
    name: [u8; IFNAMSIZ],
    value: libc::c_int,
    pad: [u8; 20],
}

fn ifr_name(name: &str) -> Result<[u8; IFNAMSIZ]> {
    let mut out = [0u8; IFNAMSIZ];
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= IFNAMSIZ || bytes.contains(&0) {
        return Err(Error::Config(format!("invalid interface name: {name:?}")));
    }
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

fn ioctl<T>(fd: RawFd, request: libc::c_ulong, arg: &mut T) -> io::Result<()> {
    // SAFETY: arg is a properly initialized repr(C) request struct
    let ret = unsafe { libc::ioctl(fd, request as _, arg as *mut T) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn sockaddr_v4(addr: Ipv4Addr) -> libc::sockaddr_in {
    // SAFETY: sockaddr_in is plain data; zeroed is a valid value
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_addr = libc::in_addr {
        s_addr: u32::from(addr).to_be(),
    };
    sa
}

/// Open `/dev/net/tun` and attach a TUN interface to the fd.
///
/// Returns the raw fd (set non-blocking) and the kernel-assigned interface
/// name. The caller owns the fd.
pub fn open_tun(name: &str, multiqueue: bool) -> Result<(RawFd, String)> {
    let dev_name = ifr_name(name)?;

    // SAFETY: opening a device node with a static, NUL-terminated path
    let fd = unsafe { libc::open(b"/dev/net/tun\0".as_ptr() as *const _, libc::O_RDWR) };
    if fd < 0 {
        return Err(Error::DeviceCreation(format!(
            "failed to open /dev/net/tun: {}",
            io::Error::last_os_error()
        )));
    }

    let mut flags = flags::IFF_TUN | flags::IFF_NO_PI;
    if multiqueue {
        flags |= flags::IFF_MULTI_QUEUE;
    }

    let mut req = IfReqFlags {
        name: dev_name,
        flags,
        pad: [0u8; 22],
    };

    if let Err(e) = ioctl(fd, TUNSETIFF, &mut req) {
        // SAFETY: fd came from open above
        unsafe { libc::close(fd) };
        return Err(Error::DeviceCreation(format!("TUNSETIFF failed: {e}")));
    }

    // SAFETY: fd is valid; O_NONBLOCK lets the async wrapper poll it
    unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) };

    let assigned = req
        .name
        .iter()
        .position(|&b| b == 0)
        .map(|end| String::from_utf8_lossy(&req.name[..end]).into_owned())
        .unwrap_or_else(|| name.to_string());

    Ok((fd, assigned))
}

/// Configure address, netmask, MTU and transmit queue length on the
/// interface, then bring it up and running.
pub fn configure(
    name: &str,
    addr: Ipv4Addr,
    netmask: Ipv4Addr,
    mtu: u16,
    tx_queue_len: i32,
) -> Result<()> {
    let dev_name = ifr_name(name)?;

    // A throwaway dgram socket carries the SIOC* requests
    // SAFETY: plain socket creation
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, libc::IPPROTO_IP) };
    if sock < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    let result = (|| {
        let mut ifra = IfReqAddr {
            name: dev_name,
            addr: sockaddr_v4(addr),
            pad: [0u8; 8],
        };
        ioctl(sock, libc::SIOCSIFADDR as _, &mut ifra)
            .map_err(|e| Error::DeviceCreation(format!("failed to set tun address: {e}")))?;

        ifra.addr = sockaddr_v4(netmask);
        ioctl(sock, libc::SIOCSIFNETMASK as _, &mut ifra)
            .map_err(|e| Error::DeviceCreation(format!("failed to set tun netmask: {e}")))?;

        let mut ifrm = IfReqInt {
            name: dev_name,
            value: libc::c_int::from(mtu),
            pad: [0u8; 20],
        };
        ioctl(sock, libc::SIOCSIFMTU as _, &mut ifrm)
            .map_err(|e| Error::DeviceCreation(format!("failed to set tun mtu: {e}")))?;

        let mut ifrq = IfReqInt {
            name: dev_name,
            value: tx_queue_len,
            pad: [0u8; 20],
        };
        ioctl(sock, libc::SIOCSIFTXQLEN as _, &mut ifrq)
            .map_err(|e| Error::DeviceCreation(format!("failed to set tun txqueuelen: {e}")))?;

        let mut ifrf = IfReqFlags {
            name: dev_name,
            flags: 0,
            pad: [0u8; 22],
        };
        ioctl(sock, libc::SIOCGIFFLAGS as _, &mut ifrf)
            .map_err(|e| Error::DeviceCreation(format!("failed to read tun flags: {e}")))?;

        ifrf.flags |= flags::IFF_UP | flags::IFF_RUNNING;
        ioctl(sock, libc::SIOCSIFFLAGS as _, &mut ifrf)
            .map_err(|e| Error::DeviceCreation(format!("failed to bring tun up: {e}")))?;

        Ok(())
    })();

    // SAFETY: sock came from socket above
    unsafe { libc::close(sock) };
    result
}

/// Get the interface index for a given interface name
pub fn interface_index(name: &str) -> Result<u32> {
    let c_name =
        CString::new(name).map_err(|_| Error::Config("invalid interface name".into()))?;

    // SAFETY: if_nametoindex is safe to call with a valid C string
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };

    if index == 0 {
        return Err(Error::Route(format!("interface '{name}' not found")));
    }

    Ok(index)
}

/// Check if the TUN kernel module is available
pub fn is_tun_available() -> bool {
    std::path::Path::new("/dev/net/tun").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifr_name_bounds() {
        assert!(ifr_name("rumesh").is_ok());
        assert!(ifr_name("").is_err());
        assert!(ifr_name("sixteen-chars-ab").is_err());
    }

    #[test]
    fn test_sockaddr_v4_is_network_order() {
        let sa = sockaddr_v4(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(sa.sin_addr.s_addr.to_ne_bytes(), [10, 0, 0, 1]);
    }

    #[test]
    fn test_tun_available_does_not_panic() {
        let _ = is_tun_available();
    }
}
