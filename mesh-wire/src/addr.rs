//! Overlay and underlay address types
//!
//! `VpnIp` is the canonical form of an IPv4 address inside the overlay;
//! `UdpAddr` is the 4-byte-IP + port underlay address peers are reached at.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

/// An IPv4 address drawn from the tunnel's private CIDR, stored as its
/// 32-bit numeric value. Equality and ordering are numeric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VpnIp(u32);

impl VpnIp {
    /// Create from the raw 32-bit value
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw 32-bit value
    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// The four address bytes, network order
    pub fn octets(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Create from four address bytes in network order
    pub fn from_octets(octets: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(octets))
    }

    /// Parse a dotted-quad string, failing with [`Error::BadAddress`]
    pub fn parse(s: &str) -> Result<Self> {
        s.parse()
    }
}

impl From<Ipv4Addr> for VpnIp {
    fn from(ip: Ipv4Addr) -> Self {
        Self::from_octets(ip.octets())
    }
}

impl From<VpnIp> for Ipv4Addr {
    fn from(vip: VpnIp) -> Self {
        Ipv4Addr::from(vip.octets())
    }
}

impl FromStr for VpnIp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let ip: Ipv4Addr = s
            .parse()
            .map_err(|_| Error::BadAddress(format!("invalid overlay IPv4 address: {s:?}")))?;
        Ok(ip.into())
    }
}

impl fmt::Display for VpnIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ipv4Addr::from(*self).fmt(f)
    }
}

impl Serialize for VpnIp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VpnIp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Length of a `UdpAddr` on the wire: 4-byte IPv4 + 16-bit port, big-endian
pub const UDP_ADDR_WIRE_LEN: usize = 6;

/// An underlay UDP endpoint: IPv4 address and port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpAddr {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl UdpAddr {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Encode to the 6-byte wire form
    pub fn encode(&self) -> [u8; UDP_ADDR_WIRE_LEN] {
        let mut buf = [0u8; UDP_ADDR_WIRE_LEN];
        buf[..4].copy_from_slice(&self.ip.octets());
        buf[4..].copy_from_slice(&self.port.to_be_bytes());
        buf
    }

    /// Decode from the 6-byte wire form
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < UDP_ADDR_WIRE_LEN {
            return Err(Error::ShortPacket {
                expected: UDP_ADDR_WIRE_LEN,
                actual: buf.len(),
            });
        }
        Ok(Self {
            ip: Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]),
            port: u16::from_be_bytes([buf[4], buf[5]]),
        })
    }
}

impl TryFrom<SocketAddr> for UdpAddr {
    type Error = Error;

    fn try_from(addr: SocketAddr) -> Result<Self> {
        match addr {
            SocketAddr::V4(v4) => Ok(Self::new(*v4.ip(), v4.port())),
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(ip) => Ok(Self::new(ip, v6.port())),
                None => Err(Error::BadAddress(format!(
                    "underlay address must be IPv4: {addr}"
                ))),
            },
        }
    }
}

impl From<UdpAddr> for SocketAddr {
    fn from(addr: UdpAddr) -> Self {
        SocketAddr::V4(SocketAddrV4::new(addr.ip, addr.port))
    }
}

impl FromStr for UdpAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let addr: SocketAddr = s
            .parse()
            .map_err(|_| Error::BadAddress(format!("invalid endpoint: {s:?}")))?;
        addr.try_into()
    }
}

impl fmt::Display for UdpAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl Serialize for UdpAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UdpAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
