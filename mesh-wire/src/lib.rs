//! Rumesh Wire Protocol
//!
//! Framing, address types, and payload codecs for the rumesh overlay data
//! plane. Every UDP datagram in the mesh is a 16-byte header followed by an
//! IPv4 packet (for `Message` frames) or an IPv4 stub plus an optional
//! directory blob (for handshake and lighthouse frames).

mod addr;
mod directory;
mod error;
mod header;
mod packet;

pub use addr::{UdpAddr, VpnIp, UDP_ADDR_WIRE_LEN};
pub use directory::{Directory, DirectoryEntry};
pub use error::{Error, Result};
pub use header::{
    HandshakeStage, Header, LighthouseOp, MessageType, HEADER_LEN, WIRE_VERSION,
};
pub use packet::{
    build_ipv4_stub, swap_addresses, InnerPacket, IPV4_HEADER_LEN, PROTO_ICMP, PROTO_TCP,
    PROTO_UDP,
};
