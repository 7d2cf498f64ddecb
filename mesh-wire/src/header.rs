//! Framing header encoding and decoding
//!
//! Every UDP payload in the mesh begins with a fixed 16-byte header:
//!
//! ```text
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! | Byte 0 | Byte 1 | Byte 2 | Byte 3 | Byte 4 | Byte 5 | Byte 6 | Byte 7 |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! |Version |  Type  |Subtype |Reservd |      RemoteIndex (uint32, BE)     |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//!
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! | Byte 8 | Byte 9 | Byte10 | Byte11 | Byte12 | Byte13 | Byte14 | Byte15 |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! |                      Counter (uint64, big-endian)                     |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! ```

use std::fmt;

use crate::{Error, Result};

/// Header length in bytes
pub const HEADER_LEN: usize = 16;

/// The only wire version this codec speaks
pub const WIRE_VERSION: u8 = 1;

/// Kind of a framed datagram
///
/// Decoding is total: type bytes this implementation does not know are kept
/// as [`MessageType::Unknown`] so dispatch can drop them without failing
/// the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Host-sync handshake exchange
    Handshake,
    /// An encapsulated IPv4 packet
    Message,
    /// Directory query/reply served by a lighthouse
    Lighthouse,
    /// Reachability test frame
    Test,
    /// A type byte this implementation does not understand
    Unknown(u8),
}

impl MessageType {
    pub const fn as_u8(self) -> u8 {
        match self {
            MessageType::Handshake => 0,
            MessageType::Message => 1,
            MessageType::Lighthouse => 2,
            MessageType::Test => 3,
            MessageType::Unknown(v) => v,
        }
    }

    pub const fn from_u8(v: u8) -> Self {
        match v {
            0 => MessageType::Handshake,
            1 => MessageType::Message,
            2 => MessageType::Lighthouse,
            3 => MessageType::Test,
            other => MessageType::Unknown(other),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Handshake => write!(f, "handshake"),
            MessageType::Message => write!(f, "message"),
            MessageType::Lighthouse => write!(f, "lighthouse"),
            MessageType::Test => write!(f, "test"),
            MessageType::Unknown(v) => write!(f, "unknown({v})"),
        }
    }
}

/// Subtypes of [`MessageType::Handshake`] frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeStage {
    /// Ask a peer for its view of the mesh
    HostSync = 0x01,
    /// Answer with a directory of known hosts
    HostSyncReply = 0x02,
}

impl TryFrom<u8> for HandshakeStage {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(HandshakeStage::HostSync),
            0x02 => Ok(HandshakeStage::HostSyncReply),
            other => Err(Error::BadHeader(format!("unknown handshake subtype {other}"))),
        }
    }
}

/// Subtypes of [`MessageType::Lighthouse`] frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LighthouseOp {
    /// Look up a single overlay address
    Query = 0x01,
    /// Directory reply
    Reply = 0x02,
}

impl TryFrom<u8> for LighthouseOp {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(LighthouseOp::Query),
            0x02 => Ok(LighthouseOp::Reply),
            other => Err(Error::BadHeader(format!("unknown lighthouse subtype {other}"))),
        }
    }
}

/// The fixed framing header prefixed to every datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_type: MessageType,
    pub message_subtype: u8,
    /// Opaque session identifier, reserved; 0 in the current protocol
    pub remote_index: u32,
    /// Monotonic per-sender counter
    pub counter: u64,
}

impl Header {
    pub fn new(message_type: MessageType, message_subtype: u8, counter: u64) -> Self {
        Self {
            message_type,
            message_subtype,
            remote_index: 0,
            counter,
        }
    }

    /// Header for an encapsulated IPv4 packet
    pub fn message(counter: u64) -> Self {
        Self::new(MessageType::Message, 0, counter)
    }

    /// Header for a host-sync handshake frame
    pub fn handshake(stage: HandshakeStage, counter: u64) -> Self {
        Self::new(MessageType::Handshake, stage as u8, counter)
    }

    /// Header for a lighthouse directory frame
    pub fn lighthouse(op: LighthouseOp, counter: u64) -> Self {
        Self::new(MessageType::Lighthouse, op as u8, counter)
    }

    /// Encode to the 16-byte wire form. Encoding is total; the reserved
    /// byte is always written as zero.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = WIRE_VERSION;
        buf[1] = self.message_type.as_u8();
        buf[2] = self.message_subtype;
        // buf[3] reserved, zero
        buf[4..8].copy_from_slice(&self.remote_index.to_be_bytes());
        buf[8..16].copy_from_slice(&self.counter.to_be_bytes());
        buf
    }

    /// Decode from bytes
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::ShortPacket {
                expected: HEADER_LEN,
                actual: buf.len(),
            });
        }
        if buf[0] != WIRE_VERSION {
            return Err(Error::BadHeader(format!(
                "unsupported wire version {}",
                buf[0]
            )));
        }
        if buf[3] != 0 {
            return Err(Error::BadHeader(format!(
                "reserved byte must be zero, got {}",
                buf[3]
            )));
        }
        Ok(Self {
            message_type: MessageType::from_u8(buf[1]),
            message_subtype: buf[2],
            remote_index: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            counter: u64::from_be_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let header = Header {
            message_type: MessageType::Message,
            message_subtype: 0,
            remote_index: 0xDEADBEEF,
            counter: 0x0102030405060708,
        };

        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_LEN);
        assert_eq!(encoded[0], WIRE_VERSION);
        assert_eq!(encoded[3], 0);

        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_header_unknown_type_roundtrip() {
        let header = Header::new(MessageType::Unknown(9), 7, 42);
        let decoded = Header::decode(&header.encode()).unwrap();
        assert_eq!(header, decoded);
        assert_eq!(decoded.message_type, MessageType::Unknown(9));
    }

    #[test]
    fn test_header_short_packet() {
        let err = Header::decode(&[1, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::ShortPacket { expected: 16, actual: 3 }));
    }

    #[test]
    fn test_header_bad_version() {
        let mut buf = Header::message(1).encode();
        buf[0] = 2;
        assert!(matches!(Header::decode(&buf), Err(Error::BadHeader(_))));
    }

    #[test]
    fn test_header_reserved_must_be_zero() {
        let mut buf = Header::message(1).encode();
        buf[3] = 1;
        assert!(matches!(Header::decode(&buf), Err(Error::BadHeader(_))));
    }

    #[test]
    fn test_handshake_header() {
        let h = Header::handshake(HandshakeStage::HostSync, 5);
        assert_eq!(h.message_type, MessageType::Handshake);
        assert_eq!(HandshakeStage::try_from(h.message_subtype).unwrap(), HandshakeStage::HostSync);

        let h = Header::handshake(HandshakeStage::HostSyncReply, 6);
        assert_eq!(HandshakeStage::try_from(h.message_subtype).unwrap(), HandshakeStage::HostSyncReply);

        assert!(HandshakeStage::try_from(0x7F).is_err());
    }

    #[test]
    fn test_counter_is_big_endian() {
        let buf = Header::message(1).encode();
        assert_eq!(&buf[8..16], &[0, 0, 0, 0, 0, 0, 0, 1]);
    }
}
