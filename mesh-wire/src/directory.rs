//! Host directory blob carried in host-sync and lighthouse replies
//!
//! The blob is a map from overlay address to the entry's preferred underlay
//! address, encoded as canonical JSON (sorted keys) so both peers produce the
//! same bytes for the same directory.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Result, UdpAddr, VpnIp};

/// One directory entry: the peer's preferred underlay address, if known
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub remote: Option<UdpAddr>,
}

/// A directory of known hosts, keyed by overlay address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Directory(BTreeMap<VpnIp, DirectoryEntry>);

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, vip: VpnIp, remote: Option<UdpAddr>) {
        self.0.insert(vip, DirectoryEntry { remote });
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VpnIp, &DirectoryEntry)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encode as canonical JSON
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the JSON wire form
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn vip(s: &str) -> VpnIp {
        s.parse().unwrap()
    }

    #[test]
    fn test_directory_roundtrip() {
        let mut dir = Directory::new();
        dir.insert(vip("10.0.0.5"), Some(UdpAddr::new(Ipv4Addr::new(2, 2, 2, 2), 4242)));
        dir.insert(vip("10.0.0.1"), Some(UdpAddr::new(Ipv4Addr::new(1, 1, 1, 1), 4242)));
        dir.insert(vip("10.0.0.9"), None);

        let encoded = dir.encode().unwrap();
        let decoded = Directory::decode(&encoded).unwrap();
        assert_eq!(dir, decoded);
        assert_eq!(decoded.len(), 3);
    }

    #[test]
    fn test_directory_encoding_is_canonical() {
        // Same entries inserted in different orders produce identical bytes
        let mut a = Directory::new();
        a.insert(vip("10.0.0.5"), Some("2.2.2.2:4242".parse().unwrap()));
        a.insert(vip("10.0.0.1"), Some("1.1.1.1:4242".parse().unwrap()));

        let mut b = Directory::new();
        b.insert(vip("10.0.0.1"), Some("1.1.1.1:4242".parse().unwrap()));
        b.insert(vip("10.0.0.5"), Some("2.2.2.2:4242".parse().unwrap()));

        assert_eq!(a.encode().unwrap(), b.encode().unwrap());
    }

    #[test]
    fn test_directory_keys_are_dotted_quads() {
        let mut dir = Directory::new();
        dir.insert(vip("10.0.0.1"), Some("1.1.1.1:4242".parse().unwrap()));
        let json = String::from_utf8(dir.encode().unwrap()).unwrap();
        assert!(json.contains("\"10.0.0.1\""));
        assert!(json.contains("\"1.1.1.1:4242\""));
    }

    #[test]
    fn test_directory_decode_garbage() {
        assert!(Directory::decode(b"not json").is_err());
    }
}
