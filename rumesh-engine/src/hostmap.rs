//! The process-wide directory of known peers
//!
//! `HostMap` is the only multi-writer shared state in the engine. One
//! reader/writer lock guards the four index maps; each `HostInfo` is a shared
//! handle with its own finer-grained locks, so readers drop the map lock
//! before touching a host's mutable state. No lock is ever held across an
//! await.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, RwLock};

use mesh_wire::{Directory, UdpAddr, VpnIp};

/// Placeholder for a future cryptographic handshake state.
///
/// Reserved alongside `local_index_id`/`remote_index_id`; nothing in the
/// current engine populates it.
#[derive(Debug, Default)]
pub struct ConnectionState {
    pub initiator: bool,
    pub message_counter: AtomicU64,
}

/// Record for one known peer
#[derive(Debug)]
pub struct HostInfo {
    vpn_ip: VpnIp,
    remote: RwLock<Option<UdpAddr>>,
    remotes: Mutex<Vec<UdpAddr>>,
    /// Reserved 32-bit session identifiers, 0 until a handshake assigns them
    pub local_index_id: u32,
    pub remote_index_id: u32,
    connection_state: Mutex<Option<ConnectionState>>,
}

impl HostInfo {
    fn new(vpn_ip: VpnIp, remote: Option<UdpAddr>) -> Self {
        Self {
            vpn_ip,
            remote: RwLock::new(remote),
            remotes: Mutex::new(remote.into_iter().collect()),
            local_index_id: 0,
            remote_index_id: 0,
            connection_state: Mutex::new(None),
        }
    }

    /// The peer's overlay address. Immutable for the life of the record.
    pub fn vpn_ip(&self) -> VpnIp {
        self.vpn_ip
    }

    /// The currently-preferred underlay address, if known
    pub fn remote(&self) -> Option<UdpAddr> {
        *self.remote.read().unwrap()
    }

    /// Set the preferred underlay address, merging it into the candidate set
    pub(crate) fn set_remote(&self, addr: UdpAddr) {
        *self.remote.write().unwrap() = Some(addr);
        let mut remotes = self.remotes.lock().unwrap();
        if !remotes.contains(&addr) {
            remotes.push(addr);
        }
    }

    /// The candidate underlay addresses: the preferred address alone when one
    /// is set, otherwise a copy of the learned set.
    pub fn remote_addr_list(&self) -> Vec<UdpAddr> {
        if let Some(remote) = self.remote() {
            return vec![remote];
        }
        self.remotes.lock().unwrap().clone()
    }

    /// Whether the reserved handshake slot has been populated
    pub fn has_connection_state(&self) -> bool {
        self.connection_state.lock().unwrap().is_some()
    }
}

#[derive(Debug, Default)]
struct Maps {
    hosts: HashMap<VpnIp, Arc<HostInfo>>,
    // Reserved session-id indexes; defined but not populated yet.
    indexes: HashMap<u32, Arc<HostInfo>>,
    remote_indexes: HashMap<u32, Arc<HostInfo>>,
    relays: HashMap<u32, Arc<HostInfo>>,
}

/// Thread-safe directory: overlay address to [`HostInfo`]
#[derive(Debug, Default)]
pub struct HostMap {
    maps: RwLock<Maps>,
}

impl HostMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert-or-replace the record for `vip` with the single known address
    pub fn add_host(&self, vip: VpnIp, addr: UdpAddr) -> Arc<HostInfo> {
        let info = Arc::new(HostInfo::new(vip, Some(addr)));
        let mut maps = self.maps.write().unwrap();
        maps.hosts.insert(vip, info.clone());
        info
    }

    /// Update the preferred address of `vip` in place, creating the record if
    /// it does not exist yet
    pub fn update_host(&self, vip: VpnIp, addr: UdpAddr) {
        let mut maps = self.maps.write().unwrap();
        match maps.hosts.get(&vip) {
            Some(info) => info.set_remote(addr),
            None => {
                maps.hosts.insert(vip, Arc::new(HostInfo::new(vip, Some(addr))));
            }
        }
    }

    /// Remove the record for `vip`. Idempotent.
    pub fn delete_host(&self, vip: VpnIp) {
        let mut maps = self.maps.write().unwrap();
        maps.hosts.remove(&vip);
    }

    /// Snapshot lookup. The returned handle stays valid after the entry is
    /// replaced or removed; it simply stops receiving updates.
    pub fn query_vpn_ip(&self, vip: VpnIp) -> Option<Arc<HostInfo>> {
        let maps = self.maps.read().unwrap();
        maps.hosts.get(&vip).cloned()
    }

    /// Lookup by local session index. Reserved; nothing populates the index
    /// maps yet.
    pub fn query_index(&self, index: u32) -> Option<Arc<HostInfo>> {
        let maps = self.maps.read().unwrap();
        maps.indexes
            .get(&index)
            .or_else(|| maps.remote_indexes.get(&index))
            .cloned()
    }

    /// Lookup by relay index. Reserved; nothing populates the relay map yet.
    pub fn query_relay(&self, index: u32) -> Option<Arc<HostInfo>> {
        let maps = self.maps.read().unwrap();
        maps.relays.get(&index).cloned()
    }

    /// Candidate addresses for `vip`; empty when the host is unknown
    pub fn get_remote_addr_list(&self, vip: VpnIp) -> Vec<UdpAddr> {
        let info = {
            let maps = self.maps.read().unwrap();
            maps.hosts.get(&vip).cloned()
        };
        info.map(|i| i.remote_addr_list()).unwrap_or_default()
    }

    /// Number of known hosts
    pub fn len(&self) -> usize {
        self.maps.read().unwrap().hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the map as a wire directory
    pub fn directory(&self) -> Directory {
        let mut dir = Directory::new();
        let maps = self.maps.read().unwrap();
        for (vip, info) in maps.hosts.iter() {
            dir.insert(*vip, info.remote());
        }
        dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vip(s: &str) -> VpnIp {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> UdpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_add_host_overwrites() {
        let map = HostMap::new();
        map.add_host(vip("10.0.0.1"), addr("1.1.1.1:4242"));
        map.add_host(vip("10.0.0.1"), addr("2.2.2.2:4242"));

        let info = map.query_vpn_ip(vip("10.0.0.1")).unwrap();
        assert_eq!(info.vpn_ip(), vip("10.0.0.1"));
        assert_eq!(info.remote(), Some(addr("2.2.2.2:4242")));
        // AddHost resets the candidate set to the single address
        assert_eq!(info.remote_addr_list(), vec![addr("2.2.2.2:4242")]);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_update_host_preserves_record() {
        let map = HostMap::new();
        let original = map.add_host(vip("10.0.0.1"), addr("1.1.1.1:4242"));
        map.update_host(vip("10.0.0.1"), addr("2.2.2.2:4242"));

        // The existing record is mutated in place; old handles observe it
        assert_eq!(original.remote(), Some(addr("2.2.2.2:4242")));

        let info = map.query_vpn_ip(vip("10.0.0.1")).unwrap();
        assert!(Arc::ptr_eq(&original, &info));
    }

    #[test]
    fn test_update_host_creates_when_missing() {
        let map = HostMap::new();
        map.update_host(vip("10.0.0.9"), addr("9.9.9.9:4242"));
        let info = map.query_vpn_ip(vip("10.0.0.9")).unwrap();
        assert_eq!(info.remote(), Some(addr("9.9.9.9:4242")));
    }

    #[test]
    fn test_update_merges_into_remotes() {
        let map = HostMap::new();
        map.add_host(vip("10.0.0.1"), addr("1.1.1.1:4242"));
        map.update_host(vip("10.0.0.1"), addr("2.2.2.2:4242"));
        map.update_host(vip("10.0.0.1"), addr("2.2.2.2:4242"));

        let info = map.query_vpn_ip(vip("10.0.0.1")).unwrap();
        // Preferred address is reported alone...
        assert_eq!(info.remote_addr_list(), vec![addr("2.2.2.2:4242")]);
        // ...but both were merged, deduplicated, into the candidate set
        let remotes = info.remotes.lock().unwrap();
        assert_eq!(remotes.len(), 2);
    }

    #[test]
    fn test_delete_host_is_idempotent() {
        let map = HostMap::new();
        map.add_host(vip("10.0.0.1"), addr("1.1.1.1:4242"));
        map.delete_host(vip("10.0.0.1"));
        map.delete_host(vip("10.0.0.1"));
        assert!(map.query_vpn_ip(vip("10.0.0.1")).is_none());
        assert!(map.get_remote_addr_list(vip("10.0.0.1")).is_empty());
    }

    #[test]
    fn test_handle_survives_delete() {
        let map = HostMap::new();
        let info = map.add_host(vip("10.0.0.1"), addr("1.1.1.1:4242"));
        map.delete_host(vip("10.0.0.1"));
        // In-flight handles stay usable; the record is self-contained
        assert_eq!(info.remote(), Some(addr("1.1.1.1:4242")));
    }

    #[test]
    fn test_directory_snapshot() {
        let map = HostMap::new();
        map.add_host(vip("10.0.0.1"), addr("1.1.1.1:4242"));
        map.add_host(vip("10.0.0.5"), addr("2.2.2.2:4242"));

        let dir = map.directory();
        assert_eq!(dir.len(), 2);
        let entry = dir
            .iter()
            .find(|(v, _)| **v == vip("10.0.0.5"))
            .unwrap()
            .1;
        assert_eq!(entry.remote, Some(addr("2.2.2.2:4242")));
    }

    #[test]
    fn test_reserved_fields_unpopulated() {
        let map = HostMap::new();
        let info = map.add_host(vip("10.0.0.1"), addr("1.1.1.1:4242"));
        assert_eq!(info.local_index_id, 0);
        assert_eq!(info.remote_index_id, 0);
        assert!(!info.has_connection_state());
    }

    #[test]
    fn test_concurrent_update_and_query() {
        let map = Arc::new(HostMap::new());
        let target = vip("10.0.0.1");

        let mut handles = Vec::new();
        for t in 0..8u16 {
            let map = map.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..1000u16 {
                    let port = 1000 + (t * 1000 + i) % 5000;
                    map.update_host(target, UdpAddr::new([1, 1, 1, 1].into(), port));
                    if let Some(info) = map.query_vpn_ip(target) {
                        // Never observe a partially constructed record
                        assert_eq!(info.vpn_ip(), target);
                        let remote = info.remote().expect("remote always set");
                        assert!((1000..6000).contains(&remote.port));
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Final state equals some serial order of the calls: one record,
        // remote set to one of the written addresses.
        assert_eq!(map.len(), 1);
        let info = map.query_vpn_ip(target).unwrap();
        assert!(info.remote().is_some());
    }
}
