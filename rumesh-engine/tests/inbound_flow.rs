//! Inbound dispatch tests with a capture writer in place of the TUN device

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use mesh_wire::{
    build_ipv4_stub, HandshakeStage, Header, InnerPacket, MessageType, UdpAddr, VpnIp, HEADER_LEN,
    IPV4_HEADER_LEN, PROTO_ICMP, PROTO_UDP,
};
use rumesh_engine::{
    Config, DatagramHandler, ExperimentalConfig, Handshake, HostMap, Inbound, InsideWriter,
    Lighthouse, LighthouseConfig, ListenConfig, Listener, LoggingConfig, Outbound, SharedConfig,
    TunSettings,
};

const LOCAL_VIP: &str = "10.0.0.2";

#[derive(Default)]
struct CaptureWriter {
    packets: Mutex<Vec<Vec<u8>>>,
}

impl CaptureWriter {
    fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.packets.lock().unwrap())
    }
}

#[async_trait]
impl InsideWriter for CaptureWriter {
    async fn write_inside(&self, packet: &[u8]) -> rumesh_engine::Result<()> {
        self.packets.lock().unwrap().push(packet.to_vec());
        Ok(())
    }
}

struct Harness {
    hosts: Arc<HostMap>,
    inside: Arc<CaptureWriter>,
    inbound: Arc<Inbound>,
}

async fn harness(relay_bounce: bool) -> Harness {
    let local: VpnIp = LOCAL_VIP.parse().unwrap();

    let config = Config {
        listen: ListenConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            routines: 1,
            batch: 64,
        },
        static_host_map: HashMap::new(),
        lighthouse: LighthouseConfig::default(),
        tun: TunSettings {
            dev: "test".to_string(),
            cidr: format!("{LOCAL_VIP}/24").parse().unwrap(),
            mtu: 1300,
            tx_queue_len: 500,
            routes: Vec::new(),
        },
        logging: LoggingConfig::default(),
        experimental: ExperimentalConfig { relay_bounce },
    };
    let config: SharedConfig = Arc::new(RwLock::new(config));

    let listener = Listener::bind("127.0.0.1".parse().unwrap(), 0, 1, 64).unwrap();
    let hosts = Arc::new(HostMap::new());
    let outbound = Arc::new(Outbound::new(
        listener.writer(),
        hosts.clone(),
        local,
        config.clone(),
    ));
    outbound.start().await.unwrap();

    let handshake = Arc::new(Handshake::new(hosts.clone(), outbound.clone(), local));
    let lighthouse = Arc::new(Lighthouse::new(
        false,
        Vec::new(),
        Duration::from_secs(10),
        hosts.clone(),
        outbound.clone(),
        local,
    ));

    let inside = Arc::new(CaptureWriter::default());
    let inbound = Arc::new(Inbound::new(
        hosts.clone(),
        inside.clone(),
        outbound,
        handshake,
        lighthouse,
        local,
        relay_bounce,
    ));

    Harness {
        hosts,
        inside,
        inbound,
    }
}

fn vip(s: &str) -> VpnIp {
    s.parse().unwrap()
}

fn frame_message(src: &str, dst: &str, protocol: u8) -> Vec<u8> {
    let mut out = Header::message(1).encode().to_vec();
    out.extend_from_slice(&build_ipv4_stub(vip(src), vip(dst), protocol));
    out
}

async fn deliver(inbound: &Inbound, from: SocketAddr, raw: &[u8]) {
    let header = Header::decode(raw).unwrap();
    inbound.handle(from, raw, &raw[HEADER_LEN..], &header).await;
}

/// S4: inner destination is us: one swapped packet to the TUN, no UDP out.
#[tokio::test]
async fn local_delivery_swaps_addresses() {
    let h = harness(false).await;
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sender_addr = sender.local_addr().unwrap();

    let raw = frame_message("10.0.0.5", LOCAL_VIP, PROTO_UDP);
    deliver(&h.inbound, sender_addr, &raw).await;

    let written = h.inside.take();
    assert_eq!(written.len(), 1);

    // On-wire form was src 10.0.0.5 -> dst local; the TUN copy is swapped
    let pk = InnerPacket::parse(&written[0], false).unwrap();
    assert_eq!(pk.local_ip, vip(LOCAL_VIP));
    assert_eq!(pk.remote_ip, vip("10.0.0.5"));

    // No UDP emission back at the sender
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut buf = [0u8; 2048];
    assert!(sender.try_recv_from(&mut buf).is_err());

    // Address learning: the sender's underlay address is now known
    let learned = h.hosts.query_vpn_ip(vip("10.0.0.5")).unwrap();
    assert_eq!(learned.remote(), Some(UdpAddr::try_from(sender_addr).unwrap()));
}

/// Transit traffic is learned and dropped, never forwarded.
#[tokio::test]
async fn transit_is_learned_and_dropped() {
    let h = harness(false).await;
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sender_addr = sender.local_addr().unwrap();

    let raw = frame_message("10.0.0.7", "10.0.0.8", PROTO_UDP);
    deliver(&h.inbound, sender_addr, &raw).await;

    assert!(h.inside.take().is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut buf = [0u8; 2048];
    assert!(sender.try_recv_from(&mut buf).is_err());

    let learned = h.hosts.query_vpn_ip(vip("10.0.0.7")).unwrap();
    assert_eq!(learned.remote(), Some(UdpAddr::try_from(sender_addr).unwrap()));
}

/// Looped-back own traffic is dropped while the bounce flag is off.
#[tokio::test]
async fn looped_packet_dropped_without_bounce() {
    let h = harness(false).await;
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let raw = frame_message(LOCAL_VIP, "10.0.0.8", PROTO_UDP);
    deliver(&h.inbound, sender.local_addr().unwrap(), &raw).await;

    assert!(h.inside.take().is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut buf = [0u8; 2048];
    assert!(sender.try_recv_from(&mut buf).is_err());

    // Never learn our own address mapping
    assert!(h.hosts.query_vpn_ip(vip(LOCAL_VIP)).is_none());
}

/// With the bounce flag on, non-ICMP loops deliver locally and re-emit.
#[tokio::test]
async fn bounce_delivers_and_reemits() {
    let h = harness(true).await;
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sender_addr = sender.local_addr().unwrap();

    let raw = frame_message(LOCAL_VIP, "10.0.0.8", PROTO_UDP);
    deliver(&h.inbound, sender_addr, &raw).await;

    // Local delivery of the unmodified payload
    let written = h.inside.take();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0], raw[HEADER_LEN..].to_vec());

    // Re-emission of the whole frame to the original source
    let mut buf = vec![0u8; 2048];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), sender.recv_from(&mut buf))
        .await
        .expect("no bounce emitted")
        .unwrap();
    assert_eq!(&buf[..n], &raw[..]);
}

/// ICMP loops re-emit but skip local delivery.
#[tokio::test]
async fn bounce_skips_local_delivery_for_icmp() {
    let h = harness(true).await;
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let raw = frame_message(LOCAL_VIP, "10.0.0.8", PROTO_ICMP);
    deliver(&h.inbound, sender.local_addr().unwrap(), &raw).await;

    assert!(h.inside.take().is_empty());

    let mut buf = vec![0u8; 2048];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), sender.recv_from(&mut buf))
        .await
        .expect("no bounce emitted")
        .unwrap();
    assert_eq!(n, raw.len());
}

/// Unknown message types are ignored entirely.
#[tokio::test]
async fn unknown_message_type_ignored() {
    let h = harness(false).await;
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut raw = Header::new(MessageType::Unknown(42), 0, 1).encode().to_vec();
    raw.extend_from_slice(&build_ipv4_stub(vip("10.0.0.5"), vip(LOCAL_VIP), PROTO_UDP));
    deliver(&h.inbound, sender.local_addr().unwrap(), &raw).await;

    assert!(h.inside.take().is_empty());
    assert!(h.hosts.query_vpn_ip(vip("10.0.0.5")).is_none());
}

/// The responder side of host-sync: learn the initiator, reply with the
/// directory.
#[tokio::test]
async fn host_sync_request_gets_directory_reply() {
    let h = harness(false).await;
    h.hosts
        .add_host(vip("10.0.0.5"), "2.2.2.2:4242".parse().unwrap());

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sender_addr = sender.local_addr().unwrap();

    let mut raw = Header::handshake(HandshakeStage::HostSync, 1).encode().to_vec();
    raw.extend_from_slice(&build_ipv4_stub(vip("10.0.0.9"), vip(LOCAL_VIP), PROTO_UDP));
    deliver(&h.inbound, sender_addr, &raw).await;

    // The initiator was added with its observed address
    let initiator = h.hosts.query_vpn_ip(vip("10.0.0.9")).unwrap();
    assert_eq!(
        initiator.remote(),
        Some(UdpAddr::try_from(sender_addr).unwrap())
    );

    // The reply carries the responder's whole directory
    let mut buf = vec![0u8; 4096];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), sender.recv_from(&mut buf))
        .await
        .expect("no reply")
        .unwrap();

    let header = Header::decode(&buf[..n]).unwrap();
    assert_eq!(header.message_type, MessageType::Handshake);
    assert_eq!(
        HandshakeStage::try_from(header.message_subtype).unwrap(),
        HandshakeStage::HostSyncReply
    );

    let stub = InnerPacket::parse(&buf[HEADER_LEN..n], true).unwrap();
    assert_eq!(stub.remote_ip, vip(LOCAL_VIP));
    assert_eq!(stub.local_ip, vip("10.0.0.9"));

    let directory =
        mesh_wire::Directory::decode(&buf[HEADER_LEN + IPV4_HEADER_LEN..n]).unwrap();
    let entry = directory
        .iter()
        .find(|(v, _)| **v == vip("10.0.0.5"))
        .expect("known host present in directory")
        .1;
    assert_eq!(entry.remote, Some("2.2.2.2:4242".parse().unwrap()));
}
