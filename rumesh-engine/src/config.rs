//! Configuration types for the engine
//!
//! The configuration file uses YAML. A minimal client config names a
//! lighthouse in `static_host_map` and `lighthouse.hosts`; a lighthouse sets
//! `lighthouse.am_lighthouse` instead.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::path::Path;
use std::sync::{Arc, RwLock};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use mesh_wire::VpnIp;

use crate::error::{Error, Result};

/// Configuration shared between the engine and its controllers.
///
/// Guarded by a std lock; holders take short read/write sections and never
/// hold the guard across an await.
pub type SharedConfig = Arc<RwLock<Config>>;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// UDP listener settings
    #[serde(default)]
    pub listen: ListenConfig,

    /// Statically configured peers: overlay IP to UDP endpoints ("host:port")
    #[serde(default)]
    pub static_host_map: HashMap<VpnIp, Vec<String>>,

    /// Lighthouse role and peers
    #[serde(default)]
    pub lighthouse: LighthouseConfig,

    /// TUN device settings
    pub tun: TunSettings,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Experimental behavior switches
    #[serde(default)]
    pub experimental: ExperimentalConfig,
}

/// UDP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Address to bind; "[::]" binds the IPv6 wildcard
    pub host: String,
    /// Port to bind; 0 asks the OS for a port, read back after bind
    pub port: u16,
    /// Number of reader tasks; more than one uses SO_REUSEPORT fan-out
    pub routines: usize,
    /// Receive buffer budget, in packets, per reader
    pub batch: usize,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4242,
            routines: 1,
            batch: 64,
        }
    }
}

impl ListenConfig {
    /// Resolve the listen host to an address to bind
    pub fn host_addr(&self) -> Result<IpAddr> {
        if self.host == "[::]" {
            // The literal `[::]` will not parse as an IpAddr but is accepted
            // as the IPv6 wildcard.
            return Ok(IpAddr::V6(Ipv6Addr::UNSPECIFIED));
        }
        self.host
            .parse()
            .map_err(|_| Error::Config(format!("invalid listen.host: {:?}", self.host)))
    }
}

/// Lighthouse settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LighthouseConfig {
    /// Whether this node serves the directory itself
    pub am_lighthouse: bool,
    /// Overlay addresses of the lighthouses this node uses
    pub hosts: Vec<VpnIp>,
    /// Seconds between host-sync refreshes
    pub interval: u64,
}

impl Default for LighthouseConfig {
    fn default() -> Self {
        Self {
            am_lighthouse: false,
            hosts: Vec::new(),
            interval: 10,
        }
    }
}

/// TUN device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunSettings {
    /// Interface name
    #[serde(default = "default_tun_dev")]
    pub dev: String,
    /// Overlay subnet; the host address is this node's overlay address
    pub cidr: Ipv4Net,
    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Transmit queue length
    #[serde(default = "default_tx_queue_len")]
    pub tx_queue_len: i32,
    /// Additional routes pointed at the device
    #[serde(default)]
    pub routes: Vec<RouteSettings>,
}

fn default_tun_dev() -> String {
    "rumesh".to_string()
}

fn default_mtu() -> u16 {
    mesh_tun::DEFAULT_MTU
}

fn default_tx_queue_len() -> i32 {
    mesh_tun::DEFAULT_TX_QUEUE_LEN
}

/// One unsafe-route entry under `tun.routes`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSettings {
    pub cidr: Ipv4Net,
    /// Route MTU; 0 means the device default
    #[serde(default)]
    pub mtu: u16,
    #[serde(default)]
    pub metric: Option<u32>,
    #[serde(default = "default_route_install")]
    pub install: bool,
}

fn default_route_install() -> bool {
    true
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Experimental behavior switches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentalConfig {
    /// Re-emit inbound packets whose inner source is this node back to their
    /// sender, delivering non-ICMP payloads locally as well. Off by default.
    pub relay_bounce: bool,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.listen.host_addr()?;

        if self.tun.cidr.addr() == self.tun.cidr.network() && self.tun.cidr.prefix_len() < 31 {
            return Err(Error::Config(format!(
                "tun.cidr {} has no host address",
                self.tun.cidr
            )));
        }

        if self.lighthouse.am_lighthouse && !self.lighthouse.hosts.is_empty() {
            return Err(Error::Config(
                "lighthouse.hosts must be empty when am_lighthouse is set".into(),
            ));
        }

        for vip in &self.lighthouse.hosts {
            if !self.static_host_map.contains_key(vip) {
                return Err(Error::Config(format!(
                    "lighthouse {vip} has no static_host_map entry"
                )));
            }
        }

        for endpoints in self.static_host_map.values() {
            if endpoints.is_empty() {
                return Err(Error::Config(
                    "static_host_map entries must list at least one endpoint".into(),
                ));
            }
        }

        Ok(())
    }

    /// This node's overlay address: the host part of `tun.cidr`
    pub fn local_vpn_ip(&self) -> VpnIp {
        self.tun.cidr.addr().into()
    }

    /// Build the TUN device configuration
    pub fn tun_config(&self) -> Result<mesh_tun::TunConfig> {
        let routes = self.tun.routes.iter().map(|r| {
            let mut route = mesh_tun::Route::new(r.cidr).with_mtu(r.mtu);
            route.metric = r.metric;
            route.install = r.install;
            route
        });

        Ok(mesh_tun::TunConfig::builder()
            .name(&self.tun.dev)
            .cidr(self.tun.cidr)
            .mtu(self.tun.mtu)
            .tx_queue_len(self.tun.tx_queue_len)
            .multiqueue(self.listen.routines > 1)
            .routes(routes)
            .build()?)
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# rumesh configuration

# UDP transport the overlay runs over.
listen:
  host: "0.0.0.0"
  # 0 asks the OS for a port; the effective port is logged at startup.
  port: 4242
  routines: 1
  batch: 64

# Statically known peers: overlay IP -> underlay endpoints.
# Lighthouses must be listed here.
static_host_map:
  "10.0.0.1": ["lighthouse.example.com:4242"]

lighthouse:
  # Set on the lighthouse node itself; leave hosts empty there.
  am_lighthouse: false
  hosts: ["10.0.0.1"]
  # Seconds between host-sync refreshes.
  interval: 10

tun:
  dev: "rumesh"
  # The host address inside the subnet is this node's overlay address.
  cidr: "10.0.0.2/24"
  mtu: 1300
  tx_queue_len: 500
  # Extra subnets routed into the overlay.
  routes: []

logging:
  level: "info"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(extra: &str) -> String {
        format!(
            r#"
tun:
  cidr: "10.0.0.2/24"
{extra}"#
        )
    }

    #[test]
    fn test_minimal_config() {
        let config = Config::from_str(&minimal("")).unwrap();
        assert_eq!(config.listen.port, 4242);
        assert_eq!(config.listen.routines, 1);
        assert_eq!(config.tun.mtu, 1300);
        assert_eq!(config.tun.dev, "rumesh");
        assert_eq!(config.local_vpn_ip().to_string(), "10.0.0.2");
        assert!(!config.lighthouse.am_lighthouse);
        assert!(!config.experimental.relay_bounce);
    }

    #[test]
    fn test_sample_parses() {
        let config = Config::from_str(&Config::sample()).unwrap();
        assert_eq!(config.lighthouse.hosts.len(), 1);
        assert_eq!(config.lighthouse.interval, 10);
        assert!(config
            .static_host_map
            .contains_key(&"10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_lighthouse_requires_static_entry() {
        let yaml = minimal(
            r#"
lighthouse:
  hosts: ["10.0.0.1"]
"#,
        );
        let err = Config::from_str(&yaml).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_am_lighthouse_rejects_hosts() {
        let yaml = minimal(
            r#"
static_host_map:
  "10.0.0.1": ["1.1.1.1:4242"]
lighthouse:
  am_lighthouse: true
  hosts: ["10.0.0.1"]
"#,
        );
        assert!(Config::from_str(&yaml).is_err());
    }

    #[test]
    fn test_listen_host_v6_wildcard() {
        let mut config = Config::from_str(&minimal("")).unwrap();
        config.listen.host = "[::]".to_string();
        assert_eq!(
            config.listen.host_addr().unwrap(),
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        );

        config.listen.host = "not-a-host".to_string();
        assert!(config.listen.host_addr().is_err());
    }

    #[test]
    fn test_network_address_cidr_rejected() {
        let yaml = r#"
tun:
  cidr: "10.0.0.0/24"
"#;
        assert!(Config::from_str(yaml).is_err());
    }

    #[test]
    fn test_static_host_map_parses_endpoints() {
        let yaml = minimal(
            r#"
static_host_map:
  "10.0.0.1": ["1.1.1.1:4242"]
  "10.0.0.5": ["2.2.2.2:4242", "3.3.3.3:4242"]
"#,
        );
        let config = Config::from_str(&yaml).unwrap();
        assert_eq!(config.static_host_map.len(), 2);
        assert_eq!(
            config.static_host_map[&"10.0.0.5".parse().unwrap()].len(),
            2
        );
    }

    #[test]
    fn test_empty_endpoint_list_rejected() {
        let yaml = minimal(
            r#"
static_host_map:
  "10.0.0.1": []
"#,
        );
        assert!(Config::from_str(&yaml).is_err());
    }
}
