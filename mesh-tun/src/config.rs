//! TUN device configuration

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::route::Route;

/// Default MTU for the tunnel interface
pub const DEFAULT_MTU: u16 = 1300;

/// Default transmit queue length
pub const DEFAULT_TX_QUEUE_LEN: i32 = 500;

/// Configuration for a TUN device
///
/// The host address of `cidr` is this node's overlay address; the network is
/// the overlay subnet routed into the device.
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Interface name (e.g. "rumesh")
    pub name: String,
    /// Overlay subnet, host address included
    pub cidr: Ipv4Net,
    /// Interface MTU
    pub mtu: u16,
    /// Transmit queue length
    pub tx_queue_len: i32,
    /// Open the device with IFF_MULTI_QUEUE
    pub multiqueue: bool,
    /// Additional routes to point at the device
    pub routes: Vec<Route>,
}

impl TunConfig {
    /// Create a builder for a TUN configuration
    pub fn builder() -> TunConfigBuilder {
        TunConfigBuilder::default()
    }

    /// The local overlay address (the host part of `cidr`)
    pub fn local_addr(&self) -> Ipv4Addr {
        self.cidr.addr()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() >= 16 {
            return Err(Error::Config(format!(
                "interface name must be 1-15 characters: {:?}",
                self.name
            )));
        }
        if self.mtu < 576 {
            return Err(Error::Config(format!(
                "MTU {} is too small (minimum 576)",
                self.mtu
            )));
        }
        if self.cidr.addr() == self.cidr.network() && self.cidr.prefix_len() < 31 {
            return Err(Error::Config(format!(
                "tun cidr {} has no host address",
                self.cidr
            )));
        }
        Ok(())
    }
}

/// Builder for [`TunConfig`]
#[derive(Debug, Default)]
pub struct TunConfigBuilder {
    name: Option<String>,
    cidr: Option<Ipv4Net>,
    mtu: Option<u16>,
    tx_queue_len: Option<i32>,
    multiqueue: bool,
    routes: Vec<Route>,
}

impl TunConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn cidr(mut self, cidr: Ipv4Net) -> Self {
        self.cidr = Some(cidr);
        self
    }

    pub fn mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    pub fn tx_queue_len(mut self, len: i32) -> Self {
        self.tx_queue_len = Some(len);
        self
    }

    pub fn multiqueue(mut self, multiqueue: bool) -> Self {
        self.multiqueue = multiqueue;
        self
    }

    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    pub fn routes(mut self, routes: impl IntoIterator<Item = Route>) -> Self {
        self.routes.extend(routes);
        self
    }

    pub fn build(self) -> Result<TunConfig> {
        let config = TunConfig {
            name: self.name.unwrap_or_else(|| "rumesh".to_string()),
            cidr: self
                .cidr
                .ok_or_else(|| Error::Config("tun cidr is required".into()))?,
            mtu: self.mtu.unwrap_or(DEFAULT_MTU),
            tx_queue_len: self.tx_queue_len.unwrap_or(DEFAULT_TX_QUEUE_LEN),
            multiqueue: self.multiqueue,
            routes: self.routes,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = TunConfig::builder()
            .cidr("10.0.0.2/24".parse().unwrap())
            .build()
            .unwrap();
        assert_eq!(config.name, "rumesh");
        assert_eq!(config.mtu, DEFAULT_MTU);
        assert_eq!(config.tx_queue_len, DEFAULT_TX_QUEUE_LEN);
        assert_eq!(config.local_addr(), "10.0.0.2".parse::<Ipv4Addr>().unwrap());
        assert!(!config.multiqueue);
    }

    #[test]
    fn test_cidr_required() {
        assert!(TunConfig::builder().name("tun9").build().is_err());
    }

    #[test]
    fn test_mtu_minimum() {
        let result = TunConfig::builder()
            .cidr("10.0.0.2/24".parse().unwrap())
            .mtu(100)
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_network_address_rejected() {
        let result = TunConfig::builder()
            .cidr("10.0.0.0/24".parse().unwrap())
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_name_length_limit() {
        let result = TunConfig::builder()
            .name("a-very-long-interface-name")
            .cidr("10.0.0.2/24".parse().unwrap())
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
