//! Route management for the TUN device
//!
//! Routes are installed through the `net-route` handle, scoped to the
//! interface. `net-route` carries no MTU attribute, so when a route's MTU
//! differs from the device MTU the MTU and advmss attributes are applied with
//! an `ip route replace` follow-up.

use std::fmt;
use std::net::IpAddr;

use ipnet::Ipv4Net;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::linux;

/// A route pointed at the TUN device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination network
    pub cidr: Ipv4Net,
    /// Route MTU; 0 means the device default
    pub mtu: u16,
    /// Route metric/priority (lower = higher priority)
    pub metric: Option<u32>,
    /// Whether the route should be installed in the kernel table
    pub install: bool,
}

impl Route {
    pub fn new(cidr: Ipv4Net) -> Self {
        Self {
            cidr,
            mtu: 0,
            metric: None,
            install: true,
        }
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    /// Advertised MSS for this route: `mtu - 40`, but only when the route MTU
    /// differs from the device MTU.
    pub fn adv_mss(&self, device_mtu: u16) -> Option<u16> {
        let mtu = if self.mtu == 0 { device_mtu } else { self.mtu };
        if mtu != device_mtu {
            Some(mtu.saturating_sub(40))
        } else {
            None
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cidr)?;
        if self.mtu != 0 {
            write!(f, " mtu {}", self.mtu)?;
        }
        if let Some(metric) = self.metric {
            write!(f, " metric {metric}")?;
        }
        Ok(())
    }
}

/// Route manager bound to one interface
pub struct RouteManager {
    handle: net_route::Handle,
    interface: String,
    ifindex: u32,
    device_mtu: u16,
}

impl RouteManager {
    /// Create a route manager for the named interface.
    ///
    /// Requires root or `CAP_NET_ADMIN`.
    pub fn new(interface: &str, device_mtu: u16) -> Result<Self> {
        let handle = net_route::Handle::new()
            .map_err(|e| Error::Route(format!("failed to create route handle: {e}")))?;
        let ifindex = linux::interface_index(interface)?;

        Ok(Self {
            handle,
            interface: interface.to_string(),
            ifindex,
            device_mtu,
        })
    }

    /// Add a route to the routing table
    pub async fn add(&self, route: &Route) -> Result<()> {
        if !route.install {
            return Ok(());
        }

        let net_route =
            net_route::Route::new(IpAddr::V4(route.cidr.network()), route.cidr.prefix_len())
                .with_ifindex(self.ifindex);

        match self.handle.add(&net_route).await {
            Ok(()) => {
                log::info!("added route {} dev {}", route, self.interface);
            }
            Err(e) => {
                let err_str = e.to_string();
                // EEXIST: the kernel already created a connected route
                if err_str.contains("File exists") || err_str.contains("os error 17") {
                    log::debug!("route already exists: {route}");
                } else {
                    return Err(Error::Route(format!("failed to add route {route}: {e}")));
                }
            }
        }

        self.apply_mtu(route).await
    }

    /// Remove a route from the routing table
    pub async fn delete(&self, route: &Route) -> Result<()> {
        let net_route =
            net_route::Route::new(IpAddr::V4(route.cidr.network()), route.cidr.prefix_len())
                .with_ifindex(self.ifindex);

        self.handle
            .delete(&net_route)
            .await
            .map_err(|e| Error::Route(format!("failed to delete route {route}: {e}")))?;

        log::info!("deleted route {} dev {}", route, self.interface);
        Ok(())
    }

    /// Apply MTU and advmss to an installed route when they differ from the
    /// device defaults.
    async fn apply_mtu(&self, route: &Route) -> Result<()> {
        let Some(adv_mss) = route.adv_mss(self.device_mtu) else {
            return Ok(());
        };

        let output = Command::new("ip")
            .args([
                "route",
                "replace",
                &route.cidr.to_string(),
                "dev",
                &self.interface,
                "scope",
                "link",
                "mtu",
                &route.mtu.to_string(),
                "advmss",
                &adv_mss.to_string(),
            ])
            .output()
            .await
            .map_err(|e| Error::Route(format!("failed to run ip route: {e}")))?;

        if !output.status.success() {
            return Err(Error::Route(format!(
                "failed to set mtu {} on route {}: {}",
                route.mtu,
                route.cidr,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adv_mss_only_when_mtu_differs() {
        let same = Route::new("10.1.0.0/16".parse().unwrap()).with_mtu(1300);
        assert_eq!(same.adv_mss(1300), None);

        let default_mtu = Route::new("10.1.0.0/16".parse().unwrap());
        assert_eq!(default_mtu.adv_mss(1300), None);

        let smaller = Route::new("10.1.0.0/16".parse().unwrap()).with_mtu(1200);
        assert_eq!(smaller.adv_mss(1300), Some(1160));
    }

    #[test]
    fn test_route_display() {
        let route = Route::new("10.1.0.0/16".parse().unwrap()).with_mtu(1200);
        assert_eq!(route.to_string(), "10.1.0.0/16 mtu 1200");

        let plain = Route::new("10.1.0.0/16".parse().unwrap());
        assert_eq!(plain.to_string(), "10.1.0.0/16");
    }
}
