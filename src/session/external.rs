//! Collaborators owned by the embedding application

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::ssh::Endpoint;

/// Is there any network route at all? Consulted before `connect`.
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn is_network_available(&self) -> bool;
}

/// Checks for a default route by connecting a UDP socket.
///
/// UDP `connect` only asks the kernel for a route; no packet is sent. The
/// probe addresses are tried in order, IPv4 first, so an IPv6-only host
/// still counts as online.
pub struct RouteReachability {
    probe_addrs: Vec<SocketAddr>,
    timeout: Duration,
}

impl RouteReachability {
    pub fn new() -> Self {
        Self::with_probe_addrs(vec![
            SocketAddr::from((Ipv4Addr::new(8, 8, 8, 8), 53)),
            SocketAddr::from((Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888), 53)),
        ])
    }

    pub fn with_probe_addrs(probe_addrs: Vec<SocketAddr>) -> Self {
        Self {
            probe_addrs,
            timeout: Duration::from_secs(2),
        }
    }

    async fn has_route(&self, addr: SocketAddr) -> bool {
        let local = if addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let check = async {
            let socket = UdpSocket::bind(local).await?;
            socket.connect(addr).await?;
            Ok::<(), std::io::Error>(())
        };
        match tokio::time::timeout(self.timeout, check).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("No route to {}: {}", addr, e);
                false
            }
            Err(_) => {
                debug!("Route check to {} timed out", addr);
                false
            }
        }
    }
}

impl Default for RouteReachability {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reachability for RouteReachability {
    async fn is_network_available(&self) -> bool {
        for addr in &self.probe_addrs {
            if self.has_route(*addr).await {
                return true;
            }
        }
        false
    }
}

/// Always reports a network. For loopback-only setups.
pub struct AlwaysReachable;

#[async_trait]
impl Reachability for AlwaysReachable {
    async fn is_network_available(&self) -> bool {
        true
    }
}

/// Persistence for the OS fingerprint written back after detection.
pub trait EndpointStore: Send + Sync {
    fn save_os_fingerprint(&self, endpoint: &Endpoint, fingerprint: &str);
}

/// Discards write-backs
pub struct NullEndpointStore;

impl EndpointStore for NullEndpointStore {
    fn save_os_fingerprint(&self, _endpoint: &Endpoint, _fingerprint: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::new(a, b, c, d), 9))
    }

    #[tokio::test]
    async fn test_loopback_route_is_available() {
        let reach = RouteReachability::with_probe_addrs(vec![v4(127, 0, 0, 1)]);
        assert!(reach.is_network_available().await);
        assert!(AlwaysReachable.is_network_available().await);
    }

    #[tokio::test]
    async fn test_falls_back_to_next_probe_address() {
        // Connecting to broadcast without SO_BROADCAST is refused
        let refused = v4(255, 255, 255, 255);
        assert!(
            !RouteReachability::with_probe_addrs(vec![refused])
                .is_network_available()
                .await
        );
        assert!(
            RouteReachability::with_probe_addrs(vec![refused, v4(127, 0, 0, 1)])
                .is_network_available()
                .await
        );
    }

    #[test]
    fn test_default_probes_both_families() {
        let reach = RouteReachability::new();
        assert!(reach.probe_addrs[0].is_ipv4());
        assert!(reach.probe_addrs[1].is_ipv6());
    }
}
