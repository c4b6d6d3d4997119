//! Name resolution
//!
//! DNS message handling is a protocol layer of its own; the manager only
//! needs an answer for a host name. It asks the resolver once per poll while
//! a connection is in `Resolving` and enforces the timeout itself.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use core::net::Ipv4Addr;

/// Outcome of a lookup attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Ask again on the next poll
    Pending,
    Resolved(Ipv4Addr),
    Failed,
}

/// Host name lookup
pub trait Resolver {
    fn resolve(&mut self, host: &str, now_ms: u64) -> Resolution;
}

/// Fixed hosts table
#[derive(Debug, Clone)]
pub struct StaticResolver {
    hosts: BTreeMap<String, Ipv4Addr>,
}

impl StaticResolver {
    /// Empty table except for `localhost`
    pub fn new() -> Self {
        let mut hosts = BTreeMap::new();
        hosts.insert("localhost".to_string(), Ipv4Addr::LOCALHOST);
        Self { hosts }
    }

    pub fn insert(&mut self, host: &str, ip: Ipv4Addr) {
        self.hosts.insert(host.to_ascii_lowercase(), ip);
    }
}

impl Default for StaticResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for StaticResolver {
    fn resolve(&mut self, host: &str, _now_ms: u64) -> Resolution {
        match self.hosts.get(&host.to_ascii_lowercase()) {
            Some(ip) => Resolution::Resolved(*ip),
            None => Resolution::Failed,
        }
    }
}

/// Host resolver backed by the operating system
///
/// `ToSocketAddrs` blocks, so this suits tools and tests more than servers
/// that must keep a tight poll cadence.
#[cfg(feature = "std")]
#[derive(Debug, Clone, Default)]
pub struct StdResolver;

#[cfg(feature = "std")]
impl Resolver for StdResolver {
    fn resolve(&mut self, host: &str, _now_ms: u64) -> Resolution {
        use std::net::{SocketAddr, ToSocketAddrs};

        match (host, 0u16).to_socket_addrs() {
            Ok(addrs) => addrs
                .filter_map(|a| match a {
                    SocketAddr::V4(v4) => Some(*v4.ip()),
                    SocketAddr::V6(_) => None,
                })
                .next()
                .map_or(Resolution::Failed, Resolution::Resolved),
            Err(_) => Resolution::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_resolver() {
        let mut r = StaticResolver::new();
        r.insert("Sensor.Local", Ipv4Addr::new(192, 168, 1, 20));
        assert_eq!(r.resolve("localhost", 0), Resolution::Resolved(Ipv4Addr::LOCALHOST));
        assert_eq!(
            r.resolve("sensor.local", 0),
            Resolution::Resolved(Ipv4Addr::new(192, 168, 1, 20))
        );
        assert_eq!(r.resolve("nowhere", 0), Resolution::Failed);
    }
}
