//! Connection URLs
//!
//! `listen` and `connect` take `[scheme://]host:port`. The scheme is `tcp`
//! (default) or `udp`; the host is an IPv4 literal, empty/`0.0.0.0` for
//! "any", or a name handed to the resolver.

use alloc::string::ToString;
use core::net::{Ipv4Addr, SocketAddrV4};
use core::str::FromStr;

use crate::error::{Error, Result};

/// Transport selected by a URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Udp,
}

/// Parsed `scheme://host:port`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Url<'a> {
    pub scheme: Scheme,
    pub host: &'a str,
    pub port: u16,
}

impl<'a> Url<'a> {
    pub fn parse(url: &'a str) -> Result<Self> {
        let (scheme, rest) = match url.find("://") {
            Some(pos) => {
                let scheme = match &url[..pos] {
                    "tcp" => Scheme::Tcp,
                    "udp" => Scheme::Udp,
                    other => return Err(Error::UnsupportedScheme(other.to_string())),
                };
                (scheme, &url[pos + 3..])
            }
            None => (Scheme::Tcp, url),
        };

        let rest = rest.trim_end_matches('/');
        let colon = rest
            .rfind(':')
            .ok_or_else(|| Error::InvalidAddress(url.to_string()))?;
        let host = &rest[..colon];
        let port = rest[colon + 1..]
            .parse::<u16>()
            .map_err(|_| Error::InvalidAddress(url.to_string()))?;

        Ok(Self { scheme, host, port })
    }

    /// The host as an IPv4 literal, if it is one (empty host means "any")
    pub fn ip(&self) -> Option<Ipv4Addr> {
        if self.host.is_empty() {
            return Some(Ipv4Addr::UNSPECIFIED);
        }
        Ipv4Addr::from_str(self.host).ok()
    }

    /// Socket address when the host needs no resolution
    pub fn socket_addr(&self) -> Option<SocketAddrV4> {
        self.ip().map(|ip| SocketAddrV4::new(ip, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_url() {
        let url = Url::parse("udp://10.0.0.1:53").unwrap();
        assert_eq!(url.scheme, Scheme::Udp);
        assert_eq!(url.host, "10.0.0.1");
        assert_eq!(url.port, 53);
        assert_eq!(url.socket_addr(), Some(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 53)));
    }

    #[test]
    fn test_parse_defaults_to_tcp_any() {
        let url = Url::parse(":8000").unwrap();
        assert_eq!(url.scheme, Scheme::Tcp);
        assert_eq!(url.ip(), Some(Ipv4Addr::UNSPECIFIED));
        assert_eq!(url.port, 8000);
    }

    #[test]
    fn test_parse_host_name() {
        let url = Url::parse("tcp://broker.local:1883/").unwrap();
        assert_eq!(url.host, "broker.local");
        assert_eq!(url.ip(), None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(Url::parse("http://x:80"), Err(Error::UnsupportedScheme(_))));
        assert!(matches!(Url::parse("tcp://nohost"), Err(Error::InvalidAddress(_))));
        assert!(matches!(Url::parse("tcp://a:99999"), Err(Error::InvalidAddress(_))));
    }
}
