//! Minimal DHCP server
//!
//! Hands out consecutive addresses from a configured pool. Leases are kept
//! in a fixed table keyed by client MAC; an OFFER reserves its address for a
//! short hold time until the matching REQUEST arrives.

use core::net::Ipv4Addr;

use log::{debug, info, trace};

use crate::config::DhcpServerConfig;
use crate::net::dhcp::{DhcpMessage, MessageType, Outgoing, CLIENT_PORT, SERVER_PORT};
use crate::net::ethernet::MacAddress;

/// Leases tracked at once
pub const MAX_LEASES: usize = 16;

/// How long an offered address stays reserved
pub const OFFER_HOLD_MS: u64 = 10_000;

/// One client's allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerLease {
    pub mac: MacAddress,
    pub ip: Ipv4Addr,
    pub expires_at: u64,
    /// ACKed (false while only offered)
    pub bound: bool,
}

pub struct DhcpServer {
    config: DhcpServerConfig,
    server_ip: Ipv4Addr,
    leases: heapless::Vec<ServerLease, MAX_LEASES>,
}

impl DhcpServer {
    pub fn new(config: DhcpServerConfig, server_ip: Ipv4Addr) -> Self {
        Self {
            config,
            server_ip,
            leases: heapless::Vec::new(),
        }
    }

    pub fn leases(&self) -> &[ServerLease] {
        &self.leases
    }

    fn lease_index(&self, mac: MacAddress) -> Option<usize> {
        self.leases.iter().position(|l| l.mac == mac)
    }

    fn in_pool(&self, ip: Ipv4Addr) -> bool {
        let start = u32::from(self.config.pool_start);
        let ip = u32::from(ip);
        ip >= start && ip - start < self.config.pool_size as u32
    }

    fn first_free(&self) -> Option<Ipv4Addr> {
        let start = u32::from(self.config.pool_start);
        (0..self.config.pool_size as u32)
            .map(|i| Ipv4Addr::from(start + i))
            .find(|ip| *ip != self.server_ip && !self.leases.iter().any(|l| l.ip == *ip))
    }

    /// Drop expired leases and stale offers; returns how many went
    pub fn expire(&mut self, now: u64) -> usize {
        let before = self.leases.len();
        let mut i = 0;
        while i < self.leases.len() {
            if now >= self.leases[i].expires_at {
                trace!("[DHCP] lease {} for {} expired", self.leases[i].ip, self.leases[i].mac);
                self.leases.swap_remove(i);
            } else {
                i += 1;
            }
        }
        before - self.leases.len()
    }

    /// Earliest lease expiry
    pub fn next_deadline(&self) -> Option<u64> {
        self.leases.iter().map(|l| l.expires_at).min()
    }

    /// Answer a client message, if it calls for a reply
    pub fn on_message(&mut self, msg: &DhcpMessage, now: u64) -> Option<Outgoing> {
        self.expire(now);
        match msg.message_type {
            MessageType::Discover => self.on_discover(msg, now),
            MessageType::Request => self.on_request(msg, now),
            MessageType::Release | MessageType::Decline => {
                if let Some(idx) = self.lease_index(msg.chaddr) {
                    let lease = self.leases.swap_remove(idx);
                    debug!("[DHCP] {} released {}", lease.mac, lease.ip);
                }
                None
            }
            _ => None,
        }
    }

    fn on_discover(&mut self, msg: &DhcpMessage, now: u64) -> Option<Outgoing> {
        let hold = now + OFFER_HOLD_MS;
        let ip = match self.lease_index(msg.chaddr) {
            Some(idx) => {
                let lease = &mut self.leases[idx];
                if !lease.bound {
                    lease.expires_at = hold;
                }
                lease.ip
            }
            None => {
                let Some(ip) = self.first_free() else {
                    debug!("[DHCP] pool exhausted, no offer for {}", msg.chaddr);
                    return None;
                };
                let lease = ServerLease {
                    mac: msg.chaddr,
                    ip,
                    expires_at: hold,
                    bound: false,
                };
                if self.leases.push(lease).is_err() {
                    debug!("[DHCP] lease table full, no offer for {}", msg.chaddr);
                    return None;
                }
                ip
            }
        };
        debug!("[DHCP] offering {} to {}", ip, msg.chaddr);
        Some(self.reply(msg, MessageType::Offer, ip))
    }

    fn on_request(&mut self, msg: &DhcpMessage, now: u64) -> Option<Outgoing> {
        if let Some(server_id) = msg.server_id {
            if server_id != self.server_ip {
                // Client chose another server; release our offer
                if let Some(idx) = self.lease_index(msg.chaddr) {
                    if !self.leases[idx].bound {
                        self.leases.swap_remove(idx);
                    }
                }
                return None;
            }
        }

        let requested = msg.requested_ip.unwrap_or(msg.ciaddr);
        let lease_ms = self.config.lease_time_s as u64 * 1000;

        match self.lease_index(msg.chaddr) {
            Some(idx) if self.leases[idx].ip == requested => {
                let lease = &mut self.leases[idx];
                lease.bound = true;
                lease.expires_at = now + lease_ms;
                info!("[DHCP] leased {} to {}", requested, msg.chaddr);
                Some(self.reply(msg, MessageType::Ack, requested))
            }
            None if self.in_pool(requested)
                && requested != self.server_ip
                && !self.leases.iter().any(|l| l.ip == requested) =>
            {
                // Client remembers an address from before our restart
                let lease = ServerLease {
                    mac: msg.chaddr,
                    ip: requested,
                    expires_at: now + lease_ms,
                    bound: true,
                };
                if self.leases.push(lease).is_err() {
                    return Some(self.reply(msg, MessageType::Nak, Ipv4Addr::UNSPECIFIED));
                }
                info!("[DHCP] leased {} to {}", requested, msg.chaddr);
                Some(self.reply(msg, MessageType::Ack, requested))
            }
            _ => {
                debug!("[DHCP] NAK {} for {}", requested, msg.chaddr);
                Some(self.reply(msg, MessageType::Nak, Ipv4Addr::UNSPECIFIED))
            }
        }
    }

    fn reply(&self, request: &DhcpMessage, kind: MessageType, ip: Ipv4Addr) -> Outgoing {
        let mut msg = DhcpMessage::new(kind, request.xid, request.chaddr);
        msg.flags = request.flags;
        msg.server_id = Some(self.server_ip);
        if kind != MessageType::Nak {
            msg.yiaddr = ip;
            msg.siaddr = self.server_ip;
            msg.subnet_mask = Some(self.config.netmask);
            msg.router = self.config.router;
            msg.dns = self.config.dns;
            msg.lease_time = Some(self.config.lease_time_s);
        }

        // Renewing clients have an address and can take unicast
        let (dst, dst_mac) = if kind != MessageType::Nak && !request.ciaddr.is_unspecified() {
            (request.ciaddr, request.chaddr)
        } else {
            (Ipv4Addr::BROADCAST, MacAddress::BROADCAST)
        };

        Outgoing {
            message: msg,
            src: self.server_ip,
            dst,
            dst_mac,
            src_port: SERVER_PORT,
            dst_port: CLIENT_PORT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    fn server(pool_size: u8) -> DhcpServer {
        let mut config = DhcpServerConfig::new(Ipv4Addr::new(10, 0, 0, 100), pool_size);
        config.lease_time_s = 60;
        config.router = Some(SERVER_IP);
        DhcpServer::new(config, SERVER_IP)
    }

    fn mac(n: u8) -> MacAddress {
        MacAddress([0x02, 0, 0, 0, 0, n])
    }

    fn discover(n: u8) -> DhcpMessage {
        DhcpMessage::new(MessageType::Discover, n as u32, mac(n))
    }

    fn request(n: u8, ip: Ipv4Addr) -> DhcpMessage {
        let mut msg = DhcpMessage::new(MessageType::Request, n as u32, mac(n));
        msg.requested_ip = Some(ip);
        msg.server_id = Some(SERVER_IP);
        msg
    }

    #[test]
    fn test_discover_request_ack() {
        let mut srv = server(4);
        let offer = srv.on_message(&discover(1), 0).unwrap();
        assert_eq!(offer.message.message_type, MessageType::Offer);
        assert_eq!(offer.message.yiaddr, Ipv4Addr::new(10, 0, 0, 100));
        assert_eq!(offer.dst, Ipv4Addr::BROADCAST);
        assert_eq!(offer.message.router, Some(SERVER_IP));

        let ack = srv.on_message(&request(1, offer.message.yiaddr), 10).unwrap();
        assert_eq!(ack.message.message_type, MessageType::Ack);
        assert_eq!(ack.message.lease_time, Some(60));
        assert!(srv.leases()[0].bound);
        assert_eq!(srv.leases()[0].expires_at, 60_010);
    }

    #[test]
    fn test_distinct_clients_get_distinct_addresses() {
        let mut srv = server(4);
        let a = srv.on_message(&discover(1), 0).unwrap();
        let b = srv.on_message(&discover(2), 0).unwrap();
        assert_ne!(a.message.yiaddr, b.message.yiaddr);
        // Same client asking again gets the same offer
        let again = srv.on_message(&discover(1), 0).unwrap();
        assert_eq!(again.message.yiaddr, a.message.yiaddr);
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut srv = server(1);
        assert!(srv.on_message(&discover(1), 0).is_some());
        assert!(srv.on_message(&discover(2), 0).is_none());
        // Offer hold lapses, the address is free again
        assert!(srv.on_message(&discover(2), OFFER_HOLD_MS).is_some());
    }

    #[test]
    fn test_request_for_wrong_address_naks() {
        let mut srv = server(4);
        srv.on_message(&discover(1), 0);
        let nak = srv.on_message(&request(1, Ipv4Addr::new(192, 168, 0, 9)), 0).unwrap();
        assert_eq!(nak.message.message_type, MessageType::Nak);
        assert_eq!(nak.message.yiaddr, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_request_for_other_server_drops_offer() {
        let mut srv = server(4);
        srv.on_message(&discover(1), 0);
        let mut req = request(1, Ipv4Addr::new(10, 0, 0, 100));
        req.server_id = Some(Ipv4Addr::new(10, 0, 0, 2));
        assert!(srv.on_message(&req, 0).is_none());
        assert!(srv.leases().is_empty());
    }

    #[test]
    fn test_renewal_reply_is_unicast() {
        let mut srv = server(4);
        let offer = srv.on_message(&discover(1), 0).unwrap();
        let ip = offer.message.yiaddr;
        srv.on_message(&request(1, ip), 0);

        let mut renew = DhcpMessage::new(MessageType::Request, 9, mac(1));
        renew.ciaddr = ip;
        let ack = srv.on_message(&renew, 30_000).unwrap();
        assert_eq!(ack.message.message_type, MessageType::Ack);
        assert_eq!(ack.dst, ip);
        assert_eq!(ack.dst_mac, mac(1));
        assert_eq!(srv.leases()[0].expires_at, 90_000);
    }

    #[test]
    fn test_release_frees_address() {
        let mut srv = server(1);
        let offer = srv.on_message(&discover(1), 0).unwrap();
        srv.on_message(&request(1, offer.message.yiaddr), 0);

        let mut release = DhcpMessage::new(MessageType::Release, 1, mac(1));
        release.ciaddr = offer.message.yiaddr;
        assert!(srv.on_message(&release, 5).is_none());
        assert!(srv.leases().is_empty());
        assert!(srv.on_message(&discover(2), 6).is_some());
    }

    #[test]
    fn test_bound_lease_expires() {
        let mut srv = server(4);
        let offer = srv.on_message(&discover(1), 0).unwrap();
        srv.on_message(&request(1, offer.message.yiaddr), 0);
        assert_eq!(srv.next_deadline(), Some(60_000));
        assert_eq!(srv.expire(60_000), 1);
    }
}
