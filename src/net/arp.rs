//! ARP (Address Resolution Protocol)
//!
//! Maps IPv4 addresses to MAC addresses on the local network (RFC 826).
//! The cache and the pending-resolution table are plain values owned by the
//! stack.

use alloc::vec::Vec;
use core::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::net::ethernet::MacAddress;
use crate::net::{be16, ipv4_at};

/// ARP payload length for Ethernet/IPv4
pub const PACKET_LEN: usize = 28;

/// Cache capacity
pub const CACHE_SIZE: usize = 16;

/// Destinations that may wait for resolution at once
pub const PENDING_SIZE: usize = 8;

/// Lifetime of a learned mapping
pub const ENTRY_TTL_MS: u64 = 300_000;

/// Requests sent for one destination before giving up
pub const ARP_MAX_RETRIES: u8 = 3;

/// First retry interval; doubles after every retry
pub const ARP_RETRY_MS: u64 = 1_000;

// ═══════════════════════════════════════════════════════════════════════════════
// ARP PACKET
// ═══════════════════════════════════════════════════════════════════════════════

/// ARP operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOp {
    Request,
    Reply,
    Unknown(u16),
}

impl From<u16> for ArpOp {
    fn from(val: u16) -> Self {
        match val {
            1 => ArpOp::Request,
            2 => ArpOp::Reply,
            _ => ArpOp::Unknown(val),
        }
    }
}

impl From<ArpOp> for u16 {
    fn from(val: ArpOp) -> Self {
        match val {
            ArpOp::Request => 1,
            ArpOp::Reply => 2,
            ArpOp::Unknown(v) => v,
        }
    }
}

/// Ethernet/IPv4 ARP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub op: ArpOp,
    pub sender_mac: MacAddress,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddress,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn request(sender_mac: MacAddress, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            op: ArpOp::Request,
            sender_mac,
            sender_ip,
            target_mac: MacAddress::ZERO,
            target_ip,
        }
    }

    /// Announcement of our own mapping (sender and target IP equal)
    pub fn gratuitous(mac: MacAddress, ip: Ipv4Addr) -> Self {
        Self::request(mac, ip, ip)
    }

    /// Reply to `request` from the host owning its target address
    pub fn reply_to(request: &ArpPacket, our_mac: MacAddress) -> Self {
        Self {
            op: ArpOp::Reply,
            sender_mac: our_mac,
            sender_ip: request.target_ip,
            target_mac: request.sender_mac,
            target_ip: request.sender_ip,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < PACKET_LEN {
            return Err(Error::Malformed("ARP packet too short"));
        }

        let hw_type = be16(data, 0);
        let proto_type = be16(data, 2);
        let hw_len = data[4];
        let proto_len = data[5];

        // Only support Ethernet (hw_type=1) and IPv4 (proto_type=0x0800)
        if hw_type != 1 || proto_type != 0x0800 || hw_len != 6 || proto_len != 4 {
            return Err(Error::Malformed("unsupported ARP parameters"));
        }

        let mut sender_mac = [0u8; 6];
        let mut target_mac = [0u8; 6];
        sender_mac.copy_from_slice(&data[8..14]);
        target_mac.copy_from_slice(&data[18..24]);

        Ok(Self {
            op: ArpOp::from(be16(data, 6)),
            sender_mac: MacAddress(sender_mac),
            sender_ip: ipv4_at(data, 14),
            target_mac: MacAddress(target_mac),
            target_ip: ipv4_at(data, 24),
        })
    }

    pub fn to_bytes(&self) -> [u8; PACKET_LEN] {
        let mut packet = [0u8; PACKET_LEN];
        packet[0..2].copy_from_slice(&1u16.to_be_bytes()); // HW Type: Ethernet
        packet[2..4].copy_from_slice(&0x0800u16.to_be_bytes()); // Proto Type: IPv4
        packet[4] = 6;
        packet[5] = 4;
        packet[6..8].copy_from_slice(&u16::from(self.op).to_be_bytes());
        packet[8..14].copy_from_slice(&self.sender_mac.0);
        packet[14..18].copy_from_slice(&self.sender_ip.octets());
        packet[18..24].copy_from_slice(&self.target_mac.0);
        packet[24..28].copy_from_slice(&self.target_ip.octets());
        packet
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ARP CACHE
// ═══════════════════════════════════════════════════════════════════════════════

/// ARP Cache Entry
#[derive(Debug, Clone, Copy)]
struct ArpEntry {
    ip: Ipv4Addr,
    mac: MacAddress,
    expires_at: u64,
}

/// ARP Cache (simple linear search for embedded systems)
#[derive(Debug, Default)]
pub struct ArpCache {
    entries: heapless::Vec<ArpEntry, CACHE_SIZE>,
}

impl ArpCache {
    pub const fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, ip: Ipv4Addr, now: u64) -> Option<MacAddress> {
        self.entries
            .iter()
            .find(|e| e.ip == ip && e.expires_at > now)
            .map(|e| e.mac)
    }

    /// Learn or refresh a mapping; evicts the entry closest to expiry when full
    pub fn insert(&mut self, ip: Ipv4Addr, mac: MacAddress, now: u64) {
        let expires_at = now + ENTRY_TTL_MS;
        if let Some(entry) = self.entries.iter_mut().find(|e| e.ip == ip) {
            entry.mac = mac;
            entry.expires_at = expires_at;
            return;
        }

        if self.entries.is_full() {
            let oldest = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(i, _)| i);
            if let Some(i) = oldest {
                self.entries.swap_remove(i);
            }
        }
        let _ = self.entries.push(ArpEntry { ip, mac, expires_at });
    }

    /// Drop expired entries; returns how many
    pub fn expire(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].expires_at <= now {
                self.entries.swap_remove(i);
            } else {
                i += 1;
            }
        }
        before - self.entries.len()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PENDING RESOLUTIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// IP datagram parked until its next hop resolves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkedPacket {
    /// Complete IP packets (more than one if the datagram was fragmented)
    pub packets: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct PendingEntry {
    ip: Ipv4Addr,
    parked: Option<ParkedPacket>,
    retries: u8,
    next_retry_at: u64,
}

/// What to do about one unresolved destination at a given time
#[derive(Debug, PartialEq, Eq)]
pub enum PendingAction {
    /// Send another request for this address
    Retry(Ipv4Addr),
    /// Retries exhausted; the parked packet is dropped
    GiveUp(Ipv4Addr),
}

/// Destinations awaiting an ARP reply, one parked packet each
#[derive(Debug, Default)]
pub struct ArpPending {
    entries: heapless::Vec<PendingEntry, PENDING_SIZE>,
}

impl ArpPending {
    pub const fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.entries.iter().any(|e| e.ip == ip)
    }

    /// Park `packet` for `ip`, replacing any packet already waiting there.
    ///
    /// Returns `Ok(true)` when a request should be sent now (new
    /// destination), `Ok(false)` when one is already outstanding, and
    /// `Err(TooManyConnections)` when the table is full.
    pub fn park(&mut self, ip: Ipv4Addr, packet: ParkedPacket, now: u64) -> Result<bool> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.ip == ip) {
            entry.parked = Some(packet);
            return Ok(false);
        }
        self.entries
            .push(PendingEntry {
                ip,
                parked: Some(packet),
                retries: 0,
                next_retry_at: now + ARP_RETRY_MS,
            })
            .map_err(|_| Error::TooManyConnections)?;
        Ok(true)
    }

    /// Remove `ip` and hand back its parked packet
    pub fn resolve(&mut self, ip: Ipv4Addr) -> Option<ParkedPacket> {
        let idx = self.entries.iter().position(|e| e.ip == ip)?;
        self.entries.swap_remove(idx).parked
    }

    /// Advance retry timers
    pub fn poll(&mut self, now: u64) -> Vec<PendingAction> {
        let mut actions = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            let entry = &mut self.entries[i];
            if entry.next_retry_at > now {
                i += 1;
                continue;
            }
            if entry.retries >= ARP_MAX_RETRIES {
                actions.push(PendingAction::GiveUp(entry.ip));
                self.entries.swap_remove(i);
                continue;
            }
            entry.retries += 1;
            entry.next_retry_at = now + (ARP_RETRY_MS << entry.retries);
            actions.push(PendingAction::Retry(entry.ip));
            i += 1;
        }
        actions
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.iter().map(|e| e.next_retry_at).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    const MAC: MacAddress = MacAddress::new(2, 0, 0, 0, 0, 1);

    // ──────────────────────────────────────────────────────────────────────────
    // PACKET TESTS
    // ──────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_packet_layout() {
        let req = ArpPacket::request(MAC, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2));
        let bytes = req.to_bytes();
        assert_eq!(&bytes[0..8], &[0, 1, 8, 0, 6, 4, 0, 1]);
        assert_eq!(ArpPacket::parse(&bytes).unwrap(), req);
    }

    #[test]
    fn test_reply_swaps_addresses() {
        let req = ArpPacket::request(MAC, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2));
        let ours = MacAddress::new(2, 0, 0, 0, 0, 2);
        let reply = ArpPacket::reply_to(&req, ours);
        assert_eq!(reply.op, ArpOp::Reply);
        assert_eq!(reply.sender_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(reply.target_mac, MAC);
    }

    #[test]
    fn test_parse_rejects_non_ethernet() {
        let mut bytes = ArpPacket::gratuitous(MAC, Ipv4Addr::new(10, 0, 0, 1)).to_bytes();
        bytes[1] = 6;
        assert!(ArpPacket::parse(&bytes).is_err());
        assert!(ArpPacket::parse(&bytes[..20]).is_err());
    }

    // ──────────────────────────────────────────────────────────────────────────
    // CACHE TESTS
    // ──────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_cache_expiry() {
        let mut cache = ArpCache::new();
        let ip = Ipv4Addr::new(10, 0, 0, 9);
        cache.insert(ip, MAC, 0);
        assert_eq!(cache.lookup(ip, 1), Some(MAC));
        assert_eq!(cache.lookup(ip, ENTRY_TTL_MS), None);
        assert_eq!(cache.expire(ENTRY_TTL_MS), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_evicts_oldest_when_full() {
        let mut cache = ArpCache::new();
        for i in 0..CACHE_SIZE as u8 {
            cache.insert(Ipv4Addr::new(10, 0, 0, i), MAC, i as u64);
        }
        cache.insert(Ipv4Addr::new(10, 0, 1, 0), MAC, 100);
        assert_eq!(cache.len(), CACHE_SIZE);
        assert_eq!(cache.lookup(Ipv4Addr::new(10, 0, 0, 0), 100), None);
        assert!(cache.lookup(Ipv4Addr::new(10, 0, 1, 0), 100).is_some());
    }

    // ──────────────────────────────────────────────────────────────────────────
    // PENDING TESTS
    // ──────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_pending_keeps_one_packet() {
        let mut pending = ArpPending::new();
        let ip = Ipv4Addr::new(10, 0, 0, 2);
        assert_eq!(pending.park(ip, ParkedPacket { packets: vec![vec![1]] }, 0), Ok(true));
        assert_eq!(pending.park(ip, ParkedPacket { packets: vec![vec![2]] }, 0), Ok(false));
        assert_eq!(pending.resolve(ip), Some(ParkedPacket { packets: vec![vec![2]] }));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_pending_backoff_then_give_up() {
        let mut pending = ArpPending::new();
        let ip = Ipv4Addr::new(10, 0, 0, 2);
        pending.park(ip, ParkedPacket { packets: vec![] }, 0).unwrap();

        assert!(pending.poll(999).is_empty());
        assert_eq!(pending.poll(1_000), vec![PendingAction::Retry(ip)]);
        assert_eq!(pending.next_deadline(), Some(3_000));
        assert_eq!(pending.poll(3_000), vec![PendingAction::Retry(ip)]);
        assert_eq!(pending.next_deadline(), Some(7_000));
        assert_eq!(pending.poll(7_000), vec![PendingAction::Retry(ip)]);
        assert_eq!(pending.poll(15_000), vec![PendingAction::GiveUp(ip)]);
        assert!(pending.is_empty());
    }
}
