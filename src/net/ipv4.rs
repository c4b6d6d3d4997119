//! IPv4 routing, fragmentation and reassembly
//!
//! Input validation lives in [`Ipv4Header::parse`]. This module decides where
//! outbound datagrams go, splits them to fit the MTU, and puts inbound
//! fragments back together.

use alloc::vec::Vec;
use core::net::Ipv4Addr;

use crate::net::ip::{Ipv4Header, FLAG_MF, HEADER_LEN};

/// Reassembly slots (one datagram each)
pub const REASSEMBLY_SLOTS: usize = 4;

/// Incomplete fragment sets are discarded after this long
pub const REASSEMBLY_TIMEOUT_MS: u64 = 15_000;

// ═══════════════════════════════════════════════════════════════════════════════
// ROUTING
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a datagram is handed on the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHop {
    /// Send to the Ethernet broadcast address
    Broadcast,
    /// Resolve this address with ARP
    Host(Ipv4Addr),
}

/// Interface addressing used for route decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl Route {
    pub const UNCONFIGURED: Self = Self {
        ip: Ipv4Addr::UNSPECIFIED,
        netmask: Ipv4Addr::UNSPECIFIED,
        gateway: Ipv4Addr::UNSPECIFIED,
    };

    /// Check if an IP is on the local subnet
    pub fn is_local(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        (u32::from(self.ip) & mask) == (u32::from(ip) & mask)
    }

    /// Directed broadcast address of the local subnet
    pub fn subnet_broadcast(&self) -> Ipv4Addr {
        let mask = u32::from(self.netmask);
        Ipv4Addr::from(u32::from(self.ip) | !mask)
    }

    pub fn is_broadcast(&self, ip: Ipv4Addr) -> bool {
        ip.is_broadcast() || (!self.netmask.is_unspecified() && ip == self.subnet_broadcast())
    }

    /// On-link destinations directly, everything else via the gateway
    pub fn next_hop(&self, dst: Ipv4Addr) -> Option<NextHop> {
        if self.is_broadcast(dst) {
            Some(NextHop::Broadcast)
        } else if self.is_local(dst) {
            Some(NextHop::Host(dst))
        } else if !self.gateway.is_unspecified() {
            Some(NextHop::Host(self.gateway))
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FRAGMENTATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Build the IP packets carrying `payload`, fragmenting when it exceeds `mtu`
///
/// Every fragment but the last carries a multiple of 8 payload bytes.
pub fn fragment(header: &Ipv4Header, payload: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    if HEADER_LEN + payload.len() <= mtu {
        let mut header = header.clone();
        header.total_length = (HEADER_LEN + payload.len()) as u16;
        return alloc::vec![header.to_packet(payload)];
    }

    let chunk = ((mtu - HEADER_LEN) / 8).max(1) * 8;
    let mut packets = Vec::with_capacity(payload.len().div_ceil(chunk));
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + chunk).min(payload.len());
        let mut frag = header.clone();
        frag.total_length = (HEADER_LEN + end - offset) as u16;
        frag.fragment_offset = (offset / 8) as u16;
        if end < payload.len() {
            frag.flags |= FLAG_MF;
        } else {
            frag.flags &= !FLAG_MF;
        }
        packets.push(frag.to_packet(&payload[offset..end]));
        offset = end;
    }
    packets
}

// ═══════════════════════════════════════════════════════════════════════════════
// REASSEMBLY
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct ReassemblySlot {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    id: u16,
    protocol: u8,
    data: Vec<u8>,
    /// Received byte ranges, sorted and merged
    ranges: Vec<(usize, usize)>,
    /// Known once the last fragment arrived
    total: Option<usize>,
    deadline: u64,
}

impl ReassemblySlot {
    fn matches(&self, h: &Ipv4Header) -> bool {
        self.src == h.src && self.dst == h.dst && self.id == h.identification
            && self.protocol == u8::from(h.protocol)
    }

    fn insert_range(&mut self, start: usize, end: usize) {
        self.ranges.push((start, end));
        self.ranges.sort_unstable();
        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(self.ranges.len());
        for &(s, e) in &self.ranges {
            match merged.last_mut() {
                Some(last) if s <= last.1 => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.ranges = merged;
    }

    fn is_complete(&self) -> bool {
        match self.total {
            Some(total) => self.ranges.len() == 1 && self.ranges[0] == (0, total),
            None => false,
        }
    }
}

/// Outcome of feeding one fragment
#[derive(Debug, PartialEq, Eq)]
pub enum Reassembly {
    /// Waiting for more fragments
    Incomplete,
    /// All fragments present; the full payload
    Complete(Vec<u8>),
    /// Fragment rejected: too large, or no free slot
    Dropped,
}

/// Bounded fragment reassembly, one slot per datagram in progress
#[derive(Debug)]
pub struct Reassembler {
    slots: heapless::Vec<ReassemblySlot, REASSEMBLY_SLOTS>,
    max_bytes: usize,
}

impl Reassembler {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            slots: heapless::Vec::new(),
            max_bytes,
        }
    }

    pub fn in_progress(&self) -> usize {
        self.slots.len()
    }

    /// Add a fragment received at `now`
    pub fn push(&mut self, header: &Ipv4Header, payload: &[u8], now: u64) -> Reassembly {
        let start = header.fragment_byte_offset();
        let end = start + payload.len();
        if end > self.max_bytes {
            return Reassembly::Dropped;
        }

        let idx = match self.slots.iter().position(|s| s.matches(header)) {
            Some(idx) => idx,
            None => {
                let slot = ReassemblySlot {
                    src: header.src,
                    dst: header.dst,
                    id: header.identification,
                    protocol: u8::from(header.protocol),
                    data: Vec::new(),
                    ranges: Vec::new(),
                    total: None,
                    deadline: now + REASSEMBLY_TIMEOUT_MS,
                };
                if self.slots.push(slot).is_err() {
                    return Reassembly::Dropped;
                }
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[idx];
        if slot.data.len() < end {
            slot.data.resize(end, 0);
        }
        slot.data[start..end].copy_from_slice(payload);
        slot.insert_range(start, end);
        if !header.more_fragments() {
            slot.total = Some(end);
        }

        if slot.is_complete() {
            let mut slot = self.slots.swap_remove(idx);
            if let Some(total) = slot.total {
                slot.data.truncate(total);
            }
            return Reassembly::Complete(slot.data);
        }
        Reassembly::Incomplete
    }

    /// Discard sets whose deadline passed; returns how many
    pub fn expire(&mut self, now: u64) -> usize {
        let mut expired = 0;
        let mut i = 0;
        while i < self.slots.len() {
            if self.slots[i].deadline <= now {
                self.slots.swap_remove(i);
                expired += 1;
            } else {
                i += 1;
            }
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.slots.iter().map(|s| s.deadline).min()
    }
}
