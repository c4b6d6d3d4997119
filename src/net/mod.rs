//! Network Stack
//!
//! A small TCP/IP stack for targets without an operating system: Ethernet,
//! ARP, IPv4 (fragmentation and reassembly), ICMP, UDP, TCP and DHCP. The
//! [`Stack`] owns every table; nothing here is global.

pub mod arp;
pub mod dhcp;
pub mod driver;
pub mod ethernet;
pub mod icmp;
pub mod ip;
pub mod ipv4;
pub mod stack;
pub mod stats;
pub mod tcp;
pub mod udp;

// Re-export key types for convenience
pub use driver::{Driver, QueueDriver, QueueHandle, Side, Wire, WireEnd};
pub use ethernet::MacAddress;
pub use stack::{SocketHandle, Stack};
pub use stats::Stats;
pub use tcp::TcpState;

use core::net::Ipv4Addr;

// ═══════════════════════════════════════════════════════════════════════════════
// CHECKSUM (RFC 1071)
// ═══════════════════════════════════════════════════════════════════════════════

/// Sum 16-bit big-endian words into a 32-bit accumulator
fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    // Handle odd byte
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

/// Fold to 16 bits and return the one's complement
fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Calculate Internet checksum (RFC 1071)
///
/// Used for IP and ICMP checksums. A buffer that already carries a correct
/// checksum sums to zero.
pub fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(0, data))
}

/// Checksum over the IPv4 pseudo-header followed by `segment` (UDP and TCP)
///
/// The pseudo-header is 12 bytes: source, destination, zero, protocol and
/// the segment length.
pub fn pseudo_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = protocol;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());
    fold(sum_words(sum_words(0, &pseudo), segment))
}

// ═══════════════════════════════════════════════════════════════════════════════
// WIRE HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) fn be16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

pub(crate) fn be32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

pub(crate) fn ipv4_at(data: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[at], data[at + 1], data[at + 2], data[at + 3])
}

// ═══════════════════════════════════════════════════════════════════════════════
// RANDOM NUMBERS
// ═══════════════════════════════════════════════════════════════════════════════

/// xorshift32 generator for sequence numbers, xids and ephemeral ports
#[derive(Debug, Clone)]
pub(crate) struct Rng(u32);

impl Rng {
    pub(crate) fn new(seed: u32) -> Self {
        Self(if seed == 0 { 0x9E37_79B9 } else { seed })
    }

    pub(crate) fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_rfc1071_example() {
        // Worked example from RFC 1071 section 3
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), !0xddf2);
    }

    #[test]
    fn test_checksum_verifies_to_zero() {
        let mut header = [
            0x45, 0x00, 0x00, 0x1c, 0x12, 0x34, 0x00, 0x00, 0x40, 0x11, 0x00, 0x00, 10, 0, 0, 1,
            10, 0, 0, 2,
        ];
        let sum = checksum(&header);
        header[10..12].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(checksum(&header), 0);
    }

    #[test]
    fn test_checksum_odd_length() {
        assert_eq!(checksum(&[0xff]), !0xff00);
    }

    #[test]
    fn test_rng_is_deterministic() {
        let mut a = Rng::new(7);
        let mut b = Rng::new(7);
        assert_eq!(a.next_u32(), b.next_u32());
        assert_ne!(Rng::new(0).next_u32(), 0);
    }
}
