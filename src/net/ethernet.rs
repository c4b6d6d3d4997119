//! Ethernet II framing

use alloc::vec::Vec;
use core::fmt;

use crate::error::{Error, Result};

/// Ethernet header length (no VLAN tag, no FCS)
pub const HEADER_LEN: usize = 14;

/// Ethernet Protocol Type (EtherType)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherType {
    IPv4,
    ARP,
    IPv6,
    Unknown(u16),
}

impl From<u16> for EtherType {
    fn from(val: u16) -> Self {
        match val {
            0x0800 => EtherType::IPv4,
            0x0806 => EtherType::ARP,
            0x86DD => EtherType::IPv6,
            _ => EtherType::Unknown(val),
        }
    }
}

impl From<EtherType> for u16 {
    fn from(val: EtherType) -> Self {
        match val {
            EtherType::IPv4 => 0x0800,
            EtherType::ARP => 0x0806,
            EtherType::IPv6 => 0x86DD,
            EtherType::Unknown(v) => v,
        }
    }
}

/// Ethernet MAC Address
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: Self = Self([0xFF; 6]);
    pub const ZERO: Self = Self([0; 6]);

    pub const fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        Self([a, b, c, d, e, f])
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group bit set (broadcast included)
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Borrowed view of an Ethernet frame
#[derive(Debug, Clone, Copy)]
pub struct EthernetFrame<'a> {
    pub dst: MacAddress,
    pub src: MacAddress,
    pub ethertype: EtherType,
    pub payload: &'a [u8],
}

impl<'a> EthernetFrame<'a> {
    /// Parse an Ethernet frame from raw bytes
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Malformed("frame shorter than Ethernet header"));
        }

        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&data[0..6]);
        src.copy_from_slice(&data[6..12]);
        let ethertype = EtherType::from(u16::from_be_bytes([data[12], data[13]]));

        Ok(Self {
            dst: MacAddress(dst),
            src: MacAddress(src),
            ethertype,
            payload: &data[HEADER_LEN..],
        })
    }

    /// Serialize a frame carrying `payload`
    pub fn build(dst: MacAddress, src: MacAddress, ethertype: EtherType, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(&dst.0);
        bytes.extend_from_slice(&src.0);
        bytes.extend_from_slice(&u16::from(ethertype).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_parse_and_build() {
        let src = MacAddress::new(2, 0, 0, 0, 0, 1);
        let bytes = EthernetFrame::build(MacAddress::BROADCAST, src, EtherType::ARP, &[1, 2, 3]);
        assert_eq!(bytes.len(), 17);
        assert_eq!(&bytes[12..14], &[0x08, 0x06]);

        let frame = EthernetFrame::parse(&bytes).unwrap();
        assert!(frame.dst.is_broadcast());
        assert_eq!(frame.src, src);
        assert_eq!(frame.ethertype, EtherType::ARP);
        assert_eq!(frame.payload, &[1, 2, 3]);
    }

    #[test]
    fn test_frame_too_short() {
        assert!(EthernetFrame::parse(&[0u8; 13]).is_err());
    }

    #[test]
    fn test_mac_display() {
        let mac = MacAddress::new(0xde, 0xad, 0xbe, 0xef, 0x00, 0x01);
        assert_eq!(alloc::format!("{}", mac), "de:ad:be:ef:00:01");
        assert!(MacAddress::BROADCAST.is_multicast());
        assert!(!mac.is_multicast());
    }
}
