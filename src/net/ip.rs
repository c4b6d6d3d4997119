//! IPv4 header (RFC 791)

use alloc::vec::Vec;
use core::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::net::{be16, checksum, ipv4_at};

/// Header length without options
pub const HEADER_LEN: usize = 20;

/// Default time to live for datagrams we originate
pub const DEFAULT_TTL: u8 = 64;

/// Don't Fragment
pub const FLAG_DF: u8 = 0b010;
/// More Fragments
pub const FLAG_MF: u8 = 0b001;

/// IPv4 Protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    ICMP,
    TCP,
    UDP,
    Unknown(u8),
}

impl From<u8> for IpProtocol {
    fn from(val: u8) -> Self {
        match val {
            1 => IpProtocol::ICMP,
            6 => IpProtocol::TCP,
            17 => IpProtocol::UDP,
            _ => IpProtocol::Unknown(val),
        }
    }
}

impl From<IpProtocol> for u8 {
    fn from(val: IpProtocol) -> Self {
        match val {
            IpProtocol::ICMP => 1,
            IpProtocol::TCP => 6,
            IpProtocol::UDP => 17,
            IpProtocol::Unknown(v) => v,
        }
    }
}

/// IPv4 Header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Internet Header Length in 32-bit words
    pub ihl: u8,
    pub dscp_ecn: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags: u8,
    /// In 8-byte units
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: IpProtocol,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Header for a datagram we originate
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, protocol: IpProtocol, payload_len: usize) -> Self {
        Self {
            ihl: 5,
            dscp_ecn: 0,
            total_length: (HEADER_LEN + payload_len) as u16,
            identification: 0,
            flags: 0,
            fragment_offset: 0,
            ttl: DEFAULT_TTL,
            protocol,
            checksum: 0,
            src,
            dst,
        }
    }

    /// Parse and validate a header: version, IHL, total length and checksum
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Malformed("packet too short for IPv4 header"));
        }

        let version = data[0] >> 4;
        let ihl = data[0] & 0x0F;
        if version != 4 {
            return Err(Error::Malformed("not an IPv4 packet"));
        }
        if ihl < 5 {
            return Err(Error::Malformed("invalid IHL"));
        }

        let header_len = ihl as usize * 4;
        let total_length = be16(data, 2);
        if data.len() < header_len
            || (total_length as usize) < header_len
            || (total_length as usize) > data.len()
        {
            return Err(Error::Malformed("IPv4 length mismatch"));
        }
        if checksum(&data[..header_len]) != 0 {
            return Err(Error::Malformed("IPv4 checksum mismatch"));
        }

        let flags_frag = be16(data, 6);
        Ok(Self {
            ihl,
            dscp_ecn: data[1],
            total_length,
            identification: be16(data, 4),
            flags: (flags_frag >> 13) as u8,
            fragment_offset: flags_frag & 0x1FFF,
            ttl: data[8],
            protocol: IpProtocol::from(data[9]),
            checksum: be16(data, 10),
            src: ipv4_at(data, 12),
            dst: ipv4_at(data, 16),
        })
    }

    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    pub fn payload_len(&self) -> usize {
        (self.total_length as usize).saturating_sub(self.header_len())
    }

    pub fn more_fragments(&self) -> bool {
        self.flags & FLAG_MF != 0
    }

    /// Byte offset of this fragment's payload in the original datagram
    pub fn fragment_byte_offset(&self) -> usize {
        self.fragment_offset as usize * 8
    }

    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset != 0
    }

    /// Serialize the 20-byte header with a freshly computed checksum
    ///
    /// Options are never emitted; `ihl` is written as 5.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = 0x45;
        bytes[1] = self.dscp_ecn;
        bytes[2..4].copy_from_slice(&self.total_length.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.identification.to_be_bytes());
        let flags_frag = ((self.flags as u16) << 13) | (self.fragment_offset & 0x1FFF);
        bytes[6..8].copy_from_slice(&flags_frag.to_be_bytes());
        bytes[8] = self.ttl;
        bytes[9] = u8::from(self.protocol);
        bytes[12..16].copy_from_slice(&self.src.octets());
        bytes[16..20].copy_from_slice(&self.dst.octets());

        let sum = checksum(&bytes);
        bytes[10..12].copy_from_slice(&sum.to_be_bytes());
        bytes
    }

    /// Header followed by `payload`
    pub fn to_packet(&self, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.extend_from_slice(&self.to_bytes());
        packet.extend_from_slice(payload);
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Ipv4Header {
        Ipv4Header::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            IpProtocol::UDP,
            4,
        )
    }

    #[test]
    fn test_header_parse_roundtrip() {
        let packet = sample().to_packet(&[1, 2, 3, 4]);
        let header = Ipv4Header::parse(&packet).unwrap();
        assert_eq!(header.protocol, IpProtocol::UDP);
        assert_eq!(header.total_length, 24);
        assert_eq!(header.payload_len(), 4);
        assert_eq!(header.src, Ipv4Addr::new(10, 0, 0, 1));
        assert!(!header.is_fragment());
    }

    #[test]
    fn test_header_rejects_bad_checksum() {
        let mut packet = sample().to_packet(&[1, 2, 3, 4]);
        packet[8] = 1; // TTL changed without fixing the checksum
        assert!(Ipv4Header::parse(&packet).is_err());
    }

    #[test]
    fn test_header_rejects_truncated_total_length() {
        let mut header = sample();
        header.total_length = 100;
        let packet = header.to_packet(&[1, 2, 3, 4]);
        assert!(Ipv4Header::parse(&packet).is_err());
    }

    #[test]
    fn test_header_rejects_wrong_version() {
        let mut packet = sample().to_packet(&[]);
        packet[0] = 0x65;
        assert!(Ipv4Header::parse(&packet).is_err());
    }

    #[test]
    fn test_fragment_fields() {
        let mut header = sample();
        header.flags = FLAG_MF;
        header.fragment_offset = 185;
        let parsed = Ipv4Header::parse(&header.to_packet(&[0; 4])).unwrap();
        assert!(parsed.more_fragments());
        assert_eq!(parsed.fragment_byte_offset(), 1480);
    }
}
