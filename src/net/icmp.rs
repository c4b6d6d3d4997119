//! ICMP (RFC 792)
//!
//! Echo reply and destination unreachable; everything else is ignored.

use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::net::{be16, be32, checksum};

/// Destination unreachable codes
pub const CODE_NET_UNREACHABLE: u8 = 0;
pub const CODE_HOST_UNREACHABLE: u8 = 1;
pub const CODE_PROTOCOL_UNREACHABLE: u8 = 2;
pub const CODE_PORT_UNREACHABLE: u8 = 3;

/// ICMP Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpType {
    EchoReply,
    DestinationUnreachable,
    EchoRequest,
    Unknown(u8),
}

impl From<u8> for IcmpType {
    fn from(val: u8) -> Self {
        match val {
            0 => IcmpType::EchoReply,
            3 => IcmpType::DestinationUnreachable,
            8 => IcmpType::EchoRequest,
            _ => IcmpType::Unknown(val),
        }
    }
}

impl From<IcmpType> for u8 {
    fn from(val: IcmpType) -> Self {
        match val {
            IcmpType::EchoReply => 0,
            IcmpType::DestinationUnreachable => 3,
            IcmpType::EchoRequest => 8,
            IcmpType::Unknown(v) => v,
        }
    }
}

/// ICMP Packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpPacket {
    pub icmp_type: IcmpType,
    pub code: u8,
    /// Identifier + Sequence Number for Echo, unused for unreachable
    pub rest_of_header: u32,
    pub payload: Vec<u8>,
}

impl IcmpPacket {
    /// Parse and verify the checksum
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::Malformed("packet too short for ICMP header"));
        }
        if checksum(data) != 0 {
            return Err(Error::Malformed("ICMP checksum mismatch"));
        }

        Ok(Self {
            icmp_type: IcmpType::from(data[0]),
            code: data[1],
            rest_of_header: be32(data, 4),
            payload: data[8..].to_vec(),
        })
    }

    /// Serialize with the checksum filled in
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + self.payload.len());
        bytes.push(u8::from(self.icmp_type));
        bytes.push(self.code);
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&self.rest_of_header.to_be_bytes());
        bytes.extend_from_slice(&self.payload);

        let sum = checksum(&bytes);
        bytes[2..4].copy_from_slice(&sum.to_be_bytes());
        bytes
    }

    /// Echo reply carrying the request's identifier, sequence and data
    pub fn echo_reply(request: &IcmpPacket) -> Self {
        Self {
            icmp_type: IcmpType::EchoReply,
            code: 0,
            rest_of_header: request.rest_of_header,
            payload: request.payload.clone(),
        }
    }

    pub fn echo_request(ident: u16, seq: u16, data: &[u8]) -> Self {
        Self {
            icmp_type: IcmpType::EchoRequest,
            code: 0,
            rest_of_header: ((ident as u32) << 16) | seq as u32,
            payload: data.to_vec(),
        }
    }

    /// Unreachable message quoting the offending IP header and 8 payload bytes
    pub fn unreachable(code: u8, original_ip_packet: &[u8]) -> Self {
        let header_len = original_ip_packet
            .first()
            .map_or(0, |b| (b & 0x0F) as usize * 4);
        let quote = (header_len + 8).min(original_ip_packet.len());
        Self {
            icmp_type: IcmpType::DestinationUnreachable,
            code,
            rest_of_header: 0,
            payload: original_ip_packet[..quote].to_vec(),
        }
    }

    /// For an unreachable message: (protocol, source port, destination port)
    /// of the quoted datagram, ports being those of our original packet
    pub fn quoted_ports(&self) -> Option<(u8, u16, u16)> {
        let quoted = &self.payload;
        let header_len = (quoted.first()? & 0x0F) as usize * 4;
        if quoted.len() < header_len + 4 || header_len < 20 {
            return None;
        }
        Some((quoted[9], be16(quoted, header_len), be16(quoted, header_len + 2)))
    }

    /// Destination address of the quoted datagram
    pub fn quoted_destination(&self) -> Option<core::net::Ipv4Addr> {
        if self.payload.len() < 20 {
            return None;
        }
        Some(crate::net::ipv4_at(&self.payload, 16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ip::{IpProtocol, Ipv4Header};
    use core::net::Ipv4Addr;

    #[test]
    fn test_echo_reply_roundtrip() {
        let request = IcmpPacket::echo_request(0x1234, 7, b"hello");
        let bytes = request.to_bytes();
        assert_eq!(checksum(&bytes), 0);

        let parsed = IcmpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.icmp_type, IcmpType::EchoRequest);

        let reply = IcmpPacket::echo_reply(&parsed);
        assert_eq!(reply.icmp_type, IcmpType::EchoReply);
        assert_eq!(reply.rest_of_header, 0x1234_0007);
        assert_eq!(reply.payload, b"hello");
    }

    #[test]
    fn test_parse_rejects_bad_checksum() {
        let mut bytes = IcmpPacket::echo_request(1, 1, b"x").to_bytes();
        bytes[8] ^= 0xFF;
        assert!(IcmpPacket::parse(&bytes).is_err());
    }

    #[test]
    fn test_unreachable_quotes_ports() {
        let udp = [0x13, 0x88, 0x00, 0x35, 0, 12, 0, 0, 1, 2, 3, 4];
        let original = Ipv4Header::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            IpProtocol::UDP,
            udp.len(),
        )
        .to_packet(&udp);

        let msg = IcmpPacket::unreachable(CODE_PORT_UNREACHABLE, &original);
        assert_eq!(msg.payload.len(), 28);
        assert_eq!(msg.quoted_ports(), Some((17, 5000, 53)));
        assert_eq!(msg.quoted_destination(), Some(Ipv4Addr::new(10, 0, 0, 2)));
    }
}
