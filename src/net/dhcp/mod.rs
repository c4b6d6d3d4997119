//! DHCP (Dynamic Host Configuration Protocol)
//!
//! BOOTP message layout with the RFC 2132 options this engine understands.
//! The client ([`DhcpClient`]) acquires and renews the interface address;
//! the optional server ([`DhcpServer`]) hands out addresses from a pool.

pub mod client;
pub mod server;

pub use client::{ClientAction, ClientState, DhcpClient, Lease};
pub use server::DhcpServer;

use alloc::vec::Vec;
use core::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::net::ethernet::MacAddress;
use crate::net::{be16, be32, ipv4_at};

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

const MAGIC_COOKIE: u32 = 0x6382_5363;

/// Fixed BOOTP header plus the magic cookie
const HEADER_LEN: usize = 240;

/// BOOTP messages are padded to at least this length
const MIN_MESSAGE_LEN: usize = 300;

const OP_REQUEST: u8 = 1;
const OP_REPLY: u8 = 2;

/// Reply must be broadcast (client has no address yet)
pub const FLAG_BROADCAST: u16 = 0x8000;

// ═══════════════════════════════════════════════════════════════════════════════
// OPTIONS
// ═══════════════════════════════════════════════════════════════════════════════

const OPT_PAD: u8 = 0;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_PARAMETER_LIST: u8 = 55;
const OPT_RENEWAL_TIME: u8 = 58;
const OPT_REBINDING_TIME: u8 = 59;
const OPT_END: u8 = 255;

/// DHCP message type (option 53)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
}

impl MessageType {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => MessageType::Discover,
            2 => MessageType::Offer,
            3 => MessageType::Request,
            4 => MessageType::Decline,
            5 => MessageType::Ack,
            6 => MessageType::Nak,
            7 => MessageType::Release,
            8 => MessageType::Inform,
            _ => return None,
        })
    }

    fn to_u8(self) -> u8 {
        match self {
            MessageType::Discover => 1,
            MessageType::Offer => 2,
            MessageType::Request => 3,
            MessageType::Decline => 4,
            MessageType::Ack => 5,
            MessageType::Nak => 6,
            MessageType::Release => 7,
            MessageType::Inform => 8,
        }
    }

    /// Sent by clients (BOOTREQUEST) rather than servers
    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageType::Discover
                | MessageType::Request
                | MessageType::Decline
                | MessageType::Release
                | MessageType::Inform
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MESSAGE
// ═══════════════════════════════════════════════════════════════════════════════

/// Decoded DHCP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpMessage {
    pub message_type: MessageType,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    /// Client's current address (renewal, release)
    pub ciaddr: Ipv4Addr,
    /// Address offered or assigned to the client
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: MacAddress,
    pub subnet_mask: Option<Ipv4Addr>,
    pub router: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    pub requested_ip: Option<Ipv4Addr>,
    pub server_id: Option<Ipv4Addr>,
    /// Seconds
    pub lease_time: Option<u32>,
    /// T1, seconds
    pub renewal_time: Option<u32>,
    /// T2, seconds
    pub rebinding_time: Option<u32>,
}

impl DhcpMessage {
    /// Message with every address zero and no options
    pub fn new(message_type: MessageType, xid: u32, chaddr: MacAddress) -> Self {
        Self {
            message_type,
            xid,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            subnet_mask: None,
            router: None,
            dns: None,
            requested_ip: None,
            server_id: None,
            lease_time: None,
            renewal_time: None,
            rebinding_time: None,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Malformed("DHCP message too short"));
        }
        let op = data[0];
        if op != OP_REQUEST && op != OP_REPLY {
            return Err(Error::Malformed("DHCP bad op"));
        }
        // Ethernet hardware, 6-byte addresses
        if data[1] != 1 || data[2] != 6 {
            return Err(Error::Malformed("DHCP unsupported hardware type"));
        }
        if be32(data, 236) != MAGIC_COOKIE {
            return Err(Error::Malformed("DHCP missing magic cookie"));
        }

        let mut chaddr = [0u8; 6];
        chaddr.copy_from_slice(&data[28..34]);

        let mut msg = Self::new(MessageType::Discover, be32(data, 4), MacAddress(chaddr));
        msg.secs = be16(data, 8);
        msg.flags = be16(data, 10);
        msg.ciaddr = ipv4_at(data, 12);
        msg.yiaddr = ipv4_at(data, 16);
        msg.siaddr = ipv4_at(data, 20);
        msg.giaddr = ipv4_at(data, 24);

        let mut message_type = None;
        let mut i = HEADER_LEN;
        while i < data.len() {
            let code = data[i];
            if code == OPT_END {
                break;
            }
            if code == OPT_PAD {
                i += 1;
                continue;
            }
            if i + 1 >= data.len() {
                return Err(Error::Malformed("DHCP truncated option"));
            }
            let len = data[i + 1] as usize;
            let start = i + 2;
            let end = start + len;
            if end > data.len() {
                return Err(Error::Malformed("DHCP truncated option"));
            }
            let value = &data[start..end];

            match (code, len) {
                (OPT_MESSAGE_TYPE, 1) => message_type = MessageType::from_u8(value[0]),
                (OPT_SUBNET_MASK, 4) => msg.subnet_mask = Some(ipv4_at(value, 0)),
                // First entry of a list
                (OPT_ROUTER, n) if n >= 4 => msg.router = Some(ipv4_at(value, 0)),
                (OPT_DNS, n) if n >= 4 => msg.dns = Some(ipv4_at(value, 0)),
                (OPT_REQUESTED_IP, 4) => msg.requested_ip = Some(ipv4_at(value, 0)),
                (OPT_SERVER_ID, 4) => msg.server_id = Some(ipv4_at(value, 0)),
                (OPT_LEASE_TIME, 4) => msg.lease_time = Some(be32(value, 0)),
                (OPT_RENEWAL_TIME, 4) => msg.renewal_time = Some(be32(value, 0)),
                (OPT_REBINDING_TIME, 4) => msg.rebinding_time = Some(be32(value, 0)),
                _ => {}
            }
            i = end;
        }

        msg.message_type = message_type.ok_or(Error::Malformed("DHCP message type missing"))?;
        if msg.message_type.is_request() != (op == OP_REQUEST) {
            return Err(Error::Malformed("DHCP op does not match message type"));
        }
        Ok(msg)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_MESSAGE_LEN + 32);
        out.push(if self.message_type.is_request() { OP_REQUEST } else { OP_REPLY });
        out.push(1); // htype: Ethernet
        out.push(6); // hlen
        out.push(0); // hops
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&self.secs.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&self.ciaddr.octets());
        out.extend_from_slice(&self.yiaddr.octets());
        out.extend_from_slice(&self.siaddr.octets());
        out.extend_from_slice(&self.giaddr.octets());
        out.extend_from_slice(&self.chaddr.0);
        // chaddr padding, sname, file
        out.resize(236, 0);
        out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());

        out.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, self.message_type.to_u8()]);
        let addr_options = [
            (OPT_SUBNET_MASK, self.subnet_mask),
            (OPT_ROUTER, self.router),
            (OPT_DNS, self.dns),
            (OPT_REQUESTED_IP, self.requested_ip),
            (OPT_SERVER_ID, self.server_id),
        ];
        for (code, value) in addr_options {
            if let Some(ip) = value {
                out.extend_from_slice(&[code, 4]);
                out.extend_from_slice(&ip.octets());
            }
        }
        let time_options = [
            (OPT_LEASE_TIME, self.lease_time),
            (OPT_RENEWAL_TIME, self.renewal_time),
            (OPT_REBINDING_TIME, self.rebinding_time),
        ];
        for (code, value) in time_options {
            if let Some(secs) = value {
                out.extend_from_slice(&[code, 4]);
                out.extend_from_slice(&secs.to_be_bytes());
            }
        }
        if matches!(self.message_type, MessageType::Discover | MessageType::Request) {
            out.extend_from_slice(&[OPT_PARAMETER_LIST, 3, OPT_SUBNET_MASK, OPT_ROUTER, OPT_DNS]);
        }
        out.push(OPT_END);

        if out.len() < MIN_MESSAGE_LEN {
            out.resize(MIN_MESSAGE_LEN, 0);
        }
        out
    }
}

/// Message ready for the wire, with explicit link-layer addressing
///
/// DHCP runs before (or independently of) ARP, so the sender names the
/// destination MAC itself: broadcast while unconfigured, the learned server
/// MAC for renewals, the client's hardware address for unicast replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub message: DhcpMessage,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub dst_mac: MacAddress,
    pub src_port: u16,
    pub dst_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> MacAddress {
        MacAddress([0x02, 0, 0, 0, 0, 0x11])
    }

    #[test]
    fn test_discover_layout() {
        let msg = DhcpMessage::new(MessageType::Discover, 0xDEAD_BEEF, mac());
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), MIN_MESSAGE_LEN);
        assert_eq!(bytes[0], OP_REQUEST);
        assert_eq!(&bytes[4..8], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(&bytes[28..34], &mac().0);
        assert_eq!(&bytes[236..240], &[0x63, 0x82, 0x53, 0x63]);
        assert_eq!(&bytes[240..243], &[OPT_MESSAGE_TYPE, 1, 1]);
    }

    #[test]
    fn test_offer_options_parse() {
        let mut offer = DhcpMessage::new(MessageType::Offer, 7, mac());
        offer.yiaddr = Ipv4Addr::new(192, 168, 1, 100);
        offer.subnet_mask = Some(Ipv4Addr::new(255, 255, 255, 0));
        offer.router = Some(Ipv4Addr::new(192, 168, 1, 1));
        offer.server_id = Some(Ipv4Addr::new(192, 168, 1, 1));
        offer.lease_time = Some(3600);

        let parsed = DhcpMessage::parse(&offer.to_bytes()).unwrap();
        assert_eq!(parsed, offer);
    }

    #[test]
    fn test_parse_rejects_missing_cookie() {
        let mut bytes = DhcpMessage::new(MessageType::Discover, 1, mac()).to_bytes();
        bytes[236] = 0;
        assert!(DhcpMessage::parse(&bytes).is_err());
    }

    #[test]
    fn test_parse_rejects_truncated_option() {
        let mut bytes = DhcpMessage::new(MessageType::Discover, 1, mac()).to_bytes();
        bytes.truncate(243);
        // Lease time option claiming 4 bytes with only 1 present
        bytes.extend_from_slice(&[OPT_LEASE_TIME, 4, 0]);
        assert!(DhcpMessage::parse(&bytes).is_err());
    }

    #[test]
    fn test_parse_requires_message_type() {
        let mut bytes = DhcpMessage::new(MessageType::Discover, 1, mac()).to_bytes();
        bytes[240] = OPT_PAD;
        bytes[241] = OPT_PAD;
        bytes[242] = OPT_PAD;
        assert!(DhcpMessage::parse(&bytes).is_err());
    }
}
