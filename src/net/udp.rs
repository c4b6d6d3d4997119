//! UDP (User Datagram Protocol)
//!
//! Connectionless transport layer protocol (RFC 768).

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{Error, Result};
use crate::net::{be16, pseudo_checksum};

pub const HEADER_LEN: usize = 8;

const PROTOCOL: u8 = 17;

/// Parsed UDP datagram borrowing its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

impl<'a> UdpDatagram<'a> {
    /// Validate length and, when present, the checksum
    pub fn parse(data: &'a [u8], src: Ipv4Addr, dst: Ipv4Addr) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Malformed("UDP packet too short"));
        }

        let length = be16(data, 4) as usize;
        if length < HEADER_LEN || length > data.len() {
            return Err(Error::Malformed("UDP length mismatch"));
        }

        // Zero means the sender did not compute one
        if be16(data, 6) != 0 && pseudo_checksum(src, dst, PROTOCOL, &data[..length]) != 0 {
            return Err(Error::Malformed("UDP checksum mismatch"));
        }

        Ok(Self {
            src_port: be16(data, 0),
            dst_port: be16(data, 2),
            payload: &data[HEADER_LEN..length],
        })
    }
}

/// Build a UDP datagram with its checksum
pub fn build(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let total_len = HEADER_LEN + payload.len();
    let mut packet = Vec::with_capacity(total_len);
    packet.extend_from_slice(&src.port().to_be_bytes());
    packet.extend_from_slice(&dst.port().to_be_bytes());
    packet.extend_from_slice(&(total_len as u16).to_be_bytes());
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(payload);

    let mut sum = pseudo_checksum(*src.ip(), *dst.ip(), PROTOCOL, &packet);
    if sum == 0 {
        // Transmitted as all ones; zero means "no checksum"
        sum = 0xFFFF;
    }
    packet[6..8].copy_from_slice(&sum.to_be_bytes());
    packet
}

// ═══════════════════════════════════════════════════════════════════════════════
// UDP SOCKET
// ═══════════════════════════════════════════════════════════════════════════════

/// Bound UDP endpoint with a bounded receive queue
#[derive(Debug)]
pub struct UdpSocket {
    pub local_port: u16,
    /// Fixed peer; only its datagrams match this socket exactly
    pub remote: Option<SocketAddrV4>,
    /// Peer of the most recent datagram (reply target for wildcard sockets)
    pub last_sender: Option<SocketAddrV4>,
    queue: VecDeque<(SocketAddrV4, Vec<u8>)>,
    queue_len: usize,
}

impl UdpSocket {
    pub fn new(local_port: u16, queue_len: usize) -> Self {
        Self {
            local_port,
            remote: None,
            last_sender: None,
            queue: VecDeque::new(),
            queue_len: queue_len.max(1),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.remote.is_none()
    }

    /// Exact match on (port, remote)
    pub fn matches(&self, port: u16, from: SocketAddrV4) -> bool {
        self.local_port == port && self.remote == Some(from)
    }

    /// Queue a datagram; false when the queue is full and it was dropped
    pub fn deliver(&mut self, from: SocketAddrV4, payload: &[u8]) -> bool {
        if self.queue.len() >= self.queue_len {
            return false;
        }
        self.last_sender = Some(from);
        self.queue.push_back((from, payload.to_vec()));
        true
    }

    pub fn recv(&mut self) -> Option<(SocketAddrV4, Vec<u8>)> {
        self.queue.pop_front()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> (SocketAddrV4, SocketAddrV4) {
        (
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 5000),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 53),
        )
    }

    #[test]
    fn test_build_and_parse() {
        let (src, dst) = addrs();
        let packet = build(src, dst, b"query");
        assert_eq!(packet.len(), 13);

        let dgram = UdpDatagram::parse(&packet, *src.ip(), *dst.ip()).unwrap();
        assert_eq!(dgram.src_port, 5000);
        assert_eq!(dgram.dst_port, 53);
        assert_eq!(dgram.payload, b"query");
    }

    #[test]
    fn test_parse_rejects_corruption() {
        let (src, dst) = addrs();
        let mut packet = build(src, dst, b"query");
        packet[9] ^= 1;
        assert!(UdpDatagram::parse(&packet, *src.ip(), *dst.ip()).is_err());

        // Same bytes are accepted once the checksum is marked absent
        packet[6] = 0;
        packet[7] = 0;
        assert!(UdpDatagram::parse(&packet, *src.ip(), *dst.ip()).is_ok());
    }

    #[test]
    fn test_parse_rejects_bad_length() {
        let (src, dst) = addrs();
        let mut packet = build(src, dst, b"x");
        packet[5] = 40;
        assert!(UdpDatagram::parse(&packet, *src.ip(), *dst.ip()).is_err());
    }

    #[test]
    fn test_socket_queue_is_bounded() {
        let (src, _) = addrs();
        let mut sock = UdpSocket::new(53, 2);
        assert!(sock.deliver(src, b"a"));
        assert!(sock.deliver(src, b"b"));
        assert!(!sock.deliver(src, b"c"));
        assert_eq!(sock.recv().map(|(_, d)| d), Some(b"a".to_vec()));
        assert_eq!(sock.last_sender, Some(src));
    }
}
