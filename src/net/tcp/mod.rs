//! TCP (Transmission Control Protocol)
//!
//! Implements connection-oriented, reliable transport with:
//! - Per-connection state machine ([`pcb::Pcb`], RFC 793)
//! - Retransmission with RTT-based RTO (Jacobson/Karels, RFC 6298)
//! - Congestion control behind the [`CongestionControl`] trait (RFC 5681)

pub mod congestion;
pub mod pcb;
pub mod retransmit;

pub use congestion::{Aimd, CongestionControl, Reno};
pub use pcb::Pcb;
pub use retransmit::RetransmitQueue;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::net::{be16, be32, pseudo_checksum};

const PROTOCOL: u8 = 6;

/// Header length without options
pub const HEADER_LEN: usize = 20;

/// MSS assumed when the peer sends no MSS option (RFC 1122)
pub const DEFAULT_MSS: u16 = 536;

// ═══════════════════════════════════════════════════════════════════════════════
// TCP FLAGS
// ═══════════════════════════════════════════════════════════════════════════════

/// TCP Flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(u16);

impl TcpFlags {
    pub const FIN: u16 = 1 << 0;
    pub const SYN: u16 = 1 << 1;
    pub const RST: u16 = 1 << 2;
    pub const PSH: u16 = 1 << 3;
    pub const ACK: u16 = 1 << 4;
    pub const URG: u16 = 1 << 5;

    pub fn new(val: u16) -> Self {
        Self(val)
    }

    pub fn contains(&self, flag: u16) -> bool {
        (self.0 & flag) != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TCP STATE MACHINE
// ═══════════════════════════════════════════════════════════════════════════════

/// TCP State Machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// Data may still be queued for sending
    pub fn can_send(&self) -> bool {
        matches!(self, TcpState::Established | TcpState::CloseWait)
    }

    /// Handshake finished (possibly closing since)
    pub fn is_synchronized(&self) -> bool {
        !matches!(self, TcpState::Closed | TcpState::Listen | TcpState::SynSent | TcpState::SynReceived)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONGESTION ALGORITHM SELECTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Congestion controller installed on new connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionAlgorithm {
    /// Slow start, congestion avoidance, fast recovery (RFC 5681)
    #[default]
    Reno,
    /// Additive increase, multiplicative decrease without slow start
    Aimd,
}

impl CongestionAlgorithm {
    pub fn build(self, mss: u32) -> Box<dyn CongestionControl> {
        match self {
            CongestionAlgorithm::Reno => Box::new(Reno::new(mss)),
            CongestionAlgorithm::Aimd => Box::new(Aimd::new(mss)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TCP SEGMENT
// ═══════════════════════════════════════════════════════════════════════════════

/// TCP Segment
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub sequence_num: u32,
    pub ack_num: u32,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub urgent_pointer: u16,
    /// Maximum segment size option (SYN segments only)
    pub mss: Option<u16>,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Malformed("packet too short for TCP header"));
        }

        let header_len = (data[12] >> 4) as usize * 4;
        if header_len < HEADER_LEN || data.len() < header_len {
            return Err(Error::Malformed("packet shorter than TCP header length"));
        }

        Ok(Self {
            src_port: be16(data, 0),
            dst_port: be16(data, 2),
            sequence_num: be32(data, 4),
            ack_num: be32(data, 8),
            flags: TcpFlags::new(be16(data, 12) & 0x01FF),
            window_size: be16(data, 14),
            urgent_pointer: be16(data, 18),
            mss: parse_mss(&data[HEADER_LEN..header_len]),
            payload: data[header_len..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let options_len = if self.mss.is_some() { 4 } else { 0 };
        let header_len = HEADER_LEN + options_len;
        let data_offset = (header_len / 4) as u8;

        let mut bytes = Vec::with_capacity(header_len + self.payload.len());
        bytes.extend_from_slice(&self.src_port.to_be_bytes());
        bytes.extend_from_slice(&self.dst_port.to_be_bytes());
        bytes.extend_from_slice(&self.sequence_num.to_be_bytes());
        bytes.extend_from_slice(&self.ack_num.to_be_bytes());

        let offset_res = (data_offset << 4) | ((self.flags.bits() >> 8) as u8);
        bytes.push(offset_res);
        bytes.push(self.flags.bits() as u8);

        bytes.extend_from_slice(&self.window_size.to_be_bytes());
        bytes.extend_from_slice(&[0, 0]); // checksum
        bytes.extend_from_slice(&self.urgent_pointer.to_be_bytes());

        if let Some(mss) = self.mss {
            bytes.extend_from_slice(&[2, 4]);
            bytes.extend_from_slice(&mss.to_be_bytes());
        }

        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Serialize segment with computed checksum
    pub fn to_bytes_with_checksum(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> Vec<u8> {
        let mut bytes = self.to_bytes();
        let checksum = tcp_checksum(src_ip, dst_ip, &bytes);
        bytes[16..18].copy_from_slice(&checksum.to_be_bytes());
        bytes
    }

    /// Sequence space consumed: payload plus one each for SYN and FIN
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.flags.contains(TcpFlags::SYN) {
            len += 1;
        }
        if self.flags.contains(TcpFlags::FIN) {
            len += 1;
        }
        len
    }
}

/// Find the MSS option (kind 2) in a TCP option list
fn parse_mss(mut options: &[u8]) -> Option<u16> {
    while let Some(&kind) = options.first() {
        match kind {
            0 => return None,
            1 => options = &options[1..],
            _ => {
                let len = *options.get(1)? as usize;
                if len < 2 || len > options.len() {
                    return None;
                }
                if kind == 2 && len == 4 {
                    return Some(be16(options, 2));
                }
                options = &options[len..];
            }
        }
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════════
// TCP CHECKSUM (RFC 793)
// ═══════════════════════════════════════════════════════════════════════════════

/// Compute TCP checksum over the pseudo-header and a segment whose checksum
/// field is zero
pub fn tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, tcp_segment: &[u8]) -> u16 {
    pseudo_checksum(src_ip, dst_ip, PROTOCOL, tcp_segment)
}

/// Verify TCP checksum
pub fn verify_tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, tcp_segment: &[u8]) -> bool {
    // Summing a segment that carries its checksum yields zero
    pseudo_checksum(src_ip, dst_ip, PROTOCOL, tcp_segment) == 0
}

// ═══════════════════════════════════════════════════════════════════════════════
// SEQUENCE NUMBER ARITHMETIC
// ═══════════════════════════════════════════════════════════════════════════════

/// Check if sequence number a is after b (handling wraparound)
#[inline]
pub fn seq_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// a >= b in sequence space
#[inline]
pub fn seq_after_eq(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}
