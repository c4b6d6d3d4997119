//! Stack counters

/// Packet counters kept by the stack
///
/// Malformed and unwanted traffic is never reported to connections; it only
/// shows up here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub frames_received: u64,
    pub frames_sent: u64,
    /// Frames not addressed to us or with an unknown EtherType
    pub frames_ignored: u64,
    pub transmit_errors: u64,
    pub arp_requests_sent: u64,
    pub arp_replies_sent: u64,
    /// Packets dropped after ARP gave up, or replaced while waiting
    pub arp_drops: u64,
    pub ip_malformed: u64,
    pub ip_fragments_received: u64,
    pub ip_reassembled: u64,
    pub ip_reassembly_timeouts: u64,
    pub ip_fragments_sent: u64,
    pub icmp_echo_replies: u64,
    pub icmp_unreachable_sent: u64,
    pub udp_malformed: u64,
    pub udp_no_port: u64,
    /// Datagrams dropped because a socket queue was full
    pub udp_queue_drops: u64,
    pub tcp_malformed: u64,
    pub tcp_resets_sent: u64,
    pub tcp_retransmits: u64,
    pub tcp_out_of_order: u64,
    pub dhcp_malformed: u64,
}
