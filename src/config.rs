//! Engine configuration
//!
//! Everything is supplied at construction time. There is no runtime
//! reconfiguration API; DHCP is the only thing that changes an interface
//! address after start-up.

use core::net::Ipv4Addr;

use crate::buffer::DEFAULT_MAX_CAPACITY;
use crate::net::ethernet::MacAddress;
use crate::net::tcp::CongestionAlgorithm;

// ═══════════════════════════════════════════════════════════════════════════════
// MANAGER CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Manager-wide limits
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Ceiling of every connection's receive buffer
    pub recv_max: usize,
    /// Ceiling of every connection's send buffer
    pub send_max: usize,
    /// Live connections allowed at once (listeners included)
    pub max_connections: usize,
    /// Give up on a name lookup after this long
    pub resolve_timeout_ms: u64,
    /// Host-socket connects still pending after this long fail with `TimedOut`
    pub connect_timeout_ms: u64,
}

impl ManagerConfig {
    pub const fn new() -> Self {
        Self {
            recv_max: DEFAULT_MAX_CAPACITY,
            send_max: DEFAULT_MAX_CAPACITY,
            max_connections: 64,
            resolve_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
        }
    }

    pub const fn with_buffer_limits(mut self, recv_max: usize, send_max: usize) -> Self {
        self.recv_max = recv_max;
        self.send_max = send_max;
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// INTERFACE CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

/// How the interface obtains its IPv4 address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    Static {
        ip: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Ipv4Addr,
    },
    Dhcp,
}

/// Built-in stack interface settings
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub mac: MacAddress,
    pub addressing: Addressing,
    /// IP MTU; Ethernet frames are `mtu + 14` bytes at most
    pub mtu: usize,
    /// Frames the driver can buffer on receive, passed through to the driver
    pub receive_queue_capacity: usize,
    pub promiscuous: bool,
    /// Datagrams held per UDP socket before new ones are dropped
    pub udp_queue_len: usize,
    /// UDP sockets open at once
    pub udp_max_sockets: usize,
    /// Largest datagram accepted for fragment reassembly
    pub reassembly_max: usize,
    /// Seed for initial sequence numbers, DHCP xids and ephemeral ports
    pub seed: u32,
    pub tcp: TcpConfig,
    /// Run a DHCP server on this interface
    pub dhcp_server: Option<DhcpServerConfig>,
}

impl InterfaceConfig {
    pub const fn new(mac: MacAddress, addressing: Addressing) -> Self {
        Self {
            mac,
            addressing,
            mtu: 1500,
            receive_queue_capacity: 4,
            promiscuous: false,
            udp_queue_len: 4,
            udp_max_sockets: 16,
            reassembly_max: 8 * 1024,
            seed: 0x5eed_1234,
            tcp: TcpConfig::new(),
            dhcp_server: None,
        }
    }

    /// Static address shorthand
    pub const fn fixed(mac: MacAddress, ip: Ipv4Addr, netmask: Ipv4Addr, gateway: Ipv4Addr) -> Self {
        Self::new(mac, Addressing::Static { ip, netmask, gateway })
    }

    pub const fn dhcp(mac: MacAddress) -> Self {
        Self::new(mac, Addressing::Dhcp)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TCP CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

/// TCP tuning knobs
#[derive(Debug, Clone, Copy)]
pub struct TcpConfig {
    /// Per-PCB receive queue, also the advertised window (max 65535)
    pub recv_window: usize,
    /// Consecutive data retransmissions before the connection is dropped
    pub max_retries: u8,
    /// SYN retransmissions before a connect fails
    pub syn_retries: u8,
    pub initial_rto_ms: u64,
    pub min_rto_ms: u64,
    pub max_rto_ms: u64,
    pub time_wait_ms: u64,
    /// Idle time before keepalive probes start; 0 disables keepalive
    pub keepalive_ms: u64,
    pub keepalive_probes: u8,
    pub fast_retransmit: bool,
    /// Hold out-of-order segments instead of dropping them
    pub reorder: bool,
    pub congestion: CongestionAlgorithm,
    /// PCB arena size
    pub max_sockets: usize,
}

impl TcpConfig {
    pub const fn new() -> Self {
        Self {
            recv_window: 8 * 1024,
            max_retries: 8,
            syn_retries: 5,
            initial_rto_ms: 1_000,
            min_rto_ms: 200,
            max_rto_ms: 60_000,
            time_wait_ms: 4_000,
            keepalive_ms: 0,
            keepalive_probes: 3,
            fast_retransmit: true,
            reorder: true,
            congestion: CongestionAlgorithm::Reno,
            max_sockets: 32,
        }
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DHCP SERVER CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Address pool handed out by the built-in DHCP server
#[derive(Debug, Clone, Copy)]
pub struct DhcpServerConfig {
    pub pool_start: Ipv4Addr,
    /// Number of consecutive addresses in the pool (at most 16 leases are tracked)
    pub pool_size: u8,
    pub lease_time_s: u32,
    pub netmask: Ipv4Addr,
    pub router: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
}

impl DhcpServerConfig {
    pub const fn new(pool_start: Ipv4Addr, pool_size: u8) -> Self {
        Self {
            pool_start,
            pool_size,
            lease_time_s: 3600,
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            router: None,
            dns: None,
        }
    }
}
