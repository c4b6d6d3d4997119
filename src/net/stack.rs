//! Stack Engine
//!
//! Owns the interface: driver, addressing, ARP tables, reassembly slots, the
//! TCP and UDP socket arenas and the DHCP state. Frames come in through
//! [`Stack::receive_one`], time through [`Stack::tick`]; sockets are driven
//! by [`SocketHandle`] from the manager.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::net::{Ipv4Addr, SocketAddrV4};

use log::{debug, info, trace, warn};

use crate::buffer::Buffer;
use crate::config::{Addressing, InterfaceConfig};
use crate::error::{Error, Result};
use crate::net::arp::{ArpCache, ArpOp, ArpPacket, ArpPending, ParkedPacket, PendingAction};
use crate::net::dhcp::{ClientAction, ClientState, DhcpClient, DhcpMessage, DhcpServer, Outgoing};
use crate::net::dhcp::{CLIENT_PORT, SERVER_PORT};
use crate::net::driver::Driver;
use crate::net::ethernet::{self, EtherType, EthernetFrame, MacAddress};
use crate::net::icmp::{self, IcmpPacket, IcmpType};
use crate::net::ip::{self, IpProtocol, Ipv4Header};
use crate::net::ipv4::{fragment, NextHop, Reassembler, Reassembly, Route};
use crate::net::stats::Stats;
use crate::net::tcp::{seq_after, verify_tcp_checksum, Pcb, TcpFlags, TcpSegment, TcpState};
use crate::net::udp::{self, UdpDatagram, UdpSocket};
use crate::net::Rng;

const EPHEMERAL_START: u16 = 49152;
const EPHEMERAL_COUNT: u32 = 16384;

/// Index of a socket in one of the stack's arenas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketHandle(pub(crate) usize);

impl SocketHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// The TCP/IP stack bound to one driver
pub struct Stack {
    config: InterfaceConfig,
    driver: Box<dyn Driver>,
    mac: MacAddress,
    route: Route,
    dns: Option<Ipv4Addr>,
    arp_cache: ArpCache,
    arp_pending: ArpPending,
    reassembler: Reassembler,
    tcp: Vec<Option<Pcb>>,
    udp: Vec<Option<UdpSocket>>,
    dhcp_client: Option<DhcpClient>,
    dhcp_server: Option<DhcpServer>,
    rng: Rng,
    ip_ident: u16,
    next_port: u16,
    stats: Stats,
    /// Receive scratch, one maximum-size frame
    frame: Vec<u8>,
}

impl Stack {
    /// Bring up the interface: configure the driver, then either announce a
    /// static address or start DHCP discovery.
    pub fn new(driver: impl Driver + 'static, config: InterfaceConfig, now: u64) -> Self {
        let mut driver: Box<dyn Driver> = Box::new(driver);
        let mac = match driver.mac_address() {
            Some(hw) if config.mac == MacAddress::ZERO => hw,
            _ => config.mac,
        };
        driver.set_promiscuous(config.promiscuous);
        driver.set_filter(&[mac]);
        driver.set_receive_queue_capacity(config.receive_queue_capacity);

        let mut rng = Rng::new(config.seed);
        let next_port = EPHEMERAL_START + (rng.next_u32() % EPHEMERAL_COUNT) as u16;
        let frame = vec![0u8; config.mtu + ethernet::HEADER_LEN];

        let mut stack = Self {
            reassembler: Reassembler::new(config.reassembly_max),
            config,
            driver,
            mac,
            route: Route::UNCONFIGURED,
            dns: None,
            arp_cache: ArpCache::new(),
            arp_pending: ArpPending::new(),
            tcp: Vec::new(),
            udp: Vec::new(),
            dhcp_client: None,
            dhcp_server: None,
            rng,
            ip_ident: 1,
            next_port,
            stats: Stats::default(),
            frame,
        };

        match stack.config.addressing {
            Addressing::Static { ip, netmask, gateway } => {
                stack.configure(Route { ip, netmask, gateway }, None);
            }
            Addressing::Dhcp => {
                let mut client = DhcpClient::new(mac, stack.rng.next_u32());
                let actions = client.start(now);
                stack.dhcp_client = Some(client);
                stack.apply_dhcp(actions, now);
            }
        }

        if let Some(server_config) = stack.config.dhcp_server {
            if stack.route.ip.is_unspecified() {
                warn!("[DHCP] server needs a static address; not started");
            } else {
                stack.dhcp_server = Some(DhcpServer::new(server_config, stack.route.ip));
            }
        }

        stack
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // ACCESSORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Interface address, once configured
    pub fn ip(&self) -> Option<Ipv4Addr> {
        if self.route.ip.is_unspecified() {
            None
        } else {
            Some(self.route.ip)
        }
    }

    pub fn route(&self) -> Route {
        self.route
    }

    pub fn dns(&self) -> Option<Ipv4Addr> {
        self.dns
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn link_up(&self) -> bool {
        self.driver.link_up()
    }

    pub fn dhcp_state(&self) -> Option<ClientState> {
        self.dhcp_client.as_ref().map(|c| c.state())
    }

    pub fn dhcp_server(&self) -> Option<&DhcpServer> {
        self.dhcp_server.as_ref()
    }

    pub fn arp_lookup(&self, ip: Ipv4Addr, now: u64) -> Option<MacAddress> {
        self.arp_cache.lookup(ip, now)
    }

    fn our_mss(&self) -> u16 {
        (self.config.mtu - ip::HEADER_LEN - crate::net::tcp::HEADER_LEN).min(u16::MAX as usize) as u16
    }

    fn configure(&mut self, route: Route, dns: Option<Ipv4Addr>) {
        info!("[NET] {} configured: {}/{} via {}", self.mac, route.ip, route.netmask, route.gateway);
        self.route = route;
        self.dns = dns;
        let announce = ArpPacket::gratuitous(self.mac, route.ip);
        let _ = self.transmit(MacAddress::BROADCAST, EtherType::ARP, &announce.to_bytes());
    }

    fn deconfigure(&mut self) {
        info!("[NET] {} address {} released", self.mac, self.route.ip);
        self.route = Route::UNCONFIGURED;
        self.dns = None;
        for pcb in self.tcp.iter_mut().flatten() {
            if pcb.state != TcpState::Listen {
                pcb.fail(Error::HostUnreachable);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // OUTPUT
    // ═══════════════════════════════════════════════════════════════════════════

    fn transmit(&mut self, dst: MacAddress, ethertype: EtherType, payload: &[u8]) -> Result<()> {
        let frame = EthernetFrame::build(dst, self.mac, ethertype, payload);
        match self.driver.transmit(&frame) {
            Ok(_) => {
                self.stats.frames_sent += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.transmit_errors += 1;
                trace!("[NET] transmit failed: {}", e);
                Err(e)
            }
        }
    }

    fn send_arp_request(&mut self, target: Ipv4Addr) {
        let request = ArpPacket::request(self.mac, self.route.ip, target);
        if self.transmit(MacAddress::BROADCAST, EtherType::ARP, &request.to_bytes()).is_ok() {
            self.stats.arp_requests_sent += 1;
        }
    }

    fn next_ident(&mut self) -> u16 {
        let id = self.ip_ident;
        self.ip_ident = self.ip_ident.wrapping_add(1);
        id
    }

    /// Route, fragment and transmit one datagram from our address
    fn send_ip(&mut self, dst: Ipv4Addr, protocol: IpProtocol, payload: &[u8], now: u64) -> Result<()> {
        if self.route.ip.is_unspecified() {
            return Err(Error::HostUnreachable);
        }
        let hop = self.route.next_hop(dst).ok_or(Error::HostUnreachable)?;

        let mut header = Ipv4Header::new(self.route.ip, dst, protocol, payload.len());
        header.identification = self.next_ident();
        let packets = fragment(&header, payload, self.config.mtu);
        if packets.len() > 1 {
            self.stats.ip_fragments_sent += packets.len() as u64;
        }

        let next = match hop {
            NextHop::Broadcast => MacAddress::BROADCAST,
            NextHop::Host(ip) => match self.arp_cache.lookup(ip, now) {
                Some(mac) => mac,
                None => {
                    match self.arp_pending.park(ip, ParkedPacket { packets }, now) {
                        Ok(true) => self.send_arp_request(ip),
                        // Replaced the packet already waiting
                        Ok(false) => self.stats.arp_drops += 1,
                        Err(e) => {
                            self.stats.arp_drops += 1;
                            return Err(e);
                        }
                    }
                    return Ok(());
                }
            },
        };

        for packet in packets {
            self.transmit(next, EtherType::IPv4, &packet)?;
        }
        Ok(())
    }

    fn send_dhcp(&mut self, out: Outgoing) {
        let src = SocketAddrV4::new(out.src, out.src_port);
        let dst = SocketAddrV4::new(out.dst, out.dst_port);
        let datagram = udp::build(src, dst, &out.message.to_bytes());
        let mut header = Ipv4Header::new(out.src, out.dst, IpProtocol::UDP, datagram.len());
        header.identification = self.next_ident();
        trace!("[DHCP] {:?} -> {}", out.message.message_type, out.dst);
        let _ = self.transmit(out.dst_mac, EtherType::IPv4, &header.to_packet(&datagram));
    }

    /// `original` is the offending datagram as received; the quote is its
    /// header, options included, plus the first 8 payload bytes
    fn send_icmp_unreachable(&mut self, code: u8, header: &Ipv4Header, original: &[u8], now: u64) {
        let quote = &original[..(header.header_len() + 8).min(original.len())];
        let msg = IcmpPacket::unreachable(code, quote);
        if self.send_ip(header.src, IpProtocol::ICMP, &msg.to_bytes(), now).is_ok() {
            self.stats.icmp_unreachable_sent += 1;
        }
    }

    fn send_tcp(&mut self, remote: SocketAddrV4, segments: Vec<TcpSegment>, now: u64) {
        for seg in segments {
            if seg.flags.contains(TcpFlags::RST) {
                self.stats.tcp_resets_sent += 1;
            }
            let bytes = seg.to_bytes_with_checksum(self.route.ip, *remote.ip());
            if let Err(e) = self.send_ip(*remote.ip(), IpProtocol::TCP, &bytes, now) {
                trace!("[TCP] segment to {} not sent: {}", remote, e);
            }
        }
    }

    /// Let one PCB emit whatever it has queued
    fn flush_pcb(&mut self, handle: SocketHandle, now: u64) {
        let mut out = Vec::new();
        let Some(Some(pcb)) = self.tcp.get_mut(handle.0) else {
            return;
        };
        pcb.poll_output(now, &mut out);
        let remote = pcb.remote;
        self.stats.tcp_retransmits += pcb.take_retransmissions() as u64;
        self.send_tcp(remote, out, now);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // INPUT
    // ═══════════════════════════════════════════════════════════════════════════

    /// Pull at most one frame from the driver and process it.
    /// Returns false when the driver had nothing.
    pub fn receive_one(&mut self, now: u64) -> bool {
        let mut frame = core::mem::take(&mut self.frame);
        let len = self.driver.receive(&mut frame);
        if len > 0 {
            self.stats.frames_received += 1;
            self.process_frame(&frame[..len.min(frame.len())], now);
        }
        self.frame = frame;
        len > 0
    }

    fn process_frame(&mut self, data: &[u8], now: u64) {
        let frame = match EthernetFrame::parse(data) {
            Ok(frame) => frame,
            Err(_) => {
                self.stats.frames_ignored += 1;
                return;
            }
        };

        if !self.config.promiscuous && frame.dst != self.mac && !frame.dst.is_broadcast() {
            self.stats.frames_ignored += 1;
            return;
        }

        match frame.ethertype {
            EtherType::ARP => self.handle_arp(frame.payload, now),
            EtherType::IPv4 => self.handle_ipv4(frame.src, frame.payload, now),
            _ => self.stats.frames_ignored += 1,
        }
    }

    fn handle_arp(&mut self, data: &[u8], now: u64) {
        let packet = match ArpPacket::parse(data) {
            Ok(packet) => packet,
            Err(_) => {
                self.stats.frames_ignored += 1;
                return;
            }
        };

        if !packet.sender_ip.is_unspecified() && packet.sender_mac != self.mac {
            self.arp_cache.insert(packet.sender_ip, packet.sender_mac, now);
            if let Some(parked) = self.arp_pending.resolve(packet.sender_ip) {
                trace!("[ARP] {} is at {}, flushing parked packet", packet.sender_ip, packet.sender_mac);
                for ip_packet in parked.packets {
                    let _ = self.transmit(packet.sender_mac, EtherType::IPv4, &ip_packet);
                }
            }
        }

        let for_us = !self.route.ip.is_unspecified() && packet.target_ip == self.route.ip;
        if packet.op == ArpOp::Request && for_us && packet.sender_ip != packet.target_ip {
            let reply = ArpPacket::reply_to(&packet, self.mac);
            if self.transmit(packet.sender_mac, EtherType::ARP, &reply.to_bytes()).is_ok() {
                self.stats.arp_replies_sent += 1;
            }
        }
    }

    fn handle_ipv4(&mut self, src_mac: MacAddress, data: &[u8], now: u64) {
        let header = match Ipv4Header::parse(data) {
            Ok(header) => header,
            Err(e) => {
                trace!("[IP] dropped: {}", e);
                self.stats.ip_malformed += 1;
                return;
            }
        };

        let configured = !self.route.ip.is_unspecified();
        let accept = (configured && header.dst == self.route.ip)
            || self.route.is_broadcast(header.dst)
            // DHCP offers may be unicast to the address being offered
            || (!configured && header.protocol == IpProtocol::UDP);
        if !accept {
            self.stats.frames_ignored += 1;
            return;
        }

        let payload = &data[header.header_len()..header.total_length as usize];
        if header.is_fragment() {
            self.stats.ip_fragments_received += 1;
            match self.reassembler.push(&header, payload, now) {
                Reassembly::Complete(whole) => {
                    self.stats.ip_reassembled += 1;
                    let mut header = header.clone();
                    header.ihl = 5;
                    header.flags &= !ip::FLAG_MF;
                    header.fragment_offset = 0;
                    header.total_length = (ip::HEADER_LEN + whole.len()).min(u16::MAX as usize) as u16;
                    // No single datagram arrived; quote the rebuilt one
                    let rebuilt = header.to_packet(&whole[..whole.len().min(8)]);
                    self.dispatch(src_mac, &header, &whole, &rebuilt, now);
                }
                Reassembly::Incomplete => {}
                Reassembly::Dropped => self.stats.ip_malformed += 1,
            }
            return;
        }

        let original = &data[..header.total_length as usize];
        self.dispatch(src_mac, &header, payload, original, now);
    }

    fn dispatch(&mut self, src_mac: MacAddress, header: &Ipv4Header, payload: &[u8], original: &[u8], now: u64) {
        match header.protocol {
            IpProtocol::ICMP => self.handle_icmp(header, payload, now),
            IpProtocol::UDP => self.handle_udp(src_mac, header, payload, original, now),
            IpProtocol::TCP => self.handle_tcp(header, payload, now),
            IpProtocol::Unknown(_) => {
                if header.dst == self.route.ip {
                    self.send_icmp_unreachable(icmp::CODE_PROTOCOL_UNREACHABLE, header, original, now);
                }
            }
        }
    }

    fn handle_icmp(&mut self, header: &Ipv4Header, payload: &[u8], now: u64) {
        let packet = match IcmpPacket::parse(payload) {
            Ok(packet) => packet,
            Err(_) => {
                self.stats.ip_malformed += 1;
                return;
            }
        };

        match packet.icmp_type {
            IcmpType::EchoRequest if header.dst == self.route.ip => {
                let reply = IcmpPacket::echo_reply(&packet);
                if self.send_ip(header.src, IpProtocol::ICMP, &reply.to_bytes(), now).is_ok() {
                    self.stats.icmp_echo_replies += 1;
                }
            }
            IcmpType::DestinationUnreachable => {
                let (Some((6, local_port, remote_port)), Some(remote_ip)) =
                    (packet.quoted_ports(), packet.quoted_destination())
                else {
                    return;
                };
                let error = if packet.code == icmp::CODE_PORT_UNREACHABLE
                    || packet.code == icmp::CODE_PROTOCOL_UNREACHABLE
                {
                    Error::ConnectionRefused
                } else {
                    Error::HostUnreachable
                };
                let remote = SocketAddrV4::new(remote_ip, remote_port);
                for pcb in self.tcp.iter_mut().flatten() {
                    if pcb.state == TcpState::SynSent && pcb.local.port() == local_port && pcb.remote == remote {
                        debug!("[TCP] {} unreachable (code {})", remote, packet.code);
                        pcb.fail(error.clone());
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_udp(&mut self, src_mac: MacAddress, header: &Ipv4Header, payload: &[u8], original: &[u8], now: u64) {
        let datagram = match UdpDatagram::parse(payload, header.src, header.dst) {
            Ok(datagram) => datagram,
            Err(_) => {
                self.stats.udp_malformed += 1;
                return;
            }
        };

        if datagram.dst_port == CLIENT_PORT && datagram.src_port == SERVER_PORT && self.dhcp_client.is_some() {
            self.handle_dhcp_reply(src_mac, datagram.payload, now);
            return;
        }
        if datagram.dst_port == SERVER_PORT && self.dhcp_server.is_some() {
            self.handle_dhcp_request(datagram.payload, now);
            return;
        }
        if self.route.ip.is_unspecified() {
            self.stats.frames_ignored += 1;
            return;
        }

        let from = SocketAddrV4::new(header.src, datagram.src_port);
        let port = datagram.dst_port;
        let target = self
            .udp
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.matches(port, from)))
            .or_else(|| {
                self.udp
                    .iter()
                    .position(|s| s.as_ref().is_some_and(|s| s.local_port == port && s.is_wildcard()))
            });

        match target.and_then(|i| self.udp[i].as_mut()) {
            Some(socket) => {
                if !socket.deliver(from, datagram.payload) {
                    self.stats.udp_queue_drops += 1;
                }
            }
            None => {
                self.stats.udp_no_port += 1;
                if header.dst == self.route.ip {
                    self.send_icmp_unreachable(icmp::CODE_PORT_UNREACHABLE, header, original, now);
                }
            }
        }
    }

    fn handle_dhcp_reply(&mut self, src_mac: MacAddress, data: &[u8], now: u64) {
        let msg = match DhcpMessage::parse(data) {
            Ok(msg) => msg,
            Err(_) => {
                self.stats.dhcp_malformed += 1;
                return;
            }
        };
        let Some(client) = self.dhcp_client.as_mut() else {
            return;
        };
        let actions = client.on_message(&msg, src_mac, now);
        self.apply_dhcp(actions, now);
    }

    fn handle_dhcp_request(&mut self, data: &[u8], now: u64) {
        let msg = match DhcpMessage::parse(data) {
            Ok(msg) => msg,
            Err(_) => {
                self.stats.dhcp_malformed += 1;
                return;
            }
        };
        if !msg.message_type.is_request() {
            return;
        }
        let reply = self.dhcp_server.as_mut().and_then(|server| server.on_message(&msg, now));
        if let Some(out) = reply {
            self.send_dhcp(out);
        }
    }

    fn apply_dhcp(&mut self, actions: Vec<ClientAction>, now: u64) {
        for action in actions {
            match action {
                ClientAction::Send(out) => self.send_dhcp(out),
                ClientAction::Configure(lease) => {
                    self.arp_cache.insert(lease.server_id, lease.server_mac, now);
                    let route = Route {
                        ip: lease.ip,
                        netmask: lease.netmask,
                        gateway: lease.router.unwrap_or(Ipv4Addr::UNSPECIFIED),
                    };
                    if route != self.route {
                        self.configure(route, lease.dns);
                    }
                }
                ClientAction::Deconfigure => self.deconfigure(),
            }
        }
    }

    fn handle_tcp(&mut self, header: &Ipv4Header, payload: &[u8], now: u64) {
        if header.dst != self.route.ip || self.route.ip.is_unspecified() {
            return;
        }
        if !verify_tcp_checksum(header.src, header.dst, payload) {
            self.stats.tcp_malformed += 1;
            return;
        }
        let seg = match TcpSegment::parse(payload) {
            Ok(seg) => seg,
            Err(_) => {
                self.stats.tcp_malformed += 1;
                return;
            }
        };

        let local = SocketAddrV4::new(header.dst, seg.dst_port);
        let remote = SocketAddrV4::new(header.src, seg.src_port);

        let connected = self.tcp.iter().position(|p| {
            p.as_ref().is_some_and(|p| {
                !matches!(p.state, TcpState::Listen | TcpState::Closed)
                    && p.local.port() == local.port()
                    && p.remote == remote
            })
        });

        if let Some(idx) = connected {
            let mut out = Vec::new();
            if let Some(pcb) = self.tcp[idx].as_mut() {
                if !seg.payload.is_empty() && pcb.state.is_synchronized() && seq_after(seg.sequence_num, pcb.recv_next) {
                    self.stats.tcp_out_of_order += 1;
                }
                pcb.on_segment(&seg, now, &mut out);
                pcb.poll_output(now, &mut out);
                self.stats.tcp_retransmits += pcb.take_retransmissions() as u64;
            }
            self.send_tcp(remote, out, now);
            return;
        }

        let listener = self.tcp.iter().position(|p| {
            p.as_ref()
                .is_some_and(|p| p.state == TcpState::Listen && p.local.port() == local.port())
        });

        match listener {
            Some(idx)
                if seg.flags.contains(TcpFlags::SYN)
                    && !seg.flags.contains(TcpFlags::ACK)
                    && !seg.flags.contains(TcpFlags::RST) =>
            {
                self.accept_syn(SocketHandle(idx), local, remote, &seg, now);
            }
            _ if seg.flags.contains(TcpFlags::RST) => {}
            _ => {
                trace!("[TCP] no socket for {} -> {}, sending RST", remote, local);
                self.send_tcp(remote, vec![reset_for(&seg)], now);
            }
        }
    }

    fn accept_syn(&mut self, listener: SocketHandle, local: SocketAddrV4, remote: SocketAddrV4, syn: &TcpSegment, now: u64) {
        let backlog_full = self.tcp[listener.0].as_ref().is_some_and(|l| l.backlog.is_full());
        if backlog_full {
            trace!("[TCP] backlog full on {}, SYN from {} dropped", local, remote);
            return;
        }
        let Ok(slot) = self.alloc_pcb_slot() else {
            trace!("[TCP] no free PCB, SYN from {} dropped", remote);
            return;
        };

        let mut out = Vec::new();
        let iss = self.rng.next_u32();
        let child = Pcb::from_syn(
            local,
            remote,
            syn,
            iss,
            self.our_mss(),
            self.config.tcp,
            listener,
            now,
            &mut out,
        );
        self.tcp[slot] = Some(child);
        if let Some(parent) = self.tcp[listener.0].as_mut() {
            let _ = parent.backlog.push(SocketHandle(slot));
        }
        self.send_tcp(remote, out, now);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // TIMERS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Run every timer that is due: ARP retries, reassembly expiry, TCP
    /// timers and output, DHCP lease and retransmission, socket reaping.
    pub fn tick(&mut self, now: u64) {
        self.arp_cache.expire(now);
        for action in self.arp_pending.poll(now) {
            match action {
                PendingAction::Retry(ip) => self.send_arp_request(ip),
                PendingAction::GiveUp(ip) => {
                    debug!("[ARP] no reply from {}, giving up", ip);
                    self.stats.arp_drops += 1;
                    let route = self.route;
                    for pcb in self.tcp.iter_mut().flatten() {
                        if pcb.state == TcpState::SynSent && route.next_hop(*pcb.remote.ip()) == Some(NextHop::Host(ip)) {
                            pcb.fail(Error::HostUnreachable);
                        }
                    }
                }
            }
        }

        self.stats.ip_reassembly_timeouts += self.reassembler.expire(now) as u64;

        for idx in 0..self.tcp.len() {
            let mut out = Vec::new();
            let Some(pcb) = self.tcp[idx].as_mut() else {
                continue;
            };
            pcb.on_tick(now, &mut out);
            pcb.poll_output(now, &mut out);
            self.stats.tcp_retransmits += pcb.take_retransmissions() as u64;
            let remote = pcb.remote;
            if !out.is_empty() {
                self.send_tcp(remote, out, now);
            }
        }

        if let Some(client) = self.dhcp_client.as_mut() {
            let actions = client.poll(now);
            self.apply_dhcp(actions, now);
        }
        if let Some(server) = self.dhcp_server.as_mut() {
            server.expire(now);
        }

        self.reap();
    }

    /// Free closed PCBs nobody will ask about again
    fn reap(&mut self) {
        for idx in 0..self.tcp.len() {
            let dead = self.tcp[idx]
                .as_ref()
                .is_some_and(|p| p.is_closed() && (p.detached || (p.parent.is_some() && !p.accepted)));
            if !dead {
                continue;
            }
            if let Some(pcb) = self.tcp[idx].take() {
                trace!("[TCP] freed socket {} ({} -> {})", idx, pcb.local, pcb.remote);
                if let Some(parent) = pcb.parent {
                    if let Some(Some(listener)) = self.tcp.get_mut(parent.0) {
                        remove_ordered(&mut listener.backlog, SocketHandle(idx));
                    }
                }
            }
        }
    }

    /// Earliest time `tick` has work to do
    pub fn next_deadline(&self) -> Option<u64> {
        let tcp = self.tcp.iter().flatten().filter_map(|p| p.next_deadline()).min();
        [
            self.arp_pending.next_deadline(),
            self.reassembler.next_deadline(),
            tcp,
            self.dhcp_client.as_ref().and_then(|c| c.next_deadline()),
            self.dhcp_server.as_ref().and_then(|s| s.next_deadline()),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // TCP SOCKETS
    // ═══════════════════════════════════════════════════════════════════════════

    fn alloc_pcb_slot(&mut self) -> Result<usize> {
        if let Some(idx) = self.tcp.iter().position(|p| p.is_none()) {
            return Ok(idx);
        }
        if self.tcp.len() >= self.config.tcp.max_sockets {
            return Err(Error::TooManyConnections);
        }
        self.tcp.push(None);
        Ok(self.tcp.len() - 1)
    }

    // TCP and UDP ports are separate namespaces

    fn tcp_port_in_use(&self, port: u16) -> bool {
        self.tcp.iter().flatten().any(|p| p.local.port() == port)
    }

    fn udp_port_in_use(&self, port: u16) -> bool {
        self.udp.iter().flatten().any(|s| s.local_port == port)
    }

    /// Next free ephemeral port by `in_use`
    fn ephemeral_port(&mut self, in_use: fn(&Self, u16) -> bool) -> Result<u16> {
        for _ in 0..EPHEMERAL_COUNT {
            let port = self.next_port;
            self.next_port = if port == u16::MAX { EPHEMERAL_START } else { port + 1 };
            if !in_use(self, port) {
                return Ok(port);
            }
        }
        Err(Error::AddressInUse)
    }

    fn pcb(&self, handle: SocketHandle) -> Option<&Pcb> {
        self.tcp.get(handle.0).and_then(|p| p.as_ref())
    }

    fn pcb_mut(&mut self, handle: SocketHandle) -> Result<&mut Pcb> {
        self.tcp
            .get_mut(handle.0)
            .and_then(|p| p.as_mut())
            .ok_or(Error::InvalidOperation("no such TCP socket"))
    }

    /// Passive open on `port` (any local address)
    pub fn tcp_listen(&mut self, port: u16) -> Result<SocketHandle> {
        if self
            .tcp
            .iter()
            .flatten()
            .any(|p| p.state == TcpState::Listen && p.local.port() == port)
        {
            return Err(Error::AddressInUse);
        }
        let slot = self.alloc_pcb_slot()?;
        let local = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        self.tcp[slot] = Some(Pcb::listen(local, self.config.tcp));
        debug!("[TCP] listening on port {}", port);
        Ok(SocketHandle(slot))
    }

    /// Active open; the SYN goes out immediately (or after ARP)
    pub fn tcp_connect(&mut self, remote: SocketAddrV4, now: u64) -> Result<SocketHandle> {
        if self.route.ip.is_unspecified() || self.route.next_hop(*remote.ip()).is_none() {
            return Err(Error::HostUnreachable);
        }
        let port = self.ephemeral_port(Self::tcp_port_in_use)?;
        let slot = self.alloc_pcb_slot()?;
        let local = SocketAddrV4::new(self.route.ip, port);
        let iss = self.rng.next_u32();
        let mut out = Vec::new();
        let pcb = Pcb::connect(local, remote, iss, self.our_mss(), self.config.tcp, now, &mut out);
        self.tcp[slot] = Some(pcb);
        self.send_tcp(remote, out, now);
        Ok(SocketHandle(slot))
    }

    /// Next established connection waiting on `listener`, oldest first
    pub fn tcp_accept(&mut self, listener: SocketHandle) -> Option<SocketHandle> {
        let backlog = self.pcb(listener)?.backlog.clone();
        let child = backlog.iter().copied().find(|h| {
            self.pcb(*h)
                .is_some_and(|p| p.state.is_synchronized() || p.state == TcpState::Closed)
        })?;
        if let Some(Some(l)) = self.tcp.get_mut(listener.0) {
            remove_ordered(&mut l.backlog, child);
        }
        if let Some(Some(pcb)) = self.tcp.get_mut(child.0) {
            pcb.accepted = true;
        }
        Some(child)
    }

    /// Queue bytes for sending; returns how many were accepted
    pub fn tcp_send(&mut self, handle: SocketHandle, data: &[u8], now: u64) -> Result<usize> {
        let pcb = self.pcb_mut(handle)?;
        if let Some(e) = &pcb.error {
            return Err(e.clone());
        }
        if pcb.is_closed() {
            return Err(Error::InvalidOperation("socket closed"));
        }
        let n = pcb.send(data);
        self.flush_pcb(handle, now);
        Ok(n)
    }

    /// Move received bytes into `dst`
    pub fn tcp_recv(&mut self, handle: SocketHandle, dst: &mut Buffer, now: u64) -> Result<usize> {
        let pcb = self.pcb_mut(handle)?;
        let n = pcb.recv(dst);
        if pcb.ack_pending() {
            self.flush_pcb(handle, now);
        }
        Ok(n)
    }

    pub fn tcp_state(&self, handle: SocketHandle) -> Option<TcpState> {
        self.pcb(handle).map(|p| p.state)
    }

    pub fn tcp_error(&self, handle: SocketHandle) -> Option<Error> {
        self.pcb(handle).and_then(|p| p.error.clone())
    }

    /// Peer finished sending and everything was read
    pub fn tcp_eof(&self, handle: SocketHandle) -> bool {
        self.pcb(handle).is_some_and(|p| p.is_eof())
    }

    pub fn tcp_recv_queue(&self, handle: SocketHandle) -> usize {
        self.pcb(handle).map_or(0, |p| p.recv_queue())
    }

    /// Bytes sent or queued but not yet acknowledged
    pub fn tcp_send_queue(&self, handle: SocketHandle) -> usize {
        self.pcb(handle).map_or(0, |p| p.send_queue())
    }

    pub fn tcp_send_capacity(&self, handle: SocketHandle) -> usize {
        self.pcb(handle).map_or(0, |p| p.send_capacity())
    }

    pub fn tcp_endpoints(&self, handle: SocketHandle) -> Option<(SocketAddrV4, SocketAddrV4)> {
        self.pcb(handle).map(|p| (p.local, p.remote))
    }

    /// Graceful close. The PCB keeps running the FIN handshake and is freed
    /// once it reaches CLOSED.
    pub fn tcp_close(&mut self, handle: SocketHandle, now: u64) {
        let Ok(pcb) = self.pcb_mut(handle) else {
            return;
        };
        let was_listener = pcb.state == TcpState::Listen;
        pcb.close();
        pcb.detached = true;
        let pending: Vec<SocketHandle> = pcb.backlog.iter().copied().collect();
        pcb.backlog.clear();

        if was_listener {
            for child in pending {
                self.tcp_abort(child, now);
            }
        } else {
            self.flush_pcb(handle, now);
        }
        self.reap();
    }

    /// Half close: FIN after the queued data, receiving carries on. The
    /// socket stays owned by the caller until `tcp_close`.
    pub fn tcp_shutdown(&mut self, handle: SocketHandle, now: u64) -> Result<()> {
        let pcb = self.pcb_mut(handle)?;
        if pcb.state == TcpState::Listen {
            return Err(Error::InvalidOperation("shutdown on a listening socket"));
        }
        pcb.close();
        self.flush_pcb(handle, now);
        Ok(())
    }

    /// Abortive close: RST to the peer, PCB freed at once
    pub fn tcp_abort(&mut self, handle: SocketHandle, now: u64) {
        let Ok(pcb) = self.pcb_mut(handle) else {
            return;
        };
        let rst = pcb.abort();
        pcb.detached = true;
        let remote = pcb.remote;
        if let Some(rst) = rst {
            self.send_tcp(remote, vec![rst], now);
        }
        self.reap();
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // UDP SOCKETS
    // ═══════════════════════════════════════════════════════════════════════════

    fn alloc_udp_slot(&mut self) -> Result<usize> {
        if let Some(idx) = self.udp.iter().position(|s| s.is_none()) {
            return Ok(idx);
        }
        if self.udp.len() >= self.config.udp_max_sockets {
            return Err(Error::TooManyConnections);
        }
        self.udp.push(None);
        Ok(self.udp.len() - 1)
    }

    /// Bind a wildcard socket; port 0 picks an ephemeral port
    pub fn udp_bind(&mut self, port: u16) -> Result<SocketHandle> {
        let port = if port == 0 {
            self.ephemeral_port(Self::udp_port_in_use)?
        } else if self.udp_port_in_use(port) {
            return Err(Error::AddressInUse);
        } else {
            port
        };
        let slot = self.alloc_udp_slot()?;
        self.udp[slot] = Some(UdpSocket::new(port, self.config.udp_queue_len));
        debug!("[UDP] bound port {}", port);
        Ok(SocketHandle(slot))
    }

    /// Socket with a fixed peer on an ephemeral port
    pub fn udp_connect(&mut self, remote: SocketAddrV4) -> Result<SocketHandle> {
        if self.route.ip.is_unspecified() {
            return Err(Error::HostUnreachable);
        }
        let handle = self.udp_bind(0)?;
        if let Some(Some(socket)) = self.udp.get_mut(handle.0) {
            socket.remote = Some(remote);
        }
        Ok(handle)
    }

    /// Send one datagram to `dst`, or to the socket's peer (fixed remote,
    /// else the last sender) when `dst` is None
    pub fn udp_send(&mut self, handle: SocketHandle, dst: Option<SocketAddrV4>, data: &[u8], now: u64) -> Result<()> {
        let socket = self
            .udp
            .get(handle.0)
            .and_then(|s| s.as_ref())
            .ok_or(Error::InvalidOperation("no such UDP socket"))?;
        let dst = dst
            .or(socket.remote)
            .or(socket.last_sender)
            .ok_or(Error::InvalidOperation("UDP socket has no peer"))?;
        let src = SocketAddrV4::new(self.route.ip, socket.local_port);
        let datagram = udp::build(src, dst, data);
        self.send_ip(*dst.ip(), IpProtocol::UDP, &datagram, now)
    }

    pub fn udp_recv(&mut self, handle: SocketHandle) -> Option<(SocketAddrV4, Vec<u8>)> {
        self.udp.get_mut(handle.0)?.as_mut()?.recv()
    }

    pub fn udp_local_port(&self, handle: SocketHandle) -> Option<u16> {
        self.udp.get(handle.0)?.as_ref().map(|s| s.local_port)
    }

    /// Peer replies go to: fixed remote, else the last sender
    pub fn udp_peer(&self, handle: SocketHandle) -> Option<SocketAddrV4> {
        let socket = self.udp.get(handle.0)?.as_ref()?;
        socket.remote.or(socket.last_sender)
    }

    /// Datagrams waiting in the socket queue
    pub fn udp_pending(&self, handle: SocketHandle) -> usize {
        self.udp
            .get(handle.0)
            .and_then(|s| s.as_ref())
            .map_or(0, |s| s.queued())
    }

    pub fn udp_close(&mut self, handle: SocketHandle) {
        if let Some(slot) = self.udp.get_mut(handle.0) {
            *slot = None;
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // ICMP
    // ═══════════════════════════════════════════════════════════════════════════

    /// Send an echo request
    pub fn ping(&mut self, dst: Ipv4Addr, ident: u16, seq: u16, data: &[u8], now: u64) -> Result<()> {
        let request = IcmpPacket::echo_request(ident, seq, data);
        self.send_ip(dst, IpProtocol::ICMP, &request.to_bytes(), now)
    }
}

/// RST answering a segment that matched no socket (RFC 793, "Reset Generation")
fn reset_for(seg: &TcpSegment) -> TcpSegment {
    if seg.flags.contains(TcpFlags::ACK) {
        TcpSegment {
            src_port: seg.dst_port,
            dst_port: seg.src_port,
            sequence_num: seg.ack_num,
            flags: TcpFlags::new(TcpFlags::RST),
            ..Default::default()
        }
    } else {
        TcpSegment {
            src_port: seg.dst_port,
            dst_port: seg.src_port,
            sequence_num: 0,
            ack_num: seg.sequence_num.wrapping_add(seg.seq_len()),
            flags: TcpFlags::new(TcpFlags::RST | TcpFlags::ACK),
            ..Default::default()
        }
    }
}

/// Remove `handle` keeping the order of the rest
fn remove_ordered<const N: usize>(list: &mut heapless::Vec<SocketHandle, N>, handle: SocketHandle) {
    if let Some(idx) = list.iter().position(|h| *h == handle) {
        list[idx..].rotate_left(1);
        list.pop();
    }
}
