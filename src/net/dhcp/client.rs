//! DHCP client state machine (RFC 2131 section 4.4)
//!
//! Pure state machine: the stack feeds it received messages and the current
//! time, and carries out the [`ClientAction`]s it returns.

use alloc::vec::Vec;
use core::net::Ipv4Addr;

use log::{debug, info, warn};

use crate::net::dhcp::{DhcpMessage, MessageType, Outgoing, CLIENT_PORT, FLAG_BROADCAST, SERVER_PORT};
use crate::net::ethernet::MacAddress;

/// First retransmission interval
const INITIAL_RETRY_MS: u64 = 4_000;

/// Retransmission interval ceiling
const MAX_RETRY_MS: u64 = 64_000;

/// REQUESTs sent in Requesting before falling back to discovery
const MAX_REQUEST_ATTEMPTS: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Not started
    Init,
    /// DISCOVER sent, waiting for an OFFER
    Selecting,
    /// REQUEST sent for an offered address
    Requesting,
    Bound,
    /// Past T1: unicast REQUEST to the leasing server
    Renewing,
    /// Past T2: broadcast REQUEST to any server
    Rebinding,
}

/// Address configuration granted by a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub router: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    pub server_id: Ipv4Addr,
    /// Learned from the ACK frame; renewals are sent straight to it
    pub server_mac: MacAddress,
    pub lease_time_s: u32,
    /// When the ACK arrived (ms)
    pub acquired_at: u64,
    /// T1 (ms, absolute)
    pub renew_at: u64,
    /// T2 (ms, absolute)
    pub rebind_at: u64,
    pub expires_at: u64,
}

/// What the stack must do on the client's behalf
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    Send(Outgoing),
    /// Install the leased address
    Configure(Lease),
    /// Drop the interface address
    Deconfigure,
}

pub struct DhcpClient {
    mac: MacAddress,
    state: ClientState,
    xid: u32,
    offered: Option<(Ipv4Addr, Ipv4Addr)>,
    lease: Option<Lease>,
    retry_at: u64,
    retry_interval: u64,
    attempts: u8,
}

impl DhcpClient {
    pub fn new(mac: MacAddress, xid: u32) -> Self {
        Self {
            mac,
            state: ClientState::Init,
            xid,
            offered: None,
            lease: None,
            retry_at: 0,
            retry_interval: INITIAL_RETRY_MS,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// Begin discovery
    pub fn start(&mut self, now: u64) -> Vec<ClientAction> {
        let mut actions = Vec::new();
        self.restart(now, &mut actions);
        actions
    }

    fn restart(&mut self, now: u64, actions: &mut Vec<ClientAction>) {
        if self.lease.take().is_some() {
            actions.push(ClientAction::Deconfigure);
        }
        self.xid = self.xid.wrapping_add(1);
        self.offered = None;
        self.state = ClientState::Selecting;
        debug!("[DHCP] discovering (xid {:#010x})", self.xid);
        self.reset_retry(now);
        actions.push(ClientAction::Send(self.discover()));
    }

    fn reset_retry(&mut self, now: u64) {
        self.attempts = 1;
        self.retry_interval = INITIAL_RETRY_MS;
        self.retry_at = now + self.retry_interval;
    }

    fn back_off(&mut self, now: u64) {
        self.attempts = self.attempts.saturating_add(1);
        self.retry_interval = (self.retry_interval * 2).min(MAX_RETRY_MS);
        self.retry_at = now + self.retry_interval;
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // MESSAGES
    // ═══════════════════════════════════════════════════════════════════════════

    fn broadcast(&self, message: DhcpMessage, src: Ipv4Addr) -> Outgoing {
        Outgoing {
            message,
            src,
            dst: Ipv4Addr::BROADCAST,
            dst_mac: MacAddress::BROADCAST,
            src_port: CLIENT_PORT,
            dst_port: SERVER_PORT,
        }
    }

    fn discover(&self) -> Outgoing {
        let mut msg = DhcpMessage::new(MessageType::Discover, self.xid, self.mac);
        msg.flags = FLAG_BROADCAST;
        self.broadcast(msg, Ipv4Addr::UNSPECIFIED)
    }

    /// REQUEST for the offered address (Requesting)
    fn select_request(&self, ip: Ipv4Addr, server_id: Ipv4Addr) -> Outgoing {
        let mut msg = DhcpMessage::new(MessageType::Request, self.xid, self.mac);
        msg.flags = FLAG_BROADCAST;
        msg.requested_ip = Some(ip);
        msg.server_id = Some(server_id);
        self.broadcast(msg, Ipv4Addr::UNSPECIFIED)
    }

    /// REQUEST extending the current lease (Renewing unicasts, Rebinding broadcasts)
    fn extend_request(&self, lease: &Lease) -> Outgoing {
        let mut msg = DhcpMessage::new(MessageType::Request, self.xid, self.mac);
        msg.ciaddr = lease.ip;
        if self.state == ClientState::Renewing {
            Outgoing {
                message: msg,
                src: lease.ip,
                dst: lease.server_id,
                dst_mac: lease.server_mac,
                src_port: CLIENT_PORT,
                dst_port: SERVER_PORT,
            }
        } else {
            self.broadcast(msg, lease.ip)
        }
    }

    /// Current state's message, for retransmission
    fn current_request(&self) -> Option<Outgoing> {
        match self.state {
            ClientState::Selecting => Some(self.discover()),
            ClientState::Requesting => self.offered.map(|(ip, server)| self.select_request(ip, server)),
            ClientState::Renewing | ClientState::Rebinding => {
                self.lease.as_ref().map(|lease| self.extend_request(lease))
            }
            ClientState::Init | ClientState::Bound => None,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // INPUT
    // ═══════════════════════════════════════════════════════════════════════════

    /// Handle a server message; `src_mac` is the Ethernet source of the frame
    pub fn on_message(&mut self, msg: &DhcpMessage, src_mac: MacAddress, now: u64) -> Vec<ClientAction> {
        let mut actions = Vec::new();
        if msg.xid != self.xid || msg.chaddr != self.mac {
            return actions;
        }

        match (self.state, msg.message_type) {
            (ClientState::Selecting, MessageType::Offer) => {
                let Some(server_id) = msg.server_id else {
                    warn!("[DHCP] offer without server identifier ignored");
                    return actions;
                };
                debug!("[DHCP] offer {} from {}", msg.yiaddr, server_id);
                self.offered = Some((msg.yiaddr, server_id));
                self.state = ClientState::Requesting;
                self.reset_retry(now);
                actions.push(ClientAction::Send(self.select_request(msg.yiaddr, server_id)));
            }
            (ClientState::Requesting | ClientState::Renewing | ClientState::Rebinding, MessageType::Ack) => {
                let lease = self.lease_from_ack(msg, src_mac, now);
                info!(
                    "[DHCP] bound to {} (lease {} s, server {})",
                    lease.ip, lease.lease_time_s, lease.server_id
                );
                self.state = ClientState::Bound;
                self.offered = None;
                self.lease = Some(lease.clone());
                actions.push(ClientAction::Configure(lease));
            }
            (ClientState::Requesting | ClientState::Renewing | ClientState::Rebinding, MessageType::Nak) => {
                warn!("[DHCP] NAK from {:?}, restarting discovery", msg.server_id);
                self.restart(now, &mut actions);
            }
            _ => {}
        }
        actions
    }

    fn lease_from_ack(&self, msg: &DhcpMessage, src_mac: MacAddress, now: u64) -> Lease {
        let lease_time_s = msg.lease_time.unwrap_or(3600).max(1);
        let lease_ms = lease_time_s as u64 * 1000;
        let t1 = msg
            .renewal_time
            .map(|s| s as u64 * 1000)
            .unwrap_or(lease_ms / 2)
            .min(lease_ms);
        let t2 = msg
            .rebinding_time
            .map(|s| s as u64 * 1000)
            .unwrap_or(lease_ms * 7 / 8)
            .clamp(t1, lease_ms);

        let server_id = msg
            .server_id
            .or_else(|| self.lease.as_ref().map(|l| l.server_id))
            .unwrap_or(msg.siaddr);

        Lease {
            ip: msg.yiaddr,
            netmask: msg.subnet_mask.unwrap_or(Ipv4Addr::new(255, 255, 255, 0)),
            router: msg.router,
            dns: msg.dns,
            server_id,
            server_mac: src_mac,
            lease_time_s,
            acquired_at: now,
            renew_at: now + t1,
            rebind_at: now + t2,
            expires_at: now + lease_ms,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // TIMERS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Drive retransmission and lease timers
    pub fn poll(&mut self, now: u64) -> Vec<ClientAction> {
        let mut actions = Vec::new();

        if let Some(lease) = &self.lease {
            let (renew_at, rebind_at, expires_at) = (lease.renew_at, lease.rebind_at, lease.expires_at);

            if now >= expires_at {
                warn!("[DHCP] lease on {} expired", lease.ip);
                self.restart(now, &mut actions);
                return actions;
            }
            if self.state == ClientState::Bound && now >= renew_at {
                debug!("[DHCP] T1 reached, renewing");
                self.state = ClientState::Renewing;
                self.reset_retry(now);
                self.push_request(&mut actions);
                return actions;
            }
            if self.state == ClientState::Renewing && now >= rebind_at {
                debug!("[DHCP] T2 reached, rebinding");
                self.state = ClientState::Rebinding;
                self.reset_retry(now);
                self.push_request(&mut actions);
                return actions;
            }
        }

        if self.state != ClientState::Bound && self.state != ClientState::Init && now >= self.retry_at {
            if self.state == ClientState::Requesting && self.attempts >= MAX_REQUEST_ATTEMPTS {
                debug!("[DHCP] no ACK for offered address");
                self.restart(now, &mut actions);
                return actions;
            }
            self.back_off(now);
            self.push_request(&mut actions);
        }
        actions
    }

    fn push_request(&self, actions: &mut Vec<ClientAction>) {
        if let Some(out) = self.current_request() {
            actions.push(ClientAction::Send(out));
        }
    }

    /// Earliest time `poll` has something to do
    pub fn next_deadline(&self) -> Option<u64> {
        let lease = self.lease.as_ref();
        match self.state {
            ClientState::Init => None,
            ClientState::Selecting | ClientState::Requesting => Some(self.retry_at),
            ClientState::Bound => lease.map(|l| l.renew_at),
            ClientState::Renewing => lease.map(|l| self.retry_at.min(l.rebind_at)),
            ClientState::Rebinding => lease.map(|l| self.retry_at.min(l.expires_at)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const SERVER_MAC: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x01]);

    fn client() -> DhcpClient {
        DhcpClient::new(MacAddress([0x02, 0, 0, 0, 0, 0x42]), 100)
    }

    fn sent(actions: &[ClientAction]) -> Vec<&Outgoing> {
        actions
            .iter()
            .filter_map(|a| match a {
                ClientAction::Send(out) => Some(out),
                _ => None,
            })
            .collect()
    }

    fn reply(client: &DhcpClient, kind: MessageType, lease_s: u32) -> DhcpMessage {
        let mut msg = DhcpMessage::new(kind, client.xid, client.mac);
        msg.yiaddr = Ipv4Addr::new(10, 0, 0, 50);
        msg.server_id = Some(SERVER);
        msg.subnet_mask = Some(Ipv4Addr::new(255, 255, 255, 0));
        msg.router = Some(SERVER);
        msg.lease_time = Some(lease_s);
        msg
    }

    fn bound(lease_s: u32) -> DhcpClient {
        let mut c = client();
        c.start(0);
        let offer = reply(&c, MessageType::Offer, lease_s);
        c.on_message(&offer, SERVER_MAC, 0);
        let ack = reply(&c, MessageType::Ack, lease_s);
        c.on_message(&ack, SERVER_MAC, 0);
        assert_eq!(c.state(), ClientState::Bound);
        c
    }

    // ──────────────────────────────────────────────────────────────────────────
    // ACQUISITION TESTS
    // ──────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_start_broadcasts_discover() {
        let mut c = client();
        let actions = c.start(0);
        let out = sent(&actions);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message.message_type, MessageType::Discover);
        assert_eq!(out[0].dst, Ipv4Addr::BROADCAST);
        assert_eq!(out[0].dst_mac, MacAddress::BROADCAST);
        assert_eq!(c.state(), ClientState::Selecting);
    }

    #[test]
    fn test_offer_then_ack_configures() {
        let mut c = client();
        c.start(0);
        let offer = reply(&c, MessageType::Offer, 3600);
        let actions = c.on_message(&offer, SERVER_MAC, 10);
        let out = sent(&actions);
        assert_eq!(out[0].message.message_type, MessageType::Request);
        assert_eq!(out[0].message.requested_ip, Some(Ipv4Addr::new(10, 0, 0, 50)));
        assert_eq!(out[0].message.server_id, Some(SERVER));

        let ack = reply(&c, MessageType::Ack, 3600);
        let actions = c.on_message(&ack, SERVER_MAC, 20);
        let ClientAction::Configure(lease) = &actions[0] else {
            panic!("expected Configure, got {:?}", actions);
        };
        assert_eq!(lease.ip, Ipv4Addr::new(10, 0, 0, 50));
        assert_eq!(lease.server_mac, SERVER_MAC);
        assert_eq!(lease.renew_at, 20 + 1_800_000);
        assert_eq!(lease.rebind_at, 20 + 3_150_000);
    }

    #[test]
    fn test_foreign_xid_ignored() {
        let mut c = client();
        c.start(0);
        let mut offer = reply(&c, MessageType::Offer, 3600);
        offer.xid ^= 1;
        assert!(c.on_message(&offer, SERVER_MAC, 0).is_empty());
        assert_eq!(c.state(), ClientState::Selecting);
    }

    #[test]
    fn test_discover_backoff() {
        let mut c = client();
        c.start(0);
        assert_eq!(c.next_deadline(), Some(4_000));
        assert_eq!(sent(&c.poll(4_000)).len(), 1);
        assert_eq!(c.next_deadline(), Some(12_000));
        assert!(c.poll(5_000).is_empty());
    }

    #[test]
    fn test_nak_restarts_discovery() {
        let mut c = bound(3600);
        c.poll(1_800_000);
        assert_eq!(c.state(), ClientState::Renewing);

        let nak = reply(&c, MessageType::Nak, 0);
        let actions = c.on_message(&nak, SERVER_MAC, 1_800_001);
        assert_eq!(actions[0], ClientAction::Deconfigure);
        assert_eq!(sent(&actions)[0].message.message_type, MessageType::Discover);
        assert_eq!(c.state(), ClientState::Selecting);
    }

    // ──────────────────────────────────────────────────────────────────────────
    // RENEWAL TESTS
    // ──────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_renewal_is_unicast_to_server() {
        let mut c = bound(2);
        assert_eq!(c.next_deadline(), Some(1_000));
        let actions = c.poll(1_000);
        let out = sent(&actions);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dst, SERVER);
        assert_eq!(out[0].dst_mac, SERVER_MAC);
        assert_eq!(out[0].message.ciaddr, Ipv4Addr::new(10, 0, 0, 50));
    }

    #[test]
    fn test_lease_expires_without_ack() {
        let mut c = bound(2);
        c.poll(1_000);
        let rebind = c.poll(1_750);
        assert_eq!(c.state(), ClientState::Rebinding);
        assert_eq!(sent(&rebind)[0].dst, Ipv4Addr::BROADCAST);

        let actions = c.poll(2_000);
        assert_eq!(actions[0], ClientAction::Deconfigure);
        assert!(c.lease().is_none());
        assert_eq!(c.state(), ClientState::Selecting);
    }

    #[test]
    fn test_renewal_ack_extends_lease() {
        let mut c = bound(2);
        c.poll(1_000);
        let ack = reply(&c, MessageType::Ack, 2);
        let actions = c.on_message(&ack, SERVER_MAC, 1_100);
        assert!(matches!(actions[0], ClientAction::Configure(_)));
        assert_eq!(c.lease().map(|l| l.expires_at), Some(3_100));
        assert_eq!(c.state(), ClientState::Bound);
    }
}
