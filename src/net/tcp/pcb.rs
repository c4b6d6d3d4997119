//! TCP protocol control block
//!
//! One PCB per connection. Inbound segments go through [`Pcb::on_segment`],
//! time through [`Pcb::on_tick`], and whatever the PCB wants to transmit is
//! pushed onto the caller's segment list. The PCB never touches the network
//! itself, so the stack can borrow it alongside its own output queue.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::net::SocketAddrV4;

use log::{debug, trace, warn};

use crate::buffer::Buffer;
use crate::config::TcpConfig;
use crate::error::Error;
use crate::net::stack::SocketHandle;
use crate::net::tcp::congestion::CongestionControl;
use crate::net::tcp::retransmit::RetransmitQueue;
use crate::net::tcp::{seq_after, seq_after_eq, TcpFlags, TcpSegment, TcpState, DEFAULT_MSS};

/// Connections waiting in a listener's accept queue (handshake in progress
/// included)
pub const BACKLOG: usize = 8;

/// Out-of-order segments held for later delivery
pub const REORDER_SLOTS: usize = 4;

/// TCP Connection (Transmission Control Block)
pub struct Pcb {
    // ─────────────────────────────────────────────────────────────────────────
    // Connection Identity
    // ─────────────────────────────────────────────────────────────────────────
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,

    // ─────────────────────────────────────────────────────────────────────────
    // State Machine
    // ─────────────────────────────────────────────────────────────────────────
    pub state: TcpState,
    /// Why the connection died, if it did not close cleanly
    pub error: Option<Error>,

    // ─────────────────────────────────────────────────────────────────────────
    // Sequence Numbers (RFC 793)
    // ─────────────────────────────────────────────────────────────────────────
    /// SND.UNA - oldest unacknowledged sequence number
    pub send_unacked: u32,
    /// SND.NXT - next sequence number to send
    pub send_next: u32,
    /// SND.WND - peer's advertised receive window
    pub send_window: u32,
    /// RCV.NXT - next expected sequence number
    pub recv_next: u32,
    pub iss: u32,
    pub irs: u32,

    // ─────────────────────────────────────────────────────────────────────────
    // RTT Estimation (Jacobson/Karels), milliseconds
    // ─────────────────────────────────────────────────────────────────────────
    srtt: u64,
    rttvar: u64,
    rto: u64,
    /// Consecutive timeouts; the effective RTO is `rto << backoff`
    backoff: u32,
    /// Sequence number being timed for RTT measurement
    rtt_seq: Option<u32>,
    rtt_time: u64,

    // ─────────────────────────────────────────────────────────────────────────
    // Congestion Control
    // ─────────────────────────────────────────────────────────────────────────
    cc: Box<dyn CongestionControl>,
    dup_acks: u8,
    /// SND.NXT when fast recovery was entered
    recover: u32,

    // ─────────────────────────────────────────────────────────────────────────
    // Retransmission and timers
    // ─────────────────────────────────────────────────────────────────────────
    retransmit: RetransmitQueue,
    rto_deadline: Option<u64>,
    persist_at: Option<u64>,
    persist_backoff: u32,
    time_wait_until: Option<u64>,
    last_recv_at: u64,
    keepalive_sent: u8,
    retransmissions: u32,

    // ─────────────────────────────────────────────────────────────────────────
    // Buffers
    // ─────────────────────────────────────────────────────────────────────────
    /// Accepted from the application, not yet sent
    tx: Buffer,
    /// In-order data from the peer, window = free space
    rx: Buffer,
    reorder: heapless::Vec<(u32, Vec<u8>), REORDER_SLOTS>,
    /// Effective maximum segment size
    pub mss: u16,
    our_mss: u16,
    last_advertised: u32,
    ack_pending: bool,
    fin_queued: bool,
    fin_sent: bool,
    fin_received: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // Ownership
    // ─────────────────────────────────────────────────────────────────────────
    /// Listener that spawned this connection
    pub parent: Option<SocketHandle>,
    /// Handed to the application by accept (always true for active opens)
    pub accepted: bool,
    /// The application let go; free the PCB once it reaches Closed
    pub detached: bool,
    /// Established children waiting for accept (listeners only)
    pub backlog: heapless::Vec<SocketHandle, BACKLOG>,

    config: TcpConfig,
}

impl Pcb {
    fn new(local: SocketAddrV4, remote: SocketAddrV4, iss: u32, our_mss: u16, config: TcpConfig) -> Self {
        let window = config.recv_window.min(65535);
        Self {
            local,
            remote,
            state: TcpState::Closed,
            error: None,
            send_unacked: iss,
            send_next: iss,
            send_window: 0,
            recv_next: 0,
            iss,
            irs: 0,
            srtt: 0,
            rttvar: 0,
            rto: config.initial_rto_ms,
            backoff: 0,
            rtt_seq: None,
            rtt_time: 0,
            cc: config.congestion.build(DEFAULT_MSS as u32),
            dup_acks: 0,
            recover: iss,
            retransmit: RetransmitQueue::new(),
            rto_deadline: None,
            persist_at: None,
            persist_backoff: 0,
            time_wait_until: None,
            last_recv_at: 0,
            keepalive_sent: 0,
            retransmissions: 0,
            tx: Buffer::new(window),
            rx: Buffer::new(window),
            reorder: heapless::Vec::new(),
            mss: DEFAULT_MSS.min(our_mss),
            our_mss,
            last_advertised: window as u32,
            ack_pending: false,
            fin_queued: false,
            fin_sent: false,
            fin_received: false,
            parent: None,
            accepted: true,
            detached: false,
            backlog: heapless::Vec::new(),
            config,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // OPEN
    // ═══════════════════════════════════════════════════════════════════════════

    /// Passive open
    pub fn listen(local: SocketAddrV4, config: TcpConfig) -> Self {
        let mut pcb = Self::new(local, SocketAddrV4::new(*local.ip(), 0), 0, DEFAULT_MSS, config);
        pcb.state = TcpState::Listen;
        pcb
    }

    /// Active open: queue a SYN
    pub fn connect(
        local: SocketAddrV4,
        remote: SocketAddrV4,
        iss: u32,
        our_mss: u16,
        config: TcpConfig,
        now: u64,
        out: &mut Vec<TcpSegment>,
    ) -> Self {
        let mut pcb = Self::new(local, remote, iss, our_mss, config);
        pcb.state = TcpState::SynSent;
        pcb.last_recv_at = now;
        pcb.send_syn(now, out);
        debug!("[TCP] {} -> {} SYN_SENT", local, remote);
        pcb
    }

    /// Child of a listener for an incoming SYN; answers with SYN-ACK
    #[allow(clippy::too_many_arguments)]
    pub fn from_syn(
        local: SocketAddrV4,
        remote: SocketAddrV4,
        syn: &TcpSegment,
        iss: u32,
        our_mss: u16,
        config: TcpConfig,
        parent: SocketHandle,
        now: u64,
        out: &mut Vec<TcpSegment>,
    ) -> Self {
        let mut pcb = Self::new(local, remote, iss, our_mss, config);
        pcb.state = TcpState::SynReceived;
        pcb.parent = Some(parent);
        pcb.accepted = false;
        pcb.irs = syn.sequence_num;
        pcb.recv_next = syn.sequence_num.wrapping_add(1);
        pcb.send_window = syn.window_size as u32;
        pcb.set_peer_mss(syn.mss);
        pcb.last_recv_at = now;
        pcb.send_syn(now, out);
        debug!("[TCP] {} <- {} SYN_RECEIVED", local, remote);
        pcb
    }

    fn set_peer_mss(&mut self, peer: Option<u16>) {
        self.mss = peer.unwrap_or(DEFAULT_MSS).min(self.our_mss).max(64);
        self.cc = self.config.congestion.build(self.mss as u32);
    }

    fn send_syn(&mut self, now: u64, out: &mut Vec<TcpSegment>) {
        self.retransmit.push(self.iss, Vec::new(), true, false, now);
        self.send_next = self.iss.wrapping_add(1);
        self.rtt_seq = Some(self.iss);
        self.rtt_time = now;
        self.rto_deadline = Some(now + self.current_rto());
        out.push(self.syn_segment());
    }

    fn syn_segment(&self) -> TcpSegment {
        let mut flags = TcpFlags::SYN;
        if self.state == TcpState::SynReceived {
            flags |= TcpFlags::ACK;
        }
        let mut seg = self.segment(self.iss, flags, Vec::new());
        seg.mss = Some(self.our_mss);
        seg
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // APPLICATION INTERFACE
    // ═══════════════════════════════════════════════════════════════════════════

    /// Queue data for sending; returns how many bytes were accepted
    pub fn send(&mut self, data: &[u8]) -> usize {
        let open = matches!(
            self.state,
            TcpState::SynSent | TcpState::SynReceived | TcpState::Established | TcpState::CloseWait
        );
        if !open || self.fin_queued {
            return 0;
        }
        self.tx.fill(data)
    }

    /// Move received data into `dst`; returns bytes moved
    pub fn recv(&mut self, dst: &mut Buffer) -> usize {
        let n = dst.fill(self.rx.as_slice());
        self.rx.consume(n);
        let threshold = (self.mss as usize).min(self.rx.max_capacity() / 2);
        if n > 0 && (self.last_advertised as usize) < threshold && self.rx.available() >= threshold {
            // Window reopened
            self.ack_pending = true;
        }
        n
    }

    /// Bytes waiting to be read
    pub fn recv_queue(&self) -> usize {
        self.rx.len()
    }

    /// Bytes not yet acknowledged by the peer (sent or unsent)
    pub fn send_queue(&self) -> usize {
        self.tx.len() + self.retransmit.in_flight() as usize
    }

    /// Room for more application data
    pub fn send_capacity(&self) -> usize {
        if self.fin_queued {
            0
        } else {
            self.tx.available()
        }
    }

    /// Peer closed its side and every byte before the FIN was read
    pub fn is_eof(&self) -> bool {
        self.fin_received && self.rx.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state == TcpState::Closed
    }

    /// Graceful close: FIN goes out once queued data is sent
    pub fn close(&mut self) {
        match self.state {
            TcpState::Listen | TcpState::Closed => self.enter_closed(),
            // Nothing queued, nothing the peer could miss
            TcpState::SynSent if self.tx.is_empty() => self.enter_closed(),
            TcpState::SynSent
            | TcpState::SynReceived | TcpState::Established | TcpState::CloseWait => {
                self.fin_queued = true;
            }
            _ => {}
        }
    }

    /// Abortive close; returns the RST to send, if any
    pub fn abort(&mut self) -> Option<TcpSegment> {
        let rst = if self.state.is_synchronized() || self.state == TcpState::SynReceived {
            Some(self.segment(self.send_next, TcpFlags::RST | TcpFlags::ACK, Vec::new()))
        } else {
            None
        };
        self.enter_closed();
        rst
    }

    /// Kill the connection with `error` (reset, timeout, unreachable)
    pub fn fail(&mut self, error: Error) {
        if self.state != TcpState::Closed {
            warn!("[TCP] {} -> {} failed: {}", self.local, self.remote, error);
            self.error = Some(error);
        }
        self.enter_closed();
    }

    fn enter_closed(&mut self) {
        self.state = TcpState::Closed;
        self.retransmit.clear();
        self.tx.reset();
        self.rto_deadline = None;
        self.persist_at = None;
        self.time_wait_until = None;
        self.ack_pending = false;
    }

    /// Retransmissions since the last call
    pub fn take_retransmissions(&mut self) -> u32 {
        core::mem::take(&mut self.retransmissions)
    }

    pub fn rto(&self) -> u64 {
        self.rto
    }

    pub fn congestion_window(&self) -> u32 {
        self.cc.window()
    }

    fn current_rto(&self) -> u64 {
        self.rto
            .checked_shl(self.backoff)
            .unwrap_or(u64::MAX)
            .min(self.config.max_rto_ms)
    }

    fn receive_window(&self) -> u32 {
        self.rx.available().min(65535) as u32
    }

    fn segment(&self, seq: u32, flags: u16, payload: Vec<u8>) -> TcpSegment {
        TcpSegment {
            src_port: self.local.port(),
            dst_port: self.remote.port(),
            sequence_num: seq,
            ack_num: if flags & TcpFlags::ACK != 0 { self.recv_next } else { 0 },
            flags: TcpFlags::new(flags),
            window_size: self.receive_window() as u16,
            urgent_pointer: 0,
            mss: None,
            payload,
        }
    }

    fn emit(&mut self, seg: TcpSegment, out: &mut Vec<TcpSegment>) {
        if seg.flags.contains(TcpFlags::ACK) {
            self.ack_pending = false;
            self.last_advertised = seg.window_size as u32;
        }
        out.push(seg);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // INPUT
    // ═══════════════════════════════════════════════════════════════════════════

    /// Process a segment addressed to this connection
    pub fn on_segment(&mut self, seg: &TcpSegment, now: u64, out: &mut Vec<TcpSegment>) {
        self.last_recv_at = now;
        self.keepalive_sent = 0;

        match self.state {
            TcpState::Closed | TcpState::Listen => return,
            TcpState::SynSent => {
                self.on_syn_sent(seg, now, out);
                return;
            }
            _ => {}
        }

        if !self.acceptable(seg) {
            trace!("[TCP] {} unacceptable seq {}", self.local, seg.sequence_num);
            if !seg.flags.contains(TcpFlags::RST) {
                self.ack_pending = true;
            }
            return;
        }

        if seg.flags.contains(TcpFlags::RST) {
            if self.state == TcpState::SynReceived && self.parent.is_some() {
                // Handshake abandoned; the listener forgets it
                self.enter_closed();
            } else {
                self.fail(Error::ConnectionReset);
            }
            return;
        }

        if seg.flags.contains(TcpFlags::SYN) {
            // SYN inside the window of a synchronized connection
            if let Some(rst) = self.abort() {
                out.push(rst);
            }
            self.error = Some(Error::ConnectionReset);
            return;
        }

        if !seg.flags.contains(TcpFlags::ACK) {
            return;
        }

        if self.state == TcpState::SynReceived {
            let ack = seg.ack_num;
            if seq_after(ack, self.send_unacked) && seq_after_eq(self.send_next, ack) {
                self.state = TcpState::Established;
                debug!("[TCP] {} <- {} ESTABLISHED", self.local, self.remote);
            } else {
                out.push(TcpSegment {
                    src_port: self.local.port(),
                    dst_port: self.remote.port(),
                    sequence_num: ack,
                    flags: TcpFlags::new(TcpFlags::RST),
                    ..Default::default()
                });
                return;
            }
        }

        self.process_ack(seg, now, out);
        if self.state == TcpState::Closed {
            return;
        }

        if !seg.payload.is_empty() {
            self.process_data(seg);
        }

        if seg.flags.contains(TcpFlags::FIN) {
            self.process_fin(seg, now);
        }
    }

    fn on_syn_sent(&mut self, seg: &TcpSegment, now: u64, out: &mut Vec<TcpSegment>) {
        let ack_ok = seg.flags.contains(TcpFlags::ACK)
            && seq_after(seg.ack_num, self.iss)
            && seq_after_eq(self.send_next, seg.ack_num);

        if seg.flags.contains(TcpFlags::ACK) && !ack_ok {
            if !seg.flags.contains(TcpFlags::RST) {
                out.push(TcpSegment {
                    src_port: self.local.port(),
                    dst_port: self.remote.port(),
                    sequence_num: seg.ack_num,
                    flags: TcpFlags::new(TcpFlags::RST),
                    ..Default::default()
                });
            }
            return;
        }

        if seg.flags.contains(TcpFlags::RST) {
            if ack_ok {
                self.fail(Error::ConnectionRefused);
            }
            return;
        }

        if !seg.flags.contains(TcpFlags::SYN) {
            return;
        }

        self.irs = seg.sequence_num;
        self.recv_next = seg.sequence_num.wrapping_add(1);
        self.send_window = seg.window_size as u32;
        self.set_peer_mss(seg.mss);

        if ack_ok {
            let retransmitted = self.retransmit.front().is_some_and(|e| e.retransmits > 0);
            self.retransmit.ack_up_to(seg.ack_num);
            if !retransmitted {
                self.update_rtt(now.saturating_sub(self.rtt_time));
            }
            self.rtt_seq = None;
            self.backoff = 0;
            self.send_unacked = seg.ack_num;
            self.rto_deadline = None;
            self.state = TcpState::Established;
            self.ack_pending = true;
            debug!("[TCP] {} -> {} ESTABLISHED", self.local, self.remote);
        } else {
            // Simultaneous open
            self.state = TcpState::SynReceived;
            let seg = self.syn_segment();
            out.push(seg);
        }
    }

    /// RFC 793 segment acceptability test
    fn acceptable(&self, seg: &TcpSegment) -> bool {
        let len = seg.seq_len();
        let wnd = self.receive_window();
        let seq = seg.sequence_num;
        let in_window = |s: u32| seq_after_eq(s, self.recv_next) && seq_after(self.recv_next.wrapping_add(wnd), s);

        match (len, wnd) {
            (0, 0) => seq == self.recv_next,
            (0, _) => in_window(seq),
            (_, 0) => false,
            _ => in_window(seq) || in_window(seq.wrapping_add(len - 1)),
        }
    }

    fn process_ack(&mut self, seg: &TcpSegment, now: u64, out: &mut Vec<TcpSegment>) {
        let ack = seg.ack_num;

        if seq_after(ack, self.send_next) {
            // Acknowledges something never sent
            self.ack_pending = true;
            return;
        }

        let window = seg.window_size as u32;

        if seq_after(ack, self.send_unacked) {
            if let Some(rtt_seq) = self.rtt_seq {
                if seq_after(ack, rtt_seq) {
                    self.update_rtt(now.saturating_sub(self.rtt_time));
                    self.rtt_seq = None;
                }
            }

            let full_ack = self.cc.in_recovery() && seq_after_eq(ack, self.recover);
            let acked = self.retransmit.ack_up_to(ack);
            self.cc.on_ack(acked, full_ack);
            self.send_unacked = ack;
            self.dup_acks = 0;
            self.backoff = 0;

            if self.cc.in_recovery() {
                // Partial ack: the next hole is lost too
                self.retransmit_front(now, out);
            }

            self.rto_deadline = if self.retransmit.is_empty() {
                None
            } else {
                Some(now + self.current_rto())
            };

            self.on_fin_acked(now);
        } else if ack == self.send_unacked
            && seg.payload.is_empty()
            && !seg.flags.contains(TcpFlags::FIN)
            && window == self.send_window
            && !self.retransmit.is_empty()
        {
            self.dup_acks = self.dup_acks.saturating_add(1);
            if self.config.fast_retransmit {
                let flight = self.send_next.wrapping_sub(self.send_unacked);
                if self.cc.on_duplicate_ack(self.dup_acks, flight) {
                    debug!("[TCP] {} fast retransmit at {}", self.local, self.send_unacked);
                    self.recover = self.send_next;
                    self.retransmit_front(now, out);
                }
            }
        }

        if seq_after_eq(ack, self.send_unacked) {
            self.send_window = window;
            if window > 0 {
                self.persist_at = None;
                self.persist_backoff = 0;
            }
        }
    }

    fn on_fin_acked(&mut self, now: u64) {
        if !self.fin_sent || self.send_unacked != self.send_next {
            return;
        }
        match self.state {
            TcpState::FinWait1 => self.state = TcpState::FinWait2,
            TcpState::Closing => self.enter_time_wait(now),
            TcpState::LastAck => {
                debug!("[TCP] {} -> {} CLOSED", self.local, self.remote);
                self.enter_closed();
            }
            _ => {}
        }
    }

    fn process_data(&mut self, seg: &TcpSegment) {
        if !matches!(
            self.state,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        ) {
            return;
        }
        self.ack_pending = true;

        let seq = seg.sequence_num;
        if seq_after(seq, self.recv_next) {
            trace!("[TCP] {} out-of-order seq {} (expected {})", self.local, seq, self.recv_next);
            self.store_out_of_order(seq, &seg.payload);
            return;
        }

        // Skip bytes we already have
        let skip = self.recv_next.wrapping_sub(seq) as usize;
        if skip < seg.payload.len() {
            self.accept_in_order(&seg.payload[skip..]);
        }
        self.drain_reorder();
    }

    fn accept_in_order(&mut self, data: &[u8]) {
        let n = self.rx.fill(data);
        self.recv_next = self.recv_next.wrapping_add(n as u32);
    }

    fn store_out_of_order(&mut self, seq: u32, data: &[u8]) {
        if !self.config.reorder || self.reorder.iter().any(|(s, _)| *s == seq) {
            return;
        }
        let end = seq.wrapping_sub(self.recv_next) as usize + data.len();
        if end > self.rx.available() {
            return;
        }
        let _ = self.reorder.push((seq, data.to_vec()));
    }

    fn drain_reorder(&mut self) {
        loop {
            let next = self
                .reorder
                .iter()
                .position(|(s, _)| seq_after_eq(self.recv_next, *s));
            let Some(idx) = next else { break };
            let (seq, data) = self.reorder.swap_remove(idx);
            let skip = self.recv_next.wrapping_sub(seq) as usize;
            if skip < data.len() {
                self.accept_in_order(&data[skip..]);
            }
        }
    }

    fn process_fin(&mut self, seg: &TcpSegment, now: u64) {
        let fin_seq = seg.sequence_num.wrapping_add(seg.payload.len() as u32);
        if fin_seq != self.recv_next || self.fin_received {
            // Data before the FIN is missing, or a duplicate FIN
            self.ack_pending = true;
            return;
        }

        self.recv_next = self.recv_next.wrapping_add(1);
        self.fin_received = true;
        self.ack_pending = true;

        match self.state {
            TcpState::SynReceived | TcpState::Established => {
                self.state = TcpState::CloseWait;
                debug!("[TCP] {} <- {} CLOSE_WAIT", self.local, self.remote);
            }
            TcpState::FinWait1 => {
                if self.fin_sent && self.send_unacked == self.send_next {
                    self.enter_time_wait(now);
                } else {
                    self.state = TcpState::Closing;
                }
            }
            TcpState::FinWait2 => self.enter_time_wait(now),
            _ => {}
        }
    }

    fn enter_time_wait(&mut self, now: u64) {
        self.state = TcpState::TimeWait;
        self.rto_deadline = None;
        self.time_wait_until = Some(now + self.config.time_wait_ms);
        debug!("[TCP] {} -> {} TIME_WAIT", self.local, self.remote);
    }

    /// Update RTT estimate using Jacobson/Karels algorithm
    fn update_rtt(&mut self, measured_rtt: u64) {
        if self.srtt == 0 {
            // First RTT measurement
            self.srtt = measured_rtt.max(1);
            self.rttvar = measured_rtt / 2;
        } else {
            let delta = self.srtt.abs_diff(measured_rtt);
            // RTTVAR = 3/4 * RTTVAR + 1/4 * delta
            self.rttvar = (self.rttvar * 3 + delta) / 4;
            // SRTT = 7/8 * SRTT + 1/8 * measured_rtt
            self.srtt = (self.srtt * 7 + measured_rtt) / 8;
        }
        self.rto = (self.srtt + 4 * self.rttvar).clamp(self.config.min_rto_ms, self.config.max_rto_ms);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // OUTPUT
    // ═══════════════════════════════════════════════════════════════════════════

    /// Emit whatever the windows allow: data, FIN, and a pending ACK
    pub fn poll_output(&mut self, now: u64, out: &mut Vec<TcpSegment>) {
        if matches!(self.state, TcpState::Closed | TcpState::Listen | TcpState::SynSent) {
            return;
        }

        if self.state.can_send() && !self.fin_sent {
            self.send_segments(now, out);

            if self.fin_queued && self.tx.is_empty() && !self.retransmit.is_full() {
                let seg = self.segment(self.send_next, TcpFlags::FIN | TcpFlags::ACK, Vec::new());
                self.retransmit.push(self.send_next, Vec::new(), false, true, now);
                self.send_next = self.send_next.wrapping_add(1);
                self.fin_sent = true;
                if self.rto_deadline.is_none() {
                    self.rto_deadline = Some(now + self.current_rto());
                }
                self.state = if self.state == TcpState::CloseWait {
                    TcpState::LastAck
                } else {
                    TcpState::FinWait1
                };
                debug!("[TCP] {} -> {} {:?}", self.local, self.remote, self.state);
                self.emit(seg, out);
            }
        }

        if self.ack_pending {
            let seg = self.segment(self.send_next, TcpFlags::ACK, Vec::new());
            self.emit(seg, out);
        }
    }

    fn send_segments(&mut self, now: u64, out: &mut Vec<TcpSegment>) {
        while !self.tx.is_empty() && !self.retransmit.is_full() {
            let flight = self.send_next.wrapping_sub(self.send_unacked);
            let window = self.cc.window().min(self.send_window);
            if flight >= window {
                if self.send_window == 0 && self.retransmit.is_empty() && self.persist_at.is_none() {
                    self.persist_at = Some(now + self.current_rto());
                }
                break;
            }

            let size = ((window - flight) as usize)
                .min(self.mss as usize)
                .min(self.tx.len());
            let payload = self.tx.as_slice()[..size].to_vec();
            self.tx.consume(size);

            if self.rtt_seq.is_none() {
                self.rtt_seq = Some(self.send_next);
                self.rtt_time = now;
            }

            let seg = self.segment(self.send_next, TcpFlags::ACK | TcpFlags::PSH, payload.clone());
            self.retransmit.push(self.send_next, payload, false, false, now);
            self.send_next = self.send_next.wrapping_add(size as u32);
            if self.rto_deadline.is_none() {
                self.rto_deadline = Some(now + self.current_rto());
            }
            self.emit(seg, out);
        }
    }

    /// Retransmit the first unacknowledged segment
    fn retransmit_front(&mut self, now: u64, out: &mut Vec<TcpSegment>) {
        let Some(entry) = self.retransmit.front() else {
            return;
        };

        let seg = if entry.syn {
            self.syn_segment()
        } else {
            let mut flags = TcpFlags::ACK;
            if entry.fin {
                flags |= TcpFlags::FIN;
            }
            if !entry.payload.is_empty() {
                flags |= TcpFlags::PSH;
            }
            self.segment(entry.seq, flags, entry.payload.clone())
        };

        self.retransmit.mark_retransmitted(now);
        self.retransmissions += 1;
        // Karn's algorithm: never time a retransmitted segment
        self.rtt_seq = None;
        self.emit(seg, out);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // TIMERS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Run retransmission, persist, keepalive and TIME_WAIT timers
    pub fn on_tick(&mut self, now: u64, out: &mut Vec<TcpSegment>) {
        if let Some(until) = self.time_wait_until {
            if now >= until {
                debug!("[TCP] {} -> {} CLOSED", self.local, self.remote);
                self.enter_closed();
            }
            return;
        }

        if let Some(deadline) = self.rto_deadline {
            if now >= deadline {
                self.on_retransmit_timeout(now, out);
                if self.state == TcpState::Closed {
                    return;
                }
            }
        }

        if let Some(at) = self.persist_at {
            if now >= at {
                if self.send_window == 0 && !self.tx.is_empty() {
                    trace!("[TCP] {} zero window probe", self.local);
                    let probe = self.segment(self.send_next.wrapping_sub(1), TcpFlags::ACK, Vec::new());
                    self.emit(probe, out);
                    self.persist_backoff = (self.persist_backoff + 1).min(16);
                    let interval = self
                        .rto
                        .checked_shl(self.persist_backoff)
                        .unwrap_or(u64::MAX)
                        .min(self.config.max_rto_ms);
                    self.persist_at = Some(now + interval);
                } else {
                    self.persist_at = None;
                }
            }
        }

        if let Some(at) = self.keepalive_at() {
            if now >= at {
                if self.keepalive_sent >= self.config.keepalive_probes {
                    self.fail(Error::TimedOut);
                    return;
                }
                trace!("[TCP] {} keepalive probe {}", self.local, self.keepalive_sent + 1);
                self.keepalive_sent += 1;
                let probe = self.segment(self.send_next.wrapping_sub(1), TcpFlags::ACK, Vec::new());
                self.emit(probe, out);
            }
        }
    }

    fn on_retransmit_timeout(&mut self, now: u64, out: &mut Vec<TcpSegment>) {
        let Some((seq, syn, retransmits)) = self.retransmit.front().map(|e| (e.seq, e.syn, e.retransmits)) else {
            self.rto_deadline = None;
            return;
        };

        let limit = if syn {
            self.config.syn_retries
        } else {
            self.config.max_retries
        };
        if retransmits >= limit {
            self.fail(Error::TimedOut);
            return;
        }

        let flight = self.send_next.wrapping_sub(self.send_unacked);
        self.cc.on_timeout(flight);
        self.dup_acks = 0;
        self.backoff = (self.backoff + 1).min(16);
        debug!(
            "[TCP] {} RTO expired, retransmitting seq {} (rto {} ms)",
            self.local,
            seq,
            self.current_rto()
        );
        self.retransmit_front(now, out);
        self.rto_deadline = Some(now + self.current_rto());
    }

    fn keepalive_at(&self) -> Option<u64> {
        if self.config.keepalive_ms == 0
            || self.state != TcpState::Established
            || !self.retransmit.is_empty()
        {
            return None;
        }
        Some(self.last_recv_at + self.config.keepalive_ms * (1 + self.keepalive_sent as u64))
    }

    /// Earliest time `on_tick` has something to do
    pub fn next_deadline(&self) -> Option<u64> {
        [
            self.rto_deadline,
            self.persist_at,
            self.time_wait_until,
            self.keepalive_at(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// An ACK is owed to the peer
    pub fn ack_pending(&self) -> bool {
        self.ack_pending
    }
}

impl core::fmt::Debug for Pcb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pcb")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("state", &self.state)
            .field("send_unacked", &self.send_unacked)
            .field("send_next", &self.send_next)
            .field("recv_next", &self.recv_next)
            .field("cc", &self.cc)
            .finish()
    }
}
