//! Congestion control
//!
//! The PCB reports ACK, duplicate-ACK and timeout events; the controller
//! owns the congestion window. [`Reno`] is the RFC 5681 algorithm and the
//! default; [`Aimd`] is a plain additive-increase/multiplicative-decrease
//! controller for links where slow start overshoots.

use core::fmt;

/// Duplicate ACK threshold for fast retransmit
pub const DUP_ACK_THRESHOLD: u8 = 3;

/// Initial slow start threshold
const INITIAL_SSTHRESH: u32 = 65535;

/// Initial congestion window (RFC 5681 section 3.1)
pub fn initial_window(mss: u32) -> u32 {
    (4 * mss).min((2 * mss).max(4380))
}

/// Swappable congestion window policy
pub trait CongestionControl: fmt::Debug {
    /// Congestion window in bytes
    fn window(&self) -> u32;

    fn ssthresh(&self) -> u32;

    fn in_recovery(&self) -> bool {
        false
    }

    /// New data acknowledged. `full_ack` is set when the ACK covers the
    /// recovery point recorded on entering fast recovery.
    fn on_ack(&mut self, bytes_acked: u32, full_ack: bool);

    /// The `count`-th consecutive duplicate ACK. Returns true when the
    /// oldest unacknowledged segment must be retransmitted now.
    fn on_duplicate_ack(&mut self, count: u8, flight_size: u32) -> bool;

    /// Retransmission timer expired
    fn on_timeout(&mut self, flight_size: u32);
}

// ═══════════════════════════════════════════════════════════════════════════════
// RENO (RFC 5681)
// ═══════════════════════════════════════════════════════════════════════════════

/// Congestion Control State (RFC 5681)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionState {
    /// Exponential growth: cwnd += MSS per ACK
    SlowStart,
    /// Linear growth: cwnd += MSS^2/cwnd per ACK
    CongestionAvoidance,
    /// After fast retransmit: cwnd = ssthresh + 3*MSS
    FastRecovery,
}

#[derive(Debug, Clone)]
pub struct Reno {
    mss: u32,
    cwnd: u32,
    ssthresh: u32,
    state: CongestionState,
}

impl Reno {
    pub fn new(mss: u32) -> Self {
        Self {
            mss,
            cwnd: initial_window(mss),
            ssthresh: INITIAL_SSTHRESH,
            state: CongestionState::SlowStart,
        }
    }

    pub fn state(&self) -> CongestionState {
        self.state
    }
}

impl CongestionControl for Reno {
    fn window(&self) -> u32 {
        self.cwnd
    }

    fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    fn in_recovery(&self) -> bool {
        self.state == CongestionState::FastRecovery
    }

    fn on_ack(&mut self, bytes_acked: u32, full_ack: bool) {
        match self.state {
            CongestionState::SlowStart => {
                // Exponential growth: cwnd += min(bytes_acked, MSS)
                self.cwnd = self.cwnd.saturating_add(bytes_acked.min(self.mss));
                if self.cwnd >= self.ssthresh {
                    self.state = CongestionState::CongestionAvoidance;
                }
            }
            CongestionState::CongestionAvoidance => {
                // Approximately 1 MSS per RTT
                let inc = (self.mss * self.mss / self.cwnd.max(1)).max(1);
                self.cwnd = self.cwnd.saturating_add(inc);
            }
            CongestionState::FastRecovery => {
                if full_ack {
                    // Deflate the window
                    self.cwnd = self.ssthresh;
                    self.state = CongestionState::CongestionAvoidance;
                }
            }
        }
    }

    fn on_duplicate_ack(&mut self, count: u8, flight_size: u32) -> bool {
        if count == DUP_ACK_THRESHOLD && self.state != CongestionState::FastRecovery {
            // ssthresh = max(FlightSize / 2, 2*MSS)
            self.ssthresh = (flight_size / 2).max(2 * self.mss);
            // cwnd = ssthresh + 3*MSS (for the 3 dup ACKs)
            self.cwnd = self.ssthresh + 3 * self.mss;
            self.state = CongestionState::FastRecovery;
            return true;
        }
        if count > DUP_ACK_THRESHOLD && self.state == CongestionState::FastRecovery {
            // Inflate cwnd during fast recovery
            self.cwnd = self.cwnd.saturating_add(self.mss);
        }
        false
    }

    fn on_timeout(&mut self, flight_size: u32) {
        self.ssthresh = (flight_size / 2).max(2 * self.mss);
        // Back to slow start with one segment
        self.cwnd = self.mss;
        self.state = CongestionState::SlowStart;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AIMD
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct Aimd {
    mss: u32,
    cwnd: u32,
}

impl Aimd {
    pub fn new(mss: u32) -> Self {
        Self {
            mss,
            cwnd: initial_window(mss),
        }
    }
}

impl CongestionControl for Aimd {
    fn window(&self) -> u32 {
        self.cwnd
    }

    fn ssthresh(&self) -> u32 {
        self.cwnd
    }

    fn on_ack(&mut self, _bytes_acked: u32, _full_ack: bool) {
        let inc = (self.mss * self.mss / self.cwnd.max(1)).max(1);
        self.cwnd = self.cwnd.saturating_add(inc);
    }

    fn on_duplicate_ack(&mut self, count: u8, _flight_size: u32) -> bool {
        if count == DUP_ACK_THRESHOLD {
            self.cwnd = (self.cwnd / 2).max(2 * self.mss);
            return true;
        }
        false
    }

    fn on_timeout(&mut self, _flight_size: u32) {
        self.cwnd = (self.cwnd / 2).max(self.mss);
    }
}
