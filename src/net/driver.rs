//! Network Driver Interface
//!
//! The stack's only contact with hardware: hand a frame to the device, pull
//! a frame off it, ask whether the link is up. Board drivers implement
//! [`Driver`]; the in-memory drivers below are for tests and host
//! simulations.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::error::{Error, Result};
use crate::net::ethernet::MacAddress;

/// Raw Ethernet device
pub trait Driver {
    /// Send one frame; returns the number of bytes accepted
    fn transmit(&mut self, frame: &[u8]) -> Result<usize>;

    /// Copy one received frame into `buf` and return its length.
    /// Returns 0 when nothing is pending. Never blocks.
    fn receive(&mut self, buf: &mut [u8]) -> usize;

    fn link_up(&self) -> bool {
        true
    }

    fn set_promiscuous(&mut self, _enabled: bool) {}

    /// Restrict reception to these destination MACs (broadcast always passes)
    fn set_filter(&mut self, _macs: &[MacAddress]) {}

    /// Number of frames the device may buffer on receive
    fn set_receive_queue_capacity(&mut self, _frames: usize) {}

    /// Hardware address burned into the device, if any
    fn mac_address(&self) -> Option<MacAddress> {
        None
    }
}

type FrameQueue = Arc<Mutex<VecDeque<Vec<u8>>>>;

const DEFAULT_QUEUE_CAPACITY: usize = 64;

// ═══════════════════════════════════════════════════════════════════════════════
// QUEUE DRIVER
// ═══════════════════════════════════════════════════════════════════════════════

/// Driver backed by two frame queues
///
/// A [`QueueHandle`] taken from the driver injects frames the stack will
/// receive and captures frames the stack sends.
pub struct QueueDriver {
    rx: FrameQueue,
    tx: FrameQueue,
    link: Arc<AtomicBool>,
    capacity: usize,
}

impl QueueDriver {
    pub fn new() -> Self {
        Self {
            rx: Arc::new(Mutex::new(VecDeque::new())),
            tx: Arc::new(Mutex::new(VecDeque::new())),
            link: Arc::new(AtomicBool::new(true)),
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            rx: self.rx.clone(),
            tx: self.tx.clone(),
            link: self.link.clone(),
        }
    }
}

impl Default for QueueDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for QueueDriver {
    fn transmit(&mut self, frame: &[u8]) -> Result<usize> {
        if !self.link.load(Ordering::Relaxed) {
            return Err(Error::DriverUnavailable);
        }
        self.tx.lock().push_back(frame.to_vec());
        Ok(frame.len())
    }

    fn receive(&mut self, buf: &mut [u8]) -> usize {
        let mut rx = self.rx.lock();
        while rx.len() > self.capacity {
            rx.pop_front();
        }
        match rx.pop_front() {
            Some(frame) => copy_frame(&frame, buf),
            None => 0,
        }
    }

    fn link_up(&self) -> bool {
        self.link.load(Ordering::Relaxed)
    }

    fn set_receive_queue_capacity(&mut self, frames: usize) {
        self.capacity = frames.max(1);
    }
}

/// Test side of a [`QueueDriver`]
#[derive(Clone)]
pub struct QueueHandle {
    rx: FrameQueue,
    tx: FrameQueue,
    link: Arc<AtomicBool>,
}

impl QueueHandle {
    /// Queue a frame for the stack to receive
    pub fn inject(&self, frame: Vec<u8>) {
        self.rx.lock().push_back(frame);
    }

    /// Oldest frame the stack sent
    pub fn pop_sent(&self) -> Option<Vec<u8>> {
        self.tx.lock().pop_front()
    }

    /// Every frame the stack sent since the last call
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        self.tx.lock().drain(..).collect()
    }

    pub fn pending_rx(&self) -> usize {
        self.rx.lock().len()
    }

    pub fn set_link(&self, up: bool) {
        self.link.store(up, Ordering::Relaxed);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WIRE
// ═══════════════════════════════════════════════════════════════════════════════

/// One end of a [`Wire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

#[derive(Default)]
struct WireState {
    /// Frames still to be lost, per sending side
    drop_from_a: usize,
    drop_from_b: usize,
    cut: bool,
    dropped: usize,
}

/// Two drivers connected back to back
///
/// Frames sent on one end arrive at the other. The wire can lose a given
/// number of frames in one direction, or be cut entirely.
#[derive(Clone)]
pub struct Wire {
    a_to_b: FrameQueue,
    b_to_a: FrameQueue,
    state: Arc<Mutex<WireState>>,
}

impl Wire {
    pub fn new() -> Self {
        Self {
            a_to_b: Arc::new(Mutex::new(VecDeque::new())),
            b_to_a: Arc::new(Mutex::new(VecDeque::new())),
            state: Arc::new(Mutex::new(WireState::default())),
        }
    }

    pub fn end(&self, side: Side) -> WireEnd {
        let (inbox, outbox) = match side {
            Side::A => (self.b_to_a.clone(), self.a_to_b.clone()),
            Side::B => (self.a_to_b.clone(), self.b_to_a.clone()),
        };
        WireEnd {
            side,
            inbox,
            outbox,
            state: self.state.clone(),
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Lose the next `frames` frames sent from `side`
    pub fn drop_next(&self, side: Side, frames: usize) {
        let mut state = self.state.lock();
        match side {
            Side::A => state.drop_from_a += frames,
            Side::B => state.drop_from_b += frames,
        }
    }

    /// A cut wire loses everything and reports the link down
    pub fn set_cut(&self, cut: bool) {
        self.state.lock().cut = cut;
    }

    /// Frames lost so far
    pub fn dropped(&self) -> usize {
        self.state.lock().dropped
    }

    /// Frames sent but not yet received, both directions
    pub fn in_flight(&self) -> usize {
        self.a_to_b.lock().len() + self.b_to_a.lock().len()
    }
}

impl Default for Wire {
    fn default() -> Self {
        Self::new()
    }
}

/// Driver for one end of a [`Wire`]
pub struct WireEnd {
    side: Side,
    inbox: FrameQueue,
    outbox: FrameQueue,
    state: Arc<Mutex<WireState>>,
    capacity: usize,
}

impl Driver for WireEnd {
    fn transmit(&mut self, frame: &[u8]) -> Result<usize> {
        {
            let mut state = self.state.lock();
            if state.cut {
                return Err(Error::DriverUnavailable);
            }
            let pending = match self.side {
                Side::A => &mut state.drop_from_a,
                Side::B => &mut state.drop_from_b,
            };
            if *pending > 0 {
                *pending -= 1;
                state.dropped += 1;
                // Lost in transit; the sender cannot tell
                return Ok(frame.len());
            }
        }

        let mut outbox = self.outbox.lock();
        if outbox.len() >= self.capacity {
            self.state.lock().dropped += 1;
            return Ok(frame.len());
        }
        outbox.push_back(frame.to_vec());
        Ok(frame.len())
    }

    fn receive(&mut self, buf: &mut [u8]) -> usize {
        match self.inbox.lock().pop_front() {
            Some(frame) => copy_frame(&frame, buf),
            None => 0,
        }
    }

    fn link_up(&self) -> bool {
        !self.state.lock().cut
    }

    fn set_receive_queue_capacity(&mut self, frames: usize) {
        // Applies to the queue feeding the peer, which is where frames pile up
        self.capacity = frames.max(1);
    }
}

fn copy_frame(frame: &[u8], buf: &mut [u8]) -> usize {
    let n = frame.len().min(buf.len());
    buf[..n].copy_from_slice(&frame[..n]);
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_queue_driver_inject_and_capture() {
        let mut driver = QueueDriver::new();
        let handle = driver.handle();

        handle.inject(vec![1, 2, 3]);
        let mut buf = [0u8; 64];
        assert_eq!(driver.receive(&mut buf), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(driver.receive(&mut buf), 0);

        driver.transmit(&[9, 9]).unwrap();
        assert_eq!(handle.take_sent(), vec![vec![9, 9]]);
    }

    #[test]
    fn test_queue_driver_link_down() {
        let mut driver = QueueDriver::new();
        driver.handle().set_link(false);
        assert!(!driver.link_up());
        assert_eq!(driver.transmit(&[0]), Err(Error::DriverUnavailable));
    }

    #[test]
    fn test_wire_delivers_both_ways() {
        let wire = Wire::new();
        let mut a = wire.end(Side::A);
        let mut b = wire.end(Side::B);
        let mut buf = [0u8; 16];

        a.transmit(&[1]).unwrap();
        b.transmit(&[2]).unwrap();
        assert_eq!(wire.in_flight(), 2);
        assert_eq!(b.receive(&mut buf), 1);
        assert_eq!(buf[0], 1);
        assert_eq!(a.receive(&mut buf), 1);
        assert_eq!(buf[0], 2);
    }

    #[test]
    fn test_wire_loss_injection() {
        let wire = Wire::new();
        let mut a = wire.end(Side::A);
        let mut b = wire.end(Side::B);
        let mut buf = [0u8; 16];

        wire.drop_next(Side::A, 1);
        a.transmit(&[1]).unwrap();
        a.transmit(&[2]).unwrap();
        assert_eq!(wire.dropped(), 1);
        assert_eq!(b.receive(&mut buf), 1);
        assert_eq!(buf[0], 2);

        wire.set_cut(true);
        assert!(!a.link_up());
        assert!(a.transmit(&[3]).is_err());
    }
}
