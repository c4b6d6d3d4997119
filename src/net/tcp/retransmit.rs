//! Retransmission queue
//!
//! Segments sent but not yet acknowledged, oldest first. An entry keeps its
//! sequence number and payload exactly as first sent; a retransmission
//! re-emits the same range. A cumulative ACK removes precisely the
//! acknowledged range, trimming the front entry when the ACK lands inside it.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::net::tcp::{seq_after, seq_after_eq};

/// Maximum segments in retransmit queue per connection
pub const MAX_RETRANSMIT_QUEUE: usize = 16;

/// Entry in the retransmission queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmitEntry {
    /// Starting sequence number of this segment
    pub seq: u32,
    pub payload: Vec<u8>,
    pub syn: bool,
    pub fin: bool,
    /// Time of the most recent transmission (ms)
    pub sent_at: u64,
    /// Number of times this segment has been retransmitted
    pub retransmits: u8,
}

impl RetransmitEntry {
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + self.syn as u32 + self.fin as u32
    }

    /// First sequence number after this segment
    pub fn end(&self) -> u32 {
        self.seq.wrapping_add(self.seq_len())
    }
}

/// Queue of unacknowledged segments awaiting retransmission
#[derive(Debug, Clone, Default)]
pub struct RetransmitQueue {
    entries: VecDeque<RetransmitEntry>,
}

impl RetransmitQueue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// No room for another segment; the sender must wait for ACKs
    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_RETRANSMIT_QUEUE
    }

    /// Add a segment; returns false (and keeps nothing) when full
    pub fn push(&mut self, seq: u32, payload: Vec<u8>, syn: bool, fin: bool, now: u64) -> bool {
        if self.is_full() {
            return false;
        }
        self.entries.push_back(RetransmitEntry {
            seq,
            payload,
            syn,
            fin,
            sent_at: now,
            retransmits: 0,
        });
        true
    }

    /// Remove everything before `ack_num`; returns the sequence space removed
    pub fn ack_up_to(&mut self, ack_num: u32) -> u32 {
        let mut removed = 0u32;
        while let Some(entry) = self.entries.front_mut() {
            if seq_after_eq(ack_num, entry.end()) {
                removed = removed.wrapping_add(entry.seq_len());
                self.entries.pop_front();
                continue;
            }
            if seq_after(ack_num, entry.seq) {
                let mut covered = ack_num.wrapping_sub(entry.seq);
                removed = removed.wrapping_add(covered);
                if entry.syn {
                    entry.syn = false;
                    entry.seq = entry.seq.wrapping_add(1);
                    covered -= 1;
                }
                let n = (covered as usize).min(entry.payload.len());
                entry.payload.drain(..n);
                entry.seq = entry.seq.wrapping_add(n as u32);
            }
            break;
        }
        removed
    }

    /// Get the first unacked segment for potential retransmission
    pub fn front(&self) -> Option<&RetransmitEntry> {
        self.entries.front()
    }

    /// Mark the front entry as retransmitted
    pub fn mark_retransmitted(&mut self, now: u64) {
        if let Some(entry) = self.entries.front_mut() {
            entry.sent_at = now;
            entry.retransmits = entry.retransmits.saturating_add(1);
        }
    }

    /// Sequence space in flight
    pub fn in_flight(&self) -> u32 {
        self.entries.iter().map(|e| e.seq_len()).sum()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
