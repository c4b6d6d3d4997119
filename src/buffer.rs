//! Growable I/O Buffer
//!
//! Byte queue backing a connection's receive and send sides. Appends go to
//! the tail, consumers remove from the head. Capacity grows by doubling in
//! [`IO_GRANULE`] steps and never passes `max_capacity`, so a slow or hostile
//! peer cannot make a connection allocate without bound.
//!
//! Slices returned by [`Buffer::as_slice`] borrow the buffer, so the borrow
//! checker already forbids holding one across an `append`. Parsers that need
//! to remember a position keep an offset, not a reference.

use alloc::vec::Vec;

use crate::error::{Error, Result};

/// Allocation granule; capacities are rounded up to a multiple of this
pub const IO_GRANULE: usize = 512;

/// Default ceiling for connection buffers
pub const DEFAULT_MAX_CAPACITY: usize = 64 * 1024;

/// Bounded FIFO byte store
#[derive(Debug, Clone)]
pub struct Buffer {
    data: Vec<u8>,
    capacity: usize,
    max_capacity: usize,
}

impl Buffer {
    /// Create an empty buffer that may grow up to `max_capacity` bytes
    pub const fn new(max_capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            capacity: 0,
            max_capacity,
        }
    }

    /// Create a buffer with `initial` bytes preallocated (clamped to the ceiling)
    pub fn with_capacity(initial: usize, max_capacity: usize) -> Self {
        let capacity = initial.min(max_capacity);
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            max_capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes currently allocated for this buffer
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Bytes that can still be appended before hitting the ceiling
    pub fn available(&self) -> usize {
        self.max_capacity - self.data.len()
    }

    /// Stored bytes, oldest first
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Append all of `bytes`, or nothing
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.available() {
            return Err(Error::OutOfSpace {
                requested: bytes.len(),
                available: self.available(),
            });
        }
        self.grow_for(bytes.len());
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Append the longest prefix of `bytes` that fits; returns its length
    pub fn fill(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.available());
        if n > 0 {
            self.grow_for(n);
            self.data.extend_from_slice(&bytes[..n]);
        }
        n
    }

    /// Remove up to `n` bytes from the head; returns how many were removed
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.data.len());
        self.data.drain(..n);
        n
    }

    /// Forget the contents but keep the allocation
    pub fn reset(&mut self) {
        self.data.clear();
    }

    /// Release capacity beyond the current length
    pub fn trim(&mut self) {
        self.data.shrink_to_fit();
        self.capacity = self.data.len();
    }

    fn grow_for(&mut self, additional: usize) {
        let needed = self.data.len() + additional;
        if needed <= self.capacity {
            return;
        }
        let doubled = self.capacity.saturating_mul(2).max(needed);
        let rounded = doubled.div_ceil(IO_GRANULE) * IO_GRANULE;
        let new_capacity = rounded.min(self.max_capacity);
        self.data.reserve_exact(new_capacity - self.data.len());
        self.capacity = new_capacity;
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CAPACITY)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_consume_fifo() {
        let mut buf = Buffer::new(1024);
        buf.append(b"hello ").unwrap();
        buf.append(b"world").unwrap();
        assert_eq!(buf.as_slice(), b"hello world");

        assert_eq!(buf.consume(6), 6);
        assert_eq!(buf.as_slice(), b"world");

        assert_eq!(buf.consume(100), 5);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_backpressure_preserves_contents() {
        let mut buf = Buffer::new(16);
        let payload: Vec<u8> = (0u8..32).collect();

        for (i, byte) in payload.iter().enumerate() {
            let res = buf.append(core::slice::from_ref(byte));
            if i < 16 {
                assert!(res.is_ok());
            } else {
                assert_eq!(res, Err(Error::OutOfSpace { requested: 1, available: 0 }));
            }
        }
        assert_eq!(buf.as_slice(), &payload[..16]);
    }

    #[test]
    fn test_append_is_all_or_nothing() {
        let mut buf = Buffer::new(16);
        buf.append(b"0123456789").unwrap();
        assert!(buf.append(b"abcdefgh").is_err());
        assert_eq!(buf.as_slice(), b"0123456789");
    }

    #[test]
    fn test_fill_takes_prefix() {
        let mut buf = Buffer::new(8);
        assert_eq!(buf.fill(b"abcdefghijkl"), 8);
        assert_eq!(buf.as_slice(), b"abcdefgh");
        assert_eq!(buf.fill(b"x"), 0);
    }

    #[test]
    fn test_capacity_invariant() {
        let mut buf = Buffer::new(3000);
        let chunk = [0xAAu8; 100];
        for _ in 0..30 {
            buf.append(&chunk).unwrap();
            assert!(buf.len() <= buf.capacity());
            assert!(buf.capacity() <= buf.max_capacity());
            if buf.len() > 1500 {
                buf.consume(700);
            }
        }
    }

    #[test]
    fn test_growth_is_granular() {
        let mut buf = Buffer::new(DEFAULT_MAX_CAPACITY);
        buf.append(b"x").unwrap();
        assert_eq!(buf.capacity(), IO_GRANULE);
        buf.append(&[0u8; IO_GRANULE]).unwrap();
        assert_eq!(buf.capacity(), 2 * IO_GRANULE);
    }

    #[test]
    fn test_reset_keeps_allocation_trim_releases() {
        let mut buf = Buffer::new(4096);
        buf.append(&[1u8; 2000]).unwrap();
        let cap = buf.capacity();
        buf.reset();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.capacity(), cap);

        buf.append(b"abc").unwrap();
        buf.trim();
        assert_eq!(buf.capacity(), 3);
        assert_eq!(buf.as_slice(), b"abc");
    }
}
