//! Utility functions and helpers

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe monotonic counter.
///
/// Used for frame alloc ids and transaction sequence numbers. The counter
/// can be raised past values discovered on disk with [`IdGenerator::observe`].
#[derive(Debug)]
pub struct IdGenerator {
    counter: AtomicU64,
}

impl IdGenerator {
    pub fn new(start: u64) -> Self {
        Self {
            counter: AtomicU64::new(start),
        }
    }

    /// Return the next id; ids are strictly increasing.
    pub fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Make sure future ids are greater than `seen`.
    pub fn observe(&self, seen: u64) {
        self.counter.fetch_max(seen + 1, Ordering::SeqCst);
    }
}

/// Compute CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Verify CRC32 checksum
pub fn verify_crc32(data: &[u8], expected: u32) -> bool {
    crc32(data) == expected
}

/// Round `value` up to a multiple of `unit`.
#[inline]
pub const fn round_up(value: u64, unit: u64) -> u64 {
    if unit == 0 {
        value
    } else {
        value.div_ceil(unit) * unit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
        assert_eq!(round_up(17, 0), 17);
    }

    #[test]
    fn test_crc32() {
        let data = b"hello world";
        let checksum = crc32(data);
        assert!(verify_crc32(data, checksum));
        assert!(!verify_crc32(data, checksum.wrapping_add(1)));
    }

    #[test]
    fn test_id_generator() {
        let gen = IdGenerator::new(1);
        let id1 = gen.next_id();
        let id2 = gen.next_id();
        assert!(id2 > id1);

        gen.observe(100);
        assert_eq!(gen.next_id(), 101);
        gen.observe(5);
        assert_eq!(gen.next_id(), 102);
    }
}
