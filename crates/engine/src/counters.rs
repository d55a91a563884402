//! Per-key read and write counters

use blockdv_core::BlockKey;
use std::sync::atomic::{AtomicU64, Ordering};

const KEYS: usize = 128;

/// How often each generation key was validated and written.
#[derive(Debug)]
pub struct KeyCounters {
    reads: [AtomicU64; KEYS],
    writes: [AtomicU64; KEYS],
}

impl KeyCounters {
    /// All counters at zero.
    pub fn new() -> Self {
        KeyCounters {
            reads: std::array::from_fn(|_| AtomicU64::new(0)),
            writes: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Count a validated read of a block holding `key`.
    pub fn record_read(&self, key: BlockKey) {
        self.reads[key.value() as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Count a confirmed write of `key`.
    pub fn record_write(&self, key: BlockKey) {
        self.writes[key.value() as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Validated reads of `key`.
    pub fn reads(&self, key: BlockKey) -> u64 {
        self.reads[key.value() as usize].load(Ordering::Relaxed)
    }

    /// Confirmed writes of `key`.
    pub fn writes(&self, key: BlockKey) -> u64 {
        self.writes[key.value() as usize].load(Ordering::Relaxed)
    }

    /// Validated reads over all keys.
    pub fn total_reads(&self) -> u64 {
        self.reads.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// One line per key that was read or written.
    pub fn summary(&self) -> Vec<String> {
        (0..KEYS as u8)
            .map(BlockKey::new)
            .filter(|k| self.reads(*k) > 0 || self.writes(*k) > 0)
            .map(|k| format!("key {}: reads {:>10} writes {:>10}", k, self.reads(k), self.writes(k)))
            .collect()
    }
}

impl Default for KeyCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_key() {
        let counters = KeyCounters::new();
        counters.record_write(BlockKey::new(1));
        counters.record_write(BlockKey::new(1));
        counters.record_read(BlockKey::new(1));
        counters.record_read(BlockKey::new(2));

        assert_eq!(counters.writes(BlockKey::new(1)), 2);
        assert_eq!(counters.reads(BlockKey::new(2)), 1);
        assert_eq!(counters.total_reads(), 2);
        assert_eq!(
            counters.summary(),
            vec![
                "key 01: reads          1 writes          2".to_string(),
                "key 02: reads          1 writes          0".to_string(),
            ]
        );
    }
}
