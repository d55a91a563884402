//! Bad-block thresholds
//!
//! A device or file stays in use while its corruption is sparse. Once more
//! than `max_bad_percent` of its bytes or more than `max_bad_blocks` of its
//! blocks have been found bad, it is excluded from further I/O.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::warn;

/// Tracks bad blocks of one device or file.
#[derive(Debug)]
pub struct ExclusionTracker {
    name: String,
    size_bytes: u64,
    max_bad_blocks: u64,
    max_bad_percent: f64,
    bad_blocks: AtomicU64,
    bad_bytes: AtomicU64,
    excluded: AtomicBool,
}

impl ExclusionTracker {
    /// Tracker for `name` of `size_bytes`.
    pub fn new(name: &str, size_bytes: u64, max_bad_blocks: u64, max_bad_percent: f64) -> Self {
        ExclusionTracker {
            name: name.to_string(),
            size_bytes,
            max_bad_blocks,
            max_bad_percent,
            bad_blocks: AtomicU64::new(0),
            bad_bytes: AtomicU64::new(0),
            excluded: AtomicBool::new(false),
        }
    }

    /// Record one bad block of `bytes`.
    ///
    /// Returns true only for the call that crossed a threshold.
    pub fn record_bad_block(&self, bytes: u64) -> bool {
        let blocks = self.bad_blocks.fetch_add(1, Ordering::AcqRel) + 1;
        let total = self.bad_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;

        let percent = if self.size_bytes == 0 {
            100.0
        } else {
            total as f64 * 100.0 / self.size_bytes as f64
        };
        if blocks <= self.max_bad_blocks && percent <= self.max_bad_percent {
            return false;
        }
        if self.excluded.swap(true, Ordering::AcqRel) {
            return false;
        }
        warn!(
            device = %self.name,
            bad_blocks = blocks,
            bad_bytes = total,
            percent,
            "too many bad blocks; excluded from further use"
        );
        true
    }

    /// True once a threshold was crossed.
    pub fn is_excluded(&self) -> bool {
        self.excluded.load(Ordering::Acquire)
    }

    /// Bad blocks recorded so far.
    pub fn bad_blocks(&self) -> u64 {
        self.bad_blocks.load(Ordering::Acquire)
    }

    /// Bad bytes recorded so far.
    pub fn bad_bytes(&self) -> u64 {
        self.bad_bytes.load(Ordering::Acquire)
    }
}
