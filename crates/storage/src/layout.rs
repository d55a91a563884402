//! Segment arithmetic
//!
//! A block index maps to a segment by its high bits and to an offset inside
//! the segment by its low bits:
//!
//! ```text
//! segment = block >> shift
//! offset  = block & (capacity - 1)
//! ```

use blockdv_core::config::{DEFAULT_SEGMENT_SHIFT, MAX_SEGMENT_SHIFT, MIN_SEGMENT_SHIFT};
use blockdv_core::{DvError, DvResult};
use std::path::{Path, PathBuf};

/// Power-of-two segmentation of a key map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    shift: u32,
}

impl SegmentLayout {
    /// Layout with `1 << shift` blocks per segment.
    pub fn new(shift: u32) -> DvResult<Self> {
        if !(MIN_SEGMENT_SHIFT..=MAX_SEGMENT_SHIFT).contains(&shift) {
            return Err(DvError::Config(format!(
                "segment shift {} outside {}..={}",
                shift, MIN_SEGMENT_SHIFT, MAX_SEGMENT_SHIFT
            )));
        }
        Ok(SegmentLayout { shift })
    }

    /// log2 of the segment capacity.
    pub fn shift(&self) -> u32 {
        self.shift
    }

    /// Blocks per segment.
    pub fn capacity(&self) -> u64 {
        1u64 << self.shift
    }

    /// Mask selecting the in-segment offset.
    pub fn mask(&self) -> u64 {
        self.capacity() - 1
    }

    /// `(segment, offset)` of a block.
    pub fn locate(&self, block: u64) -> (usize, usize) {
        ((block >> self.shift) as usize, (block & self.mask()) as usize)
    }

    /// Segments needed for `total_blocks`, rounding up.
    pub fn segment_count(&self, total_blocks: u64) -> usize {
        ((total_blocks + self.capacity() - 1) >> self.shift) as usize
    }

    /// Length in bytes of segment `index`; only the last one may be short.
    pub fn segment_len(&self, total_blocks: u64, index: usize) -> usize {
        let start = (index as u64) << self.shift;
        let remaining = total_blocks.saturating_sub(start);
        remaining.min(self.capacity()) as usize
    }
}

impl Default for SegmentLayout {
    fn default() -> Self {
        SegmentLayout {
            shift: DEFAULT_SEGMENT_SHIFT,
        }
    }
}

/// Path of segment `seq` of a device's key map: `<dir>/<device>.keymap.<seq>`.
///
/// The device name is escaped into one path component: `_` becomes `__`,
/// `/` becomes `_s` and `\\` becomes `_b`, so distinct names never share
/// files.
pub fn segment_path(dir: &Path, device: &str, seq: usize) -> PathBuf {
    let mut escaped = String::with_capacity(device.len() + 4);
    for c in device.chars() {
        match c {
            '_' => escaped.push_str("__"),
            '/' => escaped.push_str("_s"),
            '\\' => escaped.push_str("_b"),
            c => escaped.push(c),
        }
    }
    dir.join(format!("{}.keymap.{}", escaped, seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_capacity_locate() {
        let layout = SegmentLayout::default();
        assert_eq!(layout.capacity(), 1 << 30);
        assert_eq!(layout.locate((1 << 30) + 5), (1, 5));
        assert_eq!(layout.locate((1 << 30) - 1), (0, (1 << 30) - 1));
    }

    #[test]
    fn test_segment_count_rounds_up() {
        let layout = SegmentLayout::new(4).unwrap();
        assert_eq!(layout.segment_count(1), 1);
        assert_eq!(layout.segment_count(16), 1);
        assert_eq!(layout.segment_count(17), 2);
        assert_eq!(layout.segment_len(17, 0), 16);
        assert_eq!(layout.segment_len(17, 1), 1);
    }

    #[test]
    fn test_rejects_bad_shift() {
        assert!(SegmentLayout::new(0).is_err());
        assert!(SegmentLayout::new(64).is_err());
    }

    #[test]
    fn test_segment_path_escapes_device() {
        let path = segment_path(Path::new("/maps"), "/dev/sdb", 2);
        assert_eq!(path, PathBuf::from("/maps/_sdev_ssdb.keymap.2"));
        assert_eq!(
            segment_path(Path::new("/maps"), "sd_1", 0),
            PathBuf::from("/maps/sd__1.keymap.0")
        );
    }

    #[test]
    fn test_segment_path_keeps_names_apart() {
        let dir = Path::new("/maps");
        let names = ["sd/1", "sd_1", "sd_s1", "sd\\1", "/sd1", "sd1", "sd__1"];
        let paths: std::collections::HashSet<PathBuf> =
            names.iter().map(|n| segment_path(dir, n, 0)).collect();
        assert_eq!(paths.len(), names.len());
    }

    proptest! {
        #[test]
        fn prop_locate_reassembles(block in 0u64..(1 << 40), shift in 3u32..=30) {
            let layout = SegmentLayout::new(shift).unwrap();
            let (seg, off) = layout.locate(block);
            prop_assert_eq!(((seg as u64) << shift) + off as u64, block);
            prop_assert!((off as u64) < layout.capacity());
        }

        #[test]
        fn prop_segment_lengths_sum_to_total(total in 1u64..10_000, shift in 3u32..=12) {
            let layout = SegmentLayout::new(shift).unwrap();
            let sum: u64 = (0..layout.segment_count(total))
                .map(|i| layout.segment_len(total, i) as u64)
                .sum();
            prop_assert_eq!(sum, total);
        }
    }
}
