//! Key store handle
//!
//! # Design
//!
//! - One atomic byte per block, `(busy << 7) | key`
//! - Segments of `1 << shift` blocks, each a locked memory-mapped file
//! - `get`/`set` are lock-free; workers only ever touch disjoint blocks
//! - The busy sweep runs single-threaded at startup, before any worker I/O
//!
//! The store is owned by a device or file anchor and passed by reference;
//! there is no process-wide registry of key maps.

use crate::layout::{segment_path, SegmentLayout};
use crate::segment::Segment;
use blockdv_core::{BlockKey, DvError, DvResult, KeyEntry};
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, info};

/// Options for [`KeyStore::open`].
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Reuse persisted segments instead of zeroing them.
    pub reuse: bool,
    /// Segment geometry.
    pub layout: SegmentLayout,
}

impl StoreOptions {
    /// Fresh store with the default 2^30-block segments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuse persisted segments.
    pub fn reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    /// Use a different segment geometry.
    pub fn layout(mut self, layout: SegmentLayout) -> Self {
        self.layout = layout;
        self
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            reuse: false,
            layout: SegmentLayout::default(),
        }
    }
}

/// Counts gathered by a full scan of the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepCounts {
    /// Blocks holding the error key
    pub bad: u64,
    /// Blocks whose busy flag was set
    pub busy: u64,
    /// Blocks with a written, non-error key
    pub known: u64,
}

impl SweepCounts {
    fn tally(&mut self, key: BlockKey) {
        if key.is_error() {
            self.bad += 1;
        } else if key.is_written() {
            self.known += 1;
        }
    }
}

/// Outcome of [`KeyStore::get_key_and_set_busy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyAcquire {
    /// Busy flag was set; carries the key before the operation
    Acquired(BlockKey),
    /// Another operation holds the block
    AlreadyBusy(BlockKey),
    /// Block is permanently excluded
    InError,
}

/// Persistent per-block key array for one device or file anchor.
pub struct KeyStore {
    device: String,
    layout: SegmentLayout,
    total_blocks: u64,
    segments: Vec<Segment>,
}

impl KeyStore {
    /// Open the key map of `device` under `dir`.
    ///
    /// Without `reuse` every segment is created zero-filled, so every block
    /// reads back as never written and not busy. With `reuse` the persisted
    /// segments must exist and match the requested size exactly.
    ///
    /// # Errors
    ///
    /// - `FatalRun` when a reused segment is missing or has the wrong size,
    ///   or when a segment is locked by another run
    /// - `Config` when `total_blocks` is zero
    pub fn open(
        dir: impl AsRef<Path>,
        device: &str,
        total_blocks: u64,
        options: StoreOptions,
    ) -> DvResult<Self> {
        let dir = dir.as_ref();
        if total_blocks == 0 {
            return Err(DvError::Config(format!(
                "key map for {} must track at least one block",
                device
            )));
        }
        let layout = options.layout;
        let count = layout.segment_count(total_blocks);

        if !options.reuse {
            std::fs::create_dir_all(dir)?;
        }

        let mut segments = Vec::with_capacity(count);
        for seq in 0..count {
            let path = segment_path(dir, device, seq);
            let len = layout.segment_len(total_blocks, seq);
            let segment = if options.reuse {
                Segment::reuse(device, &path, len)?
            } else {
                Segment::create(device, &path, len)?
            };
            debug!(device = %device, path = %segment.path().display(), len, "mapped key map segment");
            segments.push(segment);
        }

        if !options.reuse {
            remove_stale_segments(dir, device, count)?;
        }

        info!(
            device = %device,
            total_blocks,
            segments = count,
            reuse = options.reuse,
            "opened key map"
        );

        Ok(KeyStore {
            device: device.to_string(),
            layout,
            total_blocks,
            segments,
        })
    }

    /// Device or anchor this store belongs to.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Number of tracked blocks.
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Segment geometry.
    pub fn layout(&self) -> SegmentLayout {
        self.layout
    }

    /// Number of backing segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn cell(&self, block: u64) -> DvResult<&AtomicU8> {
        if block >= self.total_blocks {
            return Err(DvError::consistency(format!(
                "block {} beyond the {} blocks tracked for {}",
                block, self.total_blocks, self.device
            )));
        }
        let (seg, off) = self.layout.locate(block);
        Ok(&self.segments[seg].cells()[off])
    }

    /// Key and busy flag of a block.
    pub fn get(&self, block: u64) -> DvResult<KeyEntry> {
        Ok(KeyEntry::from_byte(self.cell(block)?.load(Ordering::Acquire)))
    }

    /// Overwrite a block's key and busy flag.
    pub fn set(&self, block: u64, key: BlockKey, busy: bool) -> DvResult<()> {
        self.cell(block)?
            .store(KeyEntry::new(key, busy).to_byte(), Ordering::Release);
        Ok(())
    }

    /// Atomically read a block's key and mark it busy.
    ///
    /// Nothing changes when the block is already busy or in error.
    pub fn get_key_and_set_busy(&self, block: u64) -> DvResult<BusyAcquire> {
        let cell = self.cell(block)?;
        let mut current = cell.load(Ordering::Acquire);
        loop {
            let entry = KeyEntry::from_byte(current);
            if entry.key.is_error() {
                return Ok(BusyAcquire::InError);
            }
            if entry.busy {
                return Ok(BusyAcquire::AlreadyBusy(entry.key));
            }
            let busy = KeyEntry::new(entry.key, true).to_byte();
            match cell.compare_exchange_weak(current, busy, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(BusyAcquire::Acquired(entry.key)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Record a confirmed write: store `key` and clear busy.
    ///
    /// A block marked in error while the write was in flight stays in error.
    ///
    /// # Errors
    ///
    /// `ConsistencyViolation` if the block was not busy.
    pub fn confirm(&self, block: u64, key: BlockKey) -> DvResult<()> {
        let current = self.get(block)?;
        if current.key.is_error() {
            return self.set(block, BlockKey::ERROR, false);
        }
        if !current.busy {
            return Err(DvError::consistency(format!(
                "confirming write of key {} on block {} of {}, which is not busy",
                key, block, self.device
            )));
        }
        self.set(block, key, false)
    }

    /// Clear busy without changing the key.
    ///
    /// # Errors
    ///
    /// `ConsistencyViolation` if the block was not busy. A block marked in
    /// error while busy is exempt.
    pub fn release(&self, block: u64) -> DvResult<()> {
        let current = self.get(block)?;
        if !current.busy && !current.key.is_error() {
            return Err(DvError::consistency(format!(
                "releasing block {} of {}, which is not busy",
                block, self.device
            )));
        }
        self.set(block, current.key, false)
    }

    /// Exclude a block permanently.
    pub fn mark_error(&self, block: u64) -> DvResult<()> {
        self.set(block, BlockKey::ERROR, false)
    }

    /// True if any block in `range` is in error.
    pub fn any_bad_blocks(&self, range: Range<u64>) -> DvResult<bool> {
        for block in range {
            if self.get(block)?.key.is_error() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// True if any block in `range` holds a written, non-error key.
    pub fn any_valid_blocks(&self, range: Range<u64>) -> DvResult<bool> {
        for block in range {
            if self.get(block)?.key.is_written() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn blocks(&self) -> impl Iterator<Item = (u64, &AtomicU8)> + '_ {
        let shift = self.layout.shift();
        self.segments.iter().enumerate().flat_map(move |(seq, seg)| {
            let base = (seq as u64) << shift;
            seg.cells()
                .iter()
                .enumerate()
                .map(move |(off, cell)| (base + off as u64, cell))
        })
    }

    /// Read-only scan with the same counting rules as the sweep.
    pub fn census(&self) -> SweepCounts {
        let mut counts = SweepCounts::default();
        for (_, cell) in self.blocks() {
            let entry = KeyEntry::from_byte(cell.load(Ordering::Acquire));
            if entry.busy {
                counts.busy += 1;
            }
            counts.tally(entry.key);
        }
        counts
    }

    /// Busy blocks with their persisted keys, in block order.
    pub fn busy_blocks(&self) -> Vec<(u64, BlockKey)> {
        self.blocks()
            .filter_map(|(block, cell)| {
                let entry = KeyEntry::from_byte(cell.load(Ordering::Acquire));
                entry.busy.then_some((block, entry.key))
            })
            .collect()
    }

    /// Clear every busy flag, keeping keys as persisted.
    pub fn sweep_clear_busy(&self) -> DvResult<SweepCounts> {
        self.sweep_clear_busy_with(|_, key| Ok(key))
    }

    /// Clear every busy flag, handing each busy block to `resolve` first.
    ///
    /// `resolve` receives the block and its persisted key and returns the key
    /// to store. Counts reflect the stored keys; `busy` counts the blocks
    /// that were busy before the sweep. The first error from `resolve` stops
    /// the sweep and is returned; blocks not yet visited stay busy.
    pub fn sweep_clear_busy_with<F>(&self, mut resolve: F) -> DvResult<SweepCounts>
    where
        F: FnMut(u64, BlockKey) -> DvResult<BlockKey>,
    {
        let mut counts = SweepCounts::default();
        for (block, cell) in self.blocks() {
            let entry = KeyEntry::from_byte(cell.load(Ordering::Acquire));
            let key = if entry.busy {
                counts.busy += 1;
                let key = resolve(block, entry.key)?;
                cell.store(KeyEntry::new(key, false).to_byte(), Ordering::Release);
                key
            } else {
                entry.key
            };
            counts.tally(key);
        }
        info!(
            device = %self.device,
            bad = counts.bad,
            busy = counts.busy,
            known = counts.known,
            "swept key map"
        );
        Ok(counts)
    }

    /// Write all segments back to their files.
    pub fn flush(&self) -> DvResult<()> {
        for segment in &self.segments {
            segment.flush()?;
        }
        Ok(())
    }

    /// Flush and release the segment files.
    pub fn close(self) -> DvResult<()> {
        self.flush()?;
        let bytes: usize = self.segments.iter().map(Segment::len).sum();
        info!(device = %self.device, bytes, "closed key map");
        Ok(())
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("device", &self.device)
            .field("total_blocks", &self.total_blocks)
            .field("segments", &self.segments.len())
            .finish()
    }
}

/// Remove segments beyond `count` left by an earlier, larger run.
fn remove_stale_segments(dir: &Path, device: &str, count: usize) -> DvResult<()> {
    let mut seq = count;
    loop {
        let path = segment_path(dir, device, seq);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(device = %device, path = %path.display(), "removed stale segment"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        seq += 1;
    }
}
