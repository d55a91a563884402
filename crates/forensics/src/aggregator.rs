//! Corruption aggregator
//!
//! Collects bad sectors into pending data blocks and emits each block's
//! report exactly once.
//!
//! # Design
//!
//! - Pending blocks keyed by (device id, absolute offset)
//! - One aggregator-wide lock: contention only happens on real corruption
//! - A block is removed from the pending map in the same critical section
//!   that renders and writes its report, so concurrent detections of the
//!   same block produce one report
//! - The preamble (terminology and byte layout) is written once, before the
//!   first report

use crate::bad_sector::BadSector;
use crate::data_block::BadDataBlock;
use blockdv_core::{CorruptionFlags, DvResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::{error, warn};

/// Per-device corruption counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    /// Data blocks reported
    pub data_blocks: u64,
    /// Key blocks reported
    pub key_blocks: u64,
    /// Bad sectors recorded
    pub bad_sectors: u64,
}

impl DeviceCounters {
    /// True once more than `max_blocks` data blocks were reported.
    pub fn exceeds(&self, max_blocks: u64) -> bool {
        self.data_blocks > max_blocks
    }
}

struct Inner {
    pending: FxHashMap<(String, u64), BadDataBlock>,
    counters: FxHashMap<String, DeviceCounters>,
    first_corruption: Option<DateTime<Utc>>,
    preamble_written: bool,
    sink: Box<dyn Write + Send>,
}

/// Groups bad sectors into data blocks and serializes their reports.
pub struct CorruptionAggregator {
    inner: Mutex<Inner>,
}

impl CorruptionAggregator {
    /// Aggregator writing report text to `sink`.
    pub fn new(sink: impl Write + Send + 'static) -> Self {
        CorruptionAggregator {
            inner: Mutex::new(Inner {
                pending: FxHashMap::default(),
                counters: FxHashMap::default(),
                first_corruption: None,
                preamble_written: false,
                sink: Box::new(sink),
            }),
        }
    }

    /// Aggregator writing to standard error.
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    /// Route a bad sector into its pending data block.
    pub fn add_sector(&self, sector: BadSector) -> DvResult<()> {
        let mut inner = self.inner.lock();
        let device = sector.site.owner.device_id().to_string();
        let offset = sector.site.owner.absolute(sector.site.data_lba);

        inner.first_corruption.get_or_insert_with(Utc::now);
        let block = inner
            .pending
            .entry((device.clone(), offset))
            .or_insert_with(|| BadDataBlock::for_sector(&sector));
        block.add(sector)?;
        inner.counters.entry(device).or_default().bad_sectors += 1;
        Ok(())
    }

    /// True while a block is waiting to be reported.
    pub fn is_pending(&self, device: &str, offset: u64) -> bool {
        self.inner
            .lock()
            .pending
            .contains_key(&(device.to_string(), offset))
    }

    /// Number of blocks waiting to be reported.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Remove a pending block without reporting it.
    pub fn take(&self, device: &str, offset: u64) -> Option<BadDataBlock> {
        self.inner.lock().pending.remove(&(device.to_string(), offset))
    }

    /// Report a block already removed from the pending map.
    pub fn report_block(&self, block: &BadDataBlock, complete_scan: bool) -> DvResult<String> {
        let mut inner = self.inner.lock();
        emit(&mut inner, block, complete_scan)
    }

    /// Remove and report the pending block at `offset`.
    ///
    /// Returns `None` when no such block is pending, which is the case for
    /// every call after the first one for the same block.
    pub fn report(
        &self,
        device: &str,
        offset: u64,
        complete_scan: bool,
    ) -> DvResult<Option<String>> {
        let mut inner = self.inner.lock();
        let block = match inner.pending.remove(&(device.to_string(), offset)) {
            Some(block) => block,
            None => return Ok(None),
        };
        emit(&mut inner, &block, complete_scan).map(Some)
    }

    /// Report every pending block and flush the sink.
    ///
    /// Called on the abort path so no forensic detail is lost.
    pub fn flush_pending(&self) -> DvResult<usize> {
        let mut inner = self.inner.lock();
        let mut keys: Vec<(String, u64)> = inner.pending.keys().cloned().collect();
        keys.sort();
        let mut reported = 0;
        for key in keys {
            if let Some(block) = inner.pending.remove(&key) {
                emit(&mut inner, &block, false)?;
                reported += 1;
            }
        }
        inner.sink.flush()?;
        if reported > 0 {
            error!(blocks = reported, "flushed unreported corrupted blocks");
        }
        Ok(reported)
    }

    /// Flush the report sink.
    pub fn flush(&self) -> DvResult<()> {
        self.inner.lock().sink.flush()?;
        Ok(())
    }

    /// Counters for one device.
    pub fn counters(&self, device: &str) -> DeviceCounters {
        self.inner
            .lock()
            .counters
            .get(device)
            .copied()
            .unwrap_or_default()
    }
}

impl Default for CorruptionAggregator {
    fn default() -> Self {
        Self::stderr()
    }
}

impl std::fmt::Debug for CorruptionAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorruptionAggregator")
            .field("pending", &self.pending_count())
            .finish()
    }
}

fn emit(inner: &mut Inner, block: &BadDataBlock, complete_scan: bool) -> DvResult<String> {
    let mut text = String::new();
    if !inner.preamble_written {
        let first = inner.first_corruption.unwrap_or_else(Utc::now);
        text.push_str(&preamble(first));
        inner.preamble_written = true;
    }
    text.push_str(&block.render(complete_scan));
    text.push('\n');

    inner.sink.write_all(text.as_bytes())?;

    let device = block.owner().device_id().to_string();
    let counters = inner.counters.entry(device.clone()).or_default();
    counters.data_blocks += 1;
    counters.key_blocks += block.corrupted_key_blocks().count() as u64;

    warn!(
        device = %device,
        lba = block.lba(),
        xfersize = block.data_block_size(),
        bad_sectors = block.bad_sector_count(),
        "corrupted data block reported"
    );
    Ok(text)
}

fn preamble(first: DateTime<Utc>) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Time of first corruption: {}\n\n",
        first.format("%Y-%m-%d %H:%M:%S%.3f UTC")
    ));
    out.push_str("Terminology:\n");
    out.push_str("- Data block: the bytes moved by one read or write.\n");
    out.push_str("- Key block: the unit tracked by one generation key; a data block holds one or more key blocks.\n");
    out.push_str("- Key: generation key 1-126 stored in every sector and advanced on every rewrite.\n");
    out.push_str("- Sector: 512 bytes, the smallest unit reported as bad.\n\n");
    out.push_str("Sector layout:\n");
    for (range, field) in [
        ("0x00-0x07", "byte offset (lba) of the sector"),
        ("0x08-0x0f", "write timestamp, ms since epoch"),
        ("0x10", "generation key"),
        ("0x11", "timestamp checksum"),
        ("0x12-0x13", "reserved, zero"),
        ("0x14-0x1b", "device name, space padded"),
        ("0x1c-0x1f", "writer process id"),
        ("0x20-0x1ff", "payload derived from lba, key and device name"),
    ] {
        out.push_str(&format!("  {:<11}{}\n", range, field));
    }
    out.push_str("\nCorruption flags:\n");
    for flag in CorruptionFlags::all().iter() {
        out.push_str(&format!("  {}\n", flag));
    }
    out.push('\n');
    out
}

/// Clonable in-memory report sink.
#[derive(Debug, Clone, Default)]
pub struct ReportBuffer(Arc<Mutex<Vec<u8>>>);

impl ReportBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for ReportBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
