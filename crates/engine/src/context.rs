//! Key map state shared by devices and file anchors
//!
//! A `KeyContext` owns one key map and everything needed to validate I/O
//! against it. The I/O itself goes to a `Target`: the whole device, or one
//! file of an anchor. Lbas handed to the context are relative to the target;
//! `Target::base` places them in the key map.

use crate::counters::KeyCounters;
use crate::exclusion::ExclusionTracker;
use crate::io::{build_block, build_sector, compare_sectors, BlockIo, DataPattern};
use crate::recovery::Reconciler;
use blockdv_core::{
    BlockKey, CorruptionFlags, DeviceName, DvError, DvResult, SectorHeader, ValidationConfig,
    SECTOR_SIZE,
};
use blockdv_forensics::{
    BadSector, BlockOwner, CorruptionAggregator, LastUse, Operation, ReadContext, ReadReason,
    SectorSite, UseHistory,
};
use blockdv_storage::{BusyAcquire, KeyStore, SegmentLayout, StoreOptions};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

static NEXT_MAP: AtomicU64 = AtomicU64::new(1);

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Key blocks acquired for a write in flight.
#[must_use = "a write ticket must be completed or aborted"]
#[derive(Debug)]
pub struct WriteTicket {
    map: u64,
    target: usize,
    lba: u64,
    first_block: u64,
    new_keys: Vec<BlockKey>,
}

impl WriteTicket {
    /// Lba of the write.
    pub fn lba(&self) -> u64 {
        self.lba
    }

    /// Keys the write stores, one per key block.
    pub fn new_keys(&self) -> &[BlockKey] {
        &self.new_keys
    }

    /// File index for anchor tickets; 0 for devices.
    pub fn target(&self) -> usize {
        self.target
    }

    fn blocks(&self) -> Range<u64> {
        self.first_block..self.first_block + self.new_keys.len() as u64
    }
}

/// Key blocks acquired for a read in flight.
#[must_use = "a read ticket must be completed"]
#[derive(Debug)]
pub struct ReadTicket {
    map: u64,
    target: usize,
    lba: u64,
    len: u32,
    first_block: u64,
    keys: Vec<BlockKey>,
    reason: ReadReason,
}

impl ReadTicket {
    /// Lba of the read.
    pub fn lba(&self) -> u64 {
        self.lba
    }

    /// Keys the data is expected to carry, one per key block.
    pub fn expected_keys(&self) -> &[BlockKey] {
        &self.keys
    }

    /// File index for anchor tickets; 0 for devices.
    pub fn target(&self) -> usize {
        self.target
    }

    /// Why the read was issued.
    pub fn reason(&self) -> ReadReason {
        self.reason
    }

    pub(crate) fn any_written(&self) -> bool {
        self.keys.iter().any(|k| k.is_written())
    }

    fn blocks(&self) -> Range<u64> {
        self.first_block..self.first_block + self.keys.len() as u64
    }
}

/// Result of a whole validated write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Data written and keys advanced
    Written(Vec<BlockKey>),
    /// A key block was busy or in error; nothing written
    Skipped,
    /// Device or file excluded after too many bad blocks
    Excluded,
}

/// Result of a whole validated read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Every written key block matched
    Valid,
    /// No key block was ever written; nothing to compare
    NotWritten,
    /// A key block was busy or in error; nothing read
    Skipped,
    /// Device or file excluded after too many bad blocks
    Excluded,
    /// Corruption found and reported
    Corrupted {
        /// Key blocks now marked in error
        bad_key_blocks: usize,
        /// Report text, if this call produced it
        report: Option<String>,
    },
}

/// Where an I/O lands.
pub(crate) struct Target<'a> {
    /// File index; 0 for a device
    pub(crate) index: usize,
    /// Device or file name used in messages
    pub(crate) label: &'a str,
    pub(crate) owner: &'a BlockOwner,
    /// Key map offset of the target's lba 0
    pub(crate) base: u64,
    /// Addressable bytes
    pub(crate) size: u64,
    pub(crate) io: &'a dyn BlockIo,
    pub(crate) exclusion: &'a ExclusionTracker,
}

/// One key map and the validation state around it.
pub(crate) struct KeyContext {
    map: u64,
    pub(crate) id: String,
    pub(crate) name: DeviceName,
    pub(crate) key_block_size: u32,
    pub(crate) crash_recovery: bool,
    pid: u32,
    pub(crate) store: KeyStore,
    pub(crate) pattern: Arc<dyn DataPattern>,
    aggregator: Arc<CorruptionAggregator>,
    pub(crate) counters: KeyCounters,
    last_use: Option<DashMap<u64, LastUse>>,
}

impl KeyContext {
    /// Open the key map of `id` covering `size_bytes`, rounded down to whole
    /// key blocks.
    pub(crate) fn open(
        config: &ValidationConfig,
        id: &str,
        size_bytes: u64,
        pattern: Arc<dyn DataPattern>,
        aggregator: Arc<CorruptionAggregator>,
    ) -> DvResult<Self> {
        config.validate()?;
        let total_blocks = size_bytes / config.key_block_size as u64;
        let options = StoreOptions::new()
            .reuse(config.reuse_maps)
            .layout(SegmentLayout::new(config.segment_shift)?);
        let store = KeyStore::open(&config.map_dir, id, total_blocks, options)?;

        Ok(KeyContext {
            map: NEXT_MAP.fetch_add(1, Ordering::Relaxed),
            id: id.to_string(),
            name: DeviceName::from_name(id),
            key_block_size: config.key_block_size,
            crash_recovery: config.crash_recovery,
            pid: std::process::id(),
            store,
            pattern,
            aggregator,
            counters: KeyCounters::new(),
            last_use: config.track_last_use.then(DashMap::new),
        })
    }

    /// Bytes covered by the key map.
    pub(crate) fn map_bytes(&self) -> u64 {
        self.store.total_blocks() * self.key_block_size as u64
    }

    pub(crate) fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(&self.id, self.name, self.key_block_size, &*self.pattern)
    }

    fn key_blocks(&self, target: &Target<'_>, lba: u64, len: u32) -> DvResult<(u64, u64)> {
        let kbs = self.key_block_size as u64;
        if lba % kbs != 0 || len == 0 || len as u64 % kbs != 0 {
            return Err(DvError::consistency(format!(
                "transfer at 0x{:08x} of {} bytes is not aligned to {}-byte key blocks",
                lba, len, kbs
            )));
        }
        if lba.checked_add(len as u64).map_or(true, |end| end > target.size) {
            return Err(DvError::consistency(format!(
                "transfer at 0x{:08x} of {} bytes is beyond the {} bytes of {}",
                lba, len, target.size, target.label
            )));
        }
        Ok(((target.base + lba) / kbs, len as u64 / kbs))
    }

    fn check_ticket(&self, target: &Target<'_>, map: u64, index: usize, lba: u64) -> DvResult<()> {
        if map != self.map || index != target.index {
            return Err(DvError::consistency(format!(
                "ticket for lba 0x{:08x} was not issued for {}",
                lba, target.label
            )));
        }
        Ok(())
    }

    /// Acquire `first..first + count` busy; on any refusal release what was
    /// taken and return `None`.
    fn acquire(&self, first: u64, count: u64) -> DvResult<Option<Vec<BlockKey>>> {
        let mut keys = Vec::with_capacity(count as usize);
        for block in first..first + count {
            match self.store.get_key_and_set_busy(block)? {
                BusyAcquire::Acquired(key) => keys.push(key),
                BusyAcquire::AlreadyBusy(_) | BusyAcquire::InError => {
                    for taken in first..block {
                        self.store.release(taken)?;
                    }
                    return Ok(None);
                }
            }
        }
        Ok(Some(keys))
    }

    fn history(&self, block: u64) -> UseHistory {
        match &self.last_use {
            None => UseHistory::NotTracked,
            Some(map) => map
                .get(&block)
                .map_or(UseHistory::Unused, |last| UseHistory::Used(*last)),
        }
    }

    fn record_use(&self, blocks: impl Iterator<Item = u64>, op: Operation) {
        if let Some(map) = &self.last_use {
            let at_ms = now_ms();
            for block in blocks {
                map.insert(block, LastUse { op, at_ms });
            }
        }
    }

    pub(crate) fn begin_write(
        &self,
        target: &Target<'_>,
        lba: u64,
        len: u32,
    ) -> DvResult<Option<WriteTicket>> {
        let (first_block, count) = self.key_blocks(target, lba, len)?;
        if target.exclusion.is_excluded() {
            return Ok(None);
        }
        Ok(self.acquire(first_block, count)?.map(|keys| WriteTicket {
            map: self.map,
            target: target.index,
            lba,
            first_block,
            new_keys: keys.into_iter().map(BlockKey::increment).collect(),
        }))
    }

    pub(crate) fn complete_write(&self, target: &Target<'_>, ticket: WriteTicket) -> DvResult<()> {
        self.check_ticket(target, ticket.map, ticket.target, ticket.lba)?;
        for (block, key) in ticket.blocks().zip(&ticket.new_keys) {
            self.store.confirm(block, *key)?;
            self.counters.record_write(*key);
        }
        self.record_use(ticket.blocks(), Operation::Write);
        Ok(())
    }

    pub(crate) fn abort_write(&self, target: &Target<'_>, ticket: WriteTicket) -> DvResult<()> {
        self.check_ticket(target, ticket.map, ticket.target, ticket.lba)?;
        for block in ticket.blocks() {
            self.store.release(block)?;
        }
        Ok(())
    }

    pub(crate) fn fail_write(&self, target: &Target<'_>, ticket: WriteTicket) -> DvResult<()> {
        self.check_ticket(target, ticket.map, ticket.target, ticket.lba)?;
        for block in ticket.blocks() {
            self.store.mark_error(block)?;
        }
        Ok(())
    }

    pub(crate) fn write_block(&self, target: &Target<'_>, lba: u64, len: u32) -> DvResult<WriteOutcome> {
        let ticket = match self.begin_write(target, lba, len)? {
            Some(ticket) => ticket,
            None if target.exclusion.is_excluded() => return Ok(WriteOutcome::Excluded),
            None => return Ok(WriteOutcome::Skipped),
        };
        let built = build_block(
            &*self.pattern,
            lba,
            &ticket.new_keys,
            self.key_block_size,
            self.name,
            now_ms(),
            self.pid,
        );
        let data = match built {
            Ok(data) => data,
            Err(e) => {
                self.abort_write(target, ticket)?;
                return Err(e.into());
            }
        };
        match target.io.write_block(lba, &data) {
            Ok(()) => {
                let keys = ticket.new_keys.clone();
                self.complete_write(target, ticket)?;
                Ok(WriteOutcome::Written(keys))
            }
            Err(e) => {
                // The blocks may hold any mix of old and new sectors now.
                error!(device = %target.label, lba, len, error = %e, "write failed; key blocks marked in error");
                self.fail_write(target, ticket)?;
                Err(e.into())
            }
        }
    }

    pub(crate) fn begin_read(
        &self,
        target: &Target<'_>,
        lba: u64,
        len: u32,
        reason: ReadReason,
    ) -> DvResult<Option<ReadTicket>> {
        let (first_block, count) = self.key_blocks(target, lba, len)?;
        if target.exclusion.is_excluded() {
            return Ok(None);
        }
        Ok(self.acquire(first_block, count)?.map(|keys| ReadTicket {
            map: self.map,
            target: target.index,
            lba,
            len,
            first_block,
            keys,
            reason,
        }))
    }

    pub(crate) fn complete_read(
        &self,
        target: &Target<'_>,
        ticket: ReadTicket,
        data: &[u8],
    ) -> DvResult<ReadOutcome> {
        if let Err(e) = self.check_ticket(target, ticket.map, ticket.target, ticket.lba) {
            return self.abort(e);
        }
        let outcome = if !ticket.any_written() {
            Ok(ReadOutcome::NotWritten)
        } else if data.len() != ticket.len as usize {
            Err(DvError::consistency(format!(
                "read at 0x{:08x} returned {} bytes, expected {}",
                ticket.lba,
                data.len(),
                ticket.len
            )))
        } else {
            self.check_read(target, &ticket, data)
        };
        // Release keeps the error key of blocks marked bad.
        for block in ticket.blocks() {
            self.store.release(block)?;
        }
        if outcome.is_ok() {
            let read = ticket
                .blocks()
                .zip(&ticket.keys)
                .filter(|(_, key)| key.is_written())
                .map(|(block, _)| block);
            self.record_use(read, Operation::Read);
        }
        outcome.or_else(|e| self.abort(e))
    }

    pub(crate) fn validate_block(
        &self,
        target: &Target<'_>,
        lba: u64,
        len: u32,
        reason: ReadReason,
    ) -> DvResult<ReadOutcome> {
        let ticket = match self.begin_read(target, lba, len, reason)? {
            Some(ticket) => ticket,
            None if target.exclusion.is_excluded() => return Ok(ReadOutcome::Excluded),
            None => return Ok(ReadOutcome::Skipped),
        };
        if !ticket.any_written() {
            return self.complete_read(target, ticket, &[]);
        }
        match target.io.read_block(lba, len as usize) {
            Ok(data) => self.complete_read(target, ticket, &data),
            Err(e) => {
                for block in ticket.blocks() {
                    self.store.release(block)?;
                }
                Err(e.into())
            }
        }
    }

    fn check_read(&self, target: &Target<'_>, ticket: &ReadTicket, data: &[u8]) -> DvResult<ReadOutcome> {
        let keys = &ticket.keys;
        let verdicts = compare_sectors(&*self.pattern, data, ticket.lba, keys, self.key_block_size, self.name)?;

        for key in keys.iter().filter(|k| k.is_written()) {
            self.counters.record_read(*key);
        }

        let detected_ms = now_ms();
        let sectors_per_key = self.key_block_size as usize / SECTOR_SIZE;
        let mut bad_key_blocks = BTreeSet::new();
        for verdict in verdicts.iter().filter(|v| !v.is_ok()) {
            let key_index = verdict.sector as usize / sectors_per_key;
            let expected_key = keys[key_index];
            if !expected_key.is_written() {
                continue;
            }
            let start = verdict.sector as usize * SECTOR_SIZE;
            let observed = &data[start..start + SECTOR_SIZE];
            let context = ReadContext {
                reason: ticket.reason,
                history: self.history(ticket.first_block + key_index as u64),
                detected_ms,
            };
            let sector = self
                .bad_sector(target, ticket, verdict.sector, expected_key, verdict.flags, observed)?
                .with_context(context);
            self.aggregator.add_sector(sector)?;
            bad_key_blocks.insert(key_index as u64);
        }

        if bad_key_blocks.is_empty() {
            return Ok(ReadOutcome::Valid);
        }

        let report = self.aggregator.report(
            target.owner.device_id(),
            target.owner.absolute(ticket.lba),
            true,
        )?;
        for index in &bad_key_blocks {
            self.store.mark_error(ticket.first_block + index)?;
        }
        target.exclusion.record_bad_block(ticket.len as u64);
        Ok(ReadOutcome::Corrupted {
            bad_key_blocks: bad_key_blocks.len(),
            report,
        })
    }

    fn bad_sector(
        &self,
        target: &Target<'_>,
        ticket: &ReadTicket,
        sector_index: u32,
        expected_key: BlockKey,
        flags: CorruptionFlags,
        observed: &[u8],
    ) -> DvResult<BadSector> {
        let site = SectorSite {
            owner: target.owner.clone(),
            data_lba: ticket.lba,
            data_block_size: ticket.len,
            key_block_size: self.key_block_size,
            sector_index,
            expected_key,
            expected_name: self.name,
        };
        let read = SectorHeader::read_from(observed)?;
        let expected = build_sector(
            &*self.pattern,
            &SectorHeader::new(site.sector_lba(), expected_key.value(), self.name, read.timestamp_ms, read.pid),
        )?;
        let regenerated = build_sector(&*self.pattern, &read)?;
        BadSector::analyze(site, flags, observed, &expected, &regenerated)
    }

    /// Flush report text, log, and hand the error back.
    pub(crate) fn abort<T>(&self, err: DvError) -> DvResult<T> {
        if matches!(err, DvError::ConsistencyViolation { .. } | DvError::FatalRun { .. }) {
            error!(device = %self.id, error = %err, "aborting validation");
            if let Err(flush) = self.aggregator.flush_pending() {
                error!(device = %self.id, error = %flush, "could not flush pending corruption reports");
            }
        }
        Err(err)
    }

    /// Flush the report stream and the key map.
    pub(crate) fn close(self) -> DvResult<()> {
        self.aggregator.flush()?;
        for line in self.counters.summary() {
            info!(device = %self.id, "{}", line);
        }
        self.store.close()
    }
}
