//! Busy block reconciliation
//!
//! A block left busy by an abnormal exit had a write issued whose outcome is
//! unknown. Re-reading it settles the question:
//!
//! | sectors found         | decision    | key stored      |
//! |-----------------------|-------------|-----------------|
//! | all carry after-key   | complete    | after-key       |
//! | all carry before-key  | rolled back | before-key      |
//! | anything else         | torn        | error key       |
//!
//! A block that was never written before the interrupted write has no
//! before-image to compare against; unless the write completed it is reset
//! to never written.

use super::pending::{assign_pending_to_files, FileExtent};
use crate::io::{compare_sectors, BlockIo, DataPattern, SectorVerdict};
use blockdv_core::{BlockKey, DeviceName, DvError, DvResult, SECTOR_SIZE};
use blockdv_storage::{KeyStore, SweepCounts};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Outcome of reconciling one busy block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// Every sector carries the new key
    Complete,
    /// Every sector still carries the old key
    RolledBack,
    /// Mixed or unrecognisable sectors
    Torn,
    /// First write to the block did not complete
    Unknown,
    /// Block was already in error
    Excluded,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Decision::Complete => "complete",
            Decision::RolledBack => "rolled back",
            Decision::Torn => "torn",
            Decision::Unknown => "unknown",
            Decision::Excluded => "excluded",
        };
        f.write_str(text)
    }
}

/// Recovery status of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryRecord {
    /// Lba on the handle that was re-read
    pub lba: u64,
    /// Persisted key
    pub before_key: BlockKey,
    /// Key the interrupted write would have stored
    pub after_key: BlockKey,
    /// Sectors matching the before-key pattern
    pub before_matches: u32,
    /// Sectors matching the after-key pattern
    pub after_matches: u32,
    /// Sectors in the block
    pub total_sectors: u32,
    /// Decision taken
    pub decision: Decision,
}

impl RecoveryRecord {
    /// Key to persist for the block.
    pub fn stored_key(&self) -> BlockKey {
        match self.decision {
            Decision::Complete => self.after_key,
            Decision::RolledBack => self.before_key,
            Decision::Torn | Decision::Excluded => BlockKey::ERROR,
            Decision::Unknown => BlockKey::NEVER_WRITTEN,
        }
    }

    /// Sectors matching neither key.
    pub fn other_sectors(&self) -> u32 {
        self.total_sectors - self.before_matches - self.after_matches
    }
}

impl fmt::Display for RecoveryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lba 0x{:08x} key {} -> {}: {} before, {} after, {} other of {} sectors; {}",
            self.lba,
            self.before_key,
            self.after_key,
            self.before_matches,
            self.after_matches,
            self.other_sectors(),
            self.total_sectors,
            self.decision
        )
    }
}

/// Result of a recovery pass.
#[derive(Debug, Clone, Default)]
pub struct RecoverySummary {
    /// Counts from the busy sweep
    pub counts: SweepCounts,
    /// One record per reconciled block
    pub records: Vec<RecoveryRecord>,
}

impl RecoverySummary {
    /// Blocks that ended with `decision`.
    pub fn count(&self, decision: Decision) -> usize {
        self.records.iter().filter(|r| r.decision == decision).count()
    }
}

/// Re-reads busy key blocks and decides their state.
pub struct Reconciler<'a> {
    device: &'a str,
    name: DeviceName,
    key_block_size: u32,
    pattern: &'a dyn DataPattern,
}

impl<'a> Reconciler<'a> {
    /// Reconciler for key blocks of `key_block_size` bytes on `device`.
    pub fn new(
        device: &'a str,
        name: DeviceName,
        key_block_size: u32,
        pattern: &'a dyn DataPattern,
    ) -> Self {
        Reconciler {
            device,
            name,
            key_block_size,
            pattern,
        }
    }

    /// Key block size in bytes.
    pub fn key_block_size(&self) -> u32 {
        self.key_block_size
    }

    /// Reconcile the busy key block at `lba` on `io`.
    ///
    /// # Errors
    ///
    /// `FatalRun` if the block cannot be re-read.
    pub fn reconcile(
        &self,
        io: &dyn BlockIo,
        lba: u64,
        persisted: BlockKey,
    ) -> DvResult<RecoveryRecord> {
        let total_sectors = self.key_block_size / SECTOR_SIZE as u32;
        let before_key = persisted;
        let after_key = before_key.increment();

        if before_key.is_error() {
            return Ok(RecoveryRecord {
                lba,
                before_key,
                after_key,
                before_matches: 0,
                after_matches: 0,
                total_sectors,
                decision: Decision::Excluded,
            });
        }

        let data = io
            .read_block(lba, self.key_block_size as usize)
            .map_err(|e| DvError::fatal_at(self.device, lba, format!("re-read for recovery failed: {}", e)))?;

        let before_matches = if before_key.is_written() {
            self.matches(&data, lba, before_key)?
        } else {
            0
        };
        let after_matches = self.matches(&data, lba, after_key)?;

        let decision = if after_matches == total_sectors {
            Decision::Complete
        } else if !before_key.is_written() {
            Decision::Unknown
        } else if before_matches == total_sectors {
            Decision::RolledBack
        } else {
            Decision::Torn
        };

        let record = RecoveryRecord {
            lba,
            before_key,
            after_key,
            before_matches,
            after_matches,
            total_sectors,
            decision,
        };
        if decision == Decision::Torn {
            warn!(
                device = %self.device,
                lba,
                before_key = %before_key,
                after_key = %after_key,
                before_matches,
                after_matches,
                other = record.other_sectors(),
                "torn write; block excluded from validation"
            );
        } else {
            debug!(device = %self.device, "{}", record);
        }
        Ok(record)
    }

    fn matches(&self, data: &[u8], lba: u64, key: BlockKey) -> DvResult<u32> {
        let verdicts = compare_sectors(self.pattern, data, lba, &[key], self.key_block_size, self.name)
            .map_err(|e| DvError::fatal_at(self.device, lba, format!("re-read for recovery failed: {}", e)))?;
        Ok(verdicts.iter().filter(|v| v.is_ok()).count() as u32)
    }
}

/// Reconcile every busy block of a raw device and clear all busy flags.
pub fn recover_device(
    store: &KeyStore,
    io: &dyn BlockIo,
    reconciler: &Reconciler<'_>,
) -> DvResult<RecoverySummary> {
    let kbs = reconciler.key_block_size() as u64;
    let mut records = Vec::new();
    let counts = store.sweep_clear_busy_with(|block, key| {
        let record = reconciler.reconcile(io, block * kbs, key)?;
        records.push(record);
        Ok(record.stored_key())
    })?;
    log_summary(store.device(), &records);
    Ok(RecoverySummary { counts, records })
}

/// One file of an anchor during recovery.
pub struct FileTarget<'a> {
    /// Where the file lives in the anchor's key map
    pub extent: FileExtent,
    /// Handle used to re-read the file
    pub io: &'a dyn BlockIo,
}

/// Reconcile every busy block of a file anchor and clear all busy flags.
///
/// Busy blocks are first assigned to their files; a busy block inside no
/// file aborts recovery before anything is changed.
pub fn recover_files(
    store: &KeyStore,
    files: &[FileTarget<'_>],
    reconciler: &Reconciler<'_>,
) -> DvResult<RecoverySummary> {
    let kbs = reconciler.key_block_size() as u64;
    let busy = store.busy_blocks();
    let lbas: Vec<u64> = busy.iter().map(|(block, _)| block * kbs).collect();
    let extents: Vec<FileExtent> = files.iter().map(|f| f.extent.clone()).collect();
    let assigned = assign_pending_to_files(&lbas, &extents)?;

    let persisted: HashMap<u64, BlockKey> = busy.into_iter().collect();
    let mut resolved: HashMap<u64, BlockKey> = HashMap::with_capacity(assigned.len());
    let mut records = Vec::with_capacity(assigned.len());
    for (index, lba) in assigned {
        let block = lba / kbs;
        let key = persisted.get(&block).copied().unwrap_or_default();
        let target = &files[index];
        let record = reconciler.reconcile(target.io, lba - target.extent.start_lba, key)?;
        resolved.insert(block, record.stored_key());
        records.push(record);
    }

    let counts = store.sweep_clear_busy_with(|block, _| {
        resolved.get(&block).copied().ok_or_else(|| {
            DvError::consistency(format!(
                "block {} became busy during recovery of {}",
                block,
                store.device()
            ))
        })
    })?;
    log_summary(store.device(), &records);
    Ok(RecoverySummary { counts, records })
}

fn log_summary(device: &str, records: &[RecoveryRecord]) {
    if records.is_empty() {
        return;
    }
    let torn = records.iter().filter(|r| r.decision == Decision::Torn).count();
    info!(device = %device, reconciled = records.len(), torn, "recovery finished");
}
