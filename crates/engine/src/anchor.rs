//! Validation context of a file system anchor
//!
//! An anchor (file system definition) keeps one key map for all of its
//! files. Each file owns a contiguous, key-block aligned extent of that map.
//! Lbas passed to the I/O hooks are relative to the file; reports name the
//! file and its file lba, and bad-block exclusion applies to one file at a
//! time.
//!
//! Files are added right after `open`, before `recover` and before any
//! worker I/O.

use crate::context::{KeyContext, ReadOutcome, ReadTicket, Target, WriteOutcome, WriteTicket};
use crate::counters::KeyCounters;
use crate::exclusion::ExclusionTracker;
use crate::io::{BlockIo, DataPattern};
use crate::recovery::{recover_files, FileExtent, FileTarget, RecoverySummary};
use blockdv_core::{DvError, DvResult, ValidationConfig};
use blockdv_forensics::{BlockOwner, CorruptionAggregator, ReadReason};
use blockdv_storage::KeyStore;
use std::sync::Arc;
use tracing::{debug, info};

struct AnchorFile {
    extent: FileExtent,
    owner: BlockOwner,
    io: Arc<dyn BlockIo>,
    exclusion: ExclusionTracker,
}

/// Key map shared by the files of one anchor.
pub struct FileAnchor {
    ctx: KeyContext,
    max_bad_blocks: u64,
    max_bad_percent: f64,
    files: Vec<AnchorFile>,
}

impl FileAnchor {
    /// Open the key map of `anchor`, sized for `size_bytes` of files.
    pub fn open(
        config: &ValidationConfig,
        anchor: &str,
        size_bytes: u64,
        pattern: Arc<dyn DataPattern>,
        aggregator: Arc<CorruptionAggregator>,
    ) -> DvResult<Self> {
        let ctx = KeyContext::open(config, anchor, size_bytes, pattern, aggregator)?;
        info!(anchor = %anchor, size_bytes = ctx.map_bytes(), "opened file anchor for validation");
        Ok(FileAnchor {
            ctx,
            max_bad_blocks: config.max_bad_blocks,
            max_bad_percent: config.max_bad_percent,
            files: Vec::new(),
        })
    }

    /// Add a file of `size` bytes whose first block sits at anchor offset
    /// `start_lba`. Returns the file's index.
    ///
    /// # Errors
    ///
    /// `ConsistencyViolation` if the extent is not key-block aligned, lies
    /// outside the key map or overlaps another file.
    pub fn add_file(
        &mut self,
        path: &str,
        start_lba: u64,
        size: u64,
        io: Arc<dyn BlockIo>,
    ) -> DvResult<usize> {
        let kbs = self.ctx.key_block_size as u64;
        if size == 0 || start_lba % kbs != 0 || size % kbs != 0 {
            return Err(DvError::consistency(format!(
                "file {} at 0x{:08x} of {} bytes is not aligned to {}-byte key blocks",
                path, start_lba, size, kbs
            )));
        }
        let extent = FileExtent {
            path: path.to_string(),
            start_lba,
            size,
        };
        if extent.end_lba() > self.ctx.map_bytes() {
            return Err(DvError::consistency(format!(
                "file {} ends at 0x{:08x}, beyond the {} bytes of anchor {}",
                path,
                extent.end_lba(),
                self.ctx.map_bytes(),
                self.ctx.id
            )));
        }
        if let Some(other) = self
            .files
            .iter()
            .find(|f| f.extent.start_lba < extent.end_lba() && extent.start_lba < f.extent.end_lba())
        {
            return Err(DvError::consistency(format!(
                "file {} overlaps file {} in anchor {}",
                path, other.extent.path, self.ctx.id
            )));
        }

        debug!(anchor = %self.ctx.id, file = %path, start_lba, size, "added file");
        self.files.push(AnchorFile {
            owner: BlockOwner::File {
                anchor: self.ctx.id.clone(),
                file: path.to_string(),
                file_start: start_lba,
            },
            exclusion: ExclusionTracker::new(path, size, self.max_bad_blocks, self.max_bad_percent),
            extent,
            io,
        });
        Ok(self.files.len() - 1)
    }

    fn target(&self, file: usize) -> DvResult<Target<'_>> {
        let f = self.files.get(file).ok_or_else(|| {
            DvError::consistency(format!("anchor {} has no file {}", self.ctx.id, file))
        })?;
        Ok(Target {
            index: file,
            label: &f.extent.path,
            owner: &f.owner,
            base: f.extent.start_lba,
            size: f.extent.size,
            io: &*f.io,
            exclusion: &f.exclusion,
        })
    }

    /// Anchor name.
    pub fn name(&self) -> &str {
        &self.ctx.id
    }

    /// Number of files added.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Extent of file `file`.
    pub fn extent(&self, file: usize) -> Option<&FileExtent> {
        self.files.get(file).map(|f| &f.extent)
    }

    /// Bad-block exclusion state of file `file`.
    pub fn exclusion(&self, file: usize) -> Option<&ExclusionTracker> {
        self.files.get(file).map(|f| &f.exclusion)
    }

    /// Key store shared by the files.
    pub fn store(&self) -> &KeyStore {
        &self.ctx.store
    }

    /// Key read/write counters over all files.
    pub fn counters(&self) -> &KeyCounters {
        &self.ctx.counters
    }

    /// Settle every block left busy by a previous run.
    ///
    /// Busy blocks are matched to their files and re-read through the
    /// file's handle. A busy block that belongs to no file is a consistency
    /// violation.
    pub fn recover(&self) -> DvResult<RecoverySummary> {
        if !self.ctx.crash_recovery {
            let counts = self.ctx.store.sweep_clear_busy()?;
            return Ok(RecoverySummary {
                counts,
                records: Vec::new(),
            });
        }
        let targets: Vec<FileTarget<'_>> = self
            .files
            .iter()
            .map(|f| FileTarget {
                extent: f.extent.clone(),
                io: &*f.io,
            })
            .collect();
        recover_files(&self.ctx.store, &targets, &self.ctx.reconciler()).or_else(|e| self.ctx.abort(e))
    }

    /// Mark the key blocks of a write to `file` busy.
    ///
    /// Returns `None` when the file is excluded or a key block is busy or in
    /// error.
    pub fn begin_write(&self, file: usize, lba: u64, len: u32) -> DvResult<Option<WriteTicket>> {
        self.ctx.begin_write(&self.target(file)?, lba, len)
    }

    /// Confirm a write: store the new keys and clear busy.
    pub fn complete_write(&self, ticket: WriteTicket) -> DvResult<()> {
        self.ctx.complete_write(&self.target(ticket.target())?, ticket)
    }

    /// Abandon a write that never reached the file.
    pub fn abort_write(&self, ticket: WriteTicket) -> DvResult<()> {
        self.ctx.abort_write(&self.target(ticket.target())?, ticket)
    }

    /// Settle a write the file system failed: its key blocks are marked in
    /// error.
    pub fn fail_write(&self, ticket: WriteTicket) -> DvResult<()> {
        self.ctx.fail_write(&self.target(ticket.target())?, ticket)
    }

    /// Write the next generation of a block of `file`.
    pub fn write_block(&self, file: usize, lba: u64, len: u32) -> DvResult<WriteOutcome> {
        self.ctx.write_block(&self.target(file)?, lba, len)
    }

    /// Mark the key blocks of a workload read of `file` busy.
    pub fn begin_read(&self, file: usize, lba: u64, len: u32) -> DvResult<Option<ReadTicket>> {
        self.begin_read_as(file, lba, len, ReadReason::Normal)
    }

    /// [`FileAnchor::begin_read`] for a read issued for `reason`.
    pub fn begin_read_as(
        &self,
        file: usize,
        lba: u64,
        len: u32,
        reason: ReadReason,
    ) -> DvResult<Option<ReadTicket>> {
        self.ctx.begin_read(&self.target(file)?, lba, len, reason)
    }

    /// Validate the data of a finished read, then clear busy.
    pub fn complete_read(&self, ticket: ReadTicket, data: &[u8]) -> DvResult<ReadOutcome> {
        self.ctx.complete_read(&self.target(ticket.target())?, ticket, data)
    }

    /// Read a block of `file` and validate it against the key map.
    pub fn validate_block(&self, file: usize, lba: u64, len: u32) -> DvResult<ReadOutcome> {
        self.validate_block_as(file, lba, len, ReadReason::Normal)
    }

    /// [`FileAnchor::validate_block`] for a read issued for `reason`.
    pub fn validate_block_as(
        &self,
        file: usize,
        lba: u64,
        len: u32,
        reason: ReadReason,
    ) -> DvResult<ReadOutcome> {
        self.ctx.validate_block(&self.target(file)?, lba, len, reason)
    }

    /// Sync every file, flush the report stream and close the key map.
    pub fn close(self) -> DvResult<()> {
        for file in &self.files {
            file.io.sync()?;
        }
        self.ctx.close()
    }
}

impl std::fmt::Debug for FileAnchor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAnchor")
            .field("anchor", &self.ctx.id)
            .field("files", &self.files.len())
            .field("store", &self.ctx.store)
            .finish()
    }
}
