//! Validation context of one device
//!
//! A `Device` owns the key store of a raw device and ties it to the
//! collaborator I/O handle, the payload pattern and the shared corruption
//! aggregator. The I/O execution path drives it through paired hooks:
//!
//! - `begin_write` marks the key blocks busy; `complete_write` advances their
//!   keys once the write is confirmed, `abort_write` leaves them unchanged and
//!   `fail_write` marks them in error
//! - `begin_read` marks them busy for a read; `complete_read` checks the data
//!   against the expected keys and escalates mismatches to the aggregator
//! - `write_block` and `validate_block` run a whole write or read through
//!   the collaborator I/O handle
//!
//! `recover` must run once after `open`, before any worker I/O.

use crate::context::{KeyContext, Target};
use crate::counters::KeyCounters;
use crate::exclusion::ExclusionTracker;
use crate::io::{BlockIo, DataPattern};
use crate::recovery::{recover_device, RecoverySummary};
use blockdv_core::{DvError, DvResult, ValidationConfig};
use blockdv_forensics::{BlockOwner, CorruptionAggregator, ReadReason};
use blockdv_storage::KeyStore;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

pub use crate::context::{ReadOutcome, ReadTicket, WriteOutcome, WriteTicket};

/// Validation context of one raw device.
pub struct Device {
    ctx: KeyContext,
    owner: BlockOwner,
    size_bytes: u64,
    io: Arc<dyn BlockIo>,
    exclusion: ExclusionTracker,
}

impl Device {
    /// Open the key map of storage definition `sd` on `lun`.
    ///
    /// The device size is rounded down to whole key blocks.
    pub fn open(
        config: &ValidationConfig,
        sd: &str,
        lun: &str,
        size_bytes: u64,
        io: Arc<dyn BlockIo>,
        pattern: Arc<dyn DataPattern>,
        aggregator: Arc<CorruptionAggregator>,
    ) -> DvResult<Self> {
        let ctx = KeyContext::open(config, sd, size_bytes, pattern, aggregator)?;
        let size_bytes = ctx.map_bytes();
        info!(sd = %sd, lun = %lun, size_bytes, key_block_size = ctx.key_block_size, "opened device for validation");

        Ok(Device {
            exclusion: ExclusionTracker::new(
                sd,
                size_bytes,
                config.max_bad_blocks,
                config.max_bad_percent,
            ),
            owner: BlockOwner::Device {
                sd: sd.to_string(),
                lun: lun.to_string(),
            },
            size_bytes,
            io,
            ctx,
        })
    }

    fn target(&self) -> Target<'_> {
        Target {
            index: 0,
            label: &self.ctx.id,
            owner: &self.owner,
            base: 0,
            size: self.size_bytes,
            io: &*self.io,
            exclusion: &self.exclusion,
        }
    }

    /// Storage definition name.
    pub fn sd(&self) -> &str {
        &self.ctx.id
    }

    /// Key store of the device.
    pub fn store(&self) -> &KeyStore {
        &self.ctx.store
    }

    /// Key read/write counters.
    pub fn counters(&self) -> &KeyCounters {
        &self.ctx.counters
    }

    /// Bad-block exclusion state.
    pub fn exclusion(&self) -> &ExclusionTracker {
        &self.exclusion
    }

    /// Settle every block left busy by a previous run.
    ///
    /// With crash recovery on, each busy block is re-read and reconciled;
    /// otherwise busy flags are simply cleared. Fatal errors flush pending
    /// report text before returning.
    pub fn recover(&self) -> DvResult<RecoverySummary> {
        if !self.ctx.crash_recovery {
            let counts = self.ctx.store.sweep_clear_busy()?;
            return Ok(RecoverySummary {
                counts,
                records: Vec::new(),
            });
        }
        recover_device(&self.ctx.store, &*self.io, &self.ctx.reconciler()).or_else(|e| self.ctx.abort(e))
    }

    /// Mark the key blocks of a write busy.
    ///
    /// Returns `None` when the device is excluded or a key block is busy or
    /// in error.
    pub fn begin_write(&self, lba: u64, len: u32) -> DvResult<Option<WriteTicket>> {
        self.ctx.begin_write(&self.target(), lba, len)
    }

    /// Confirm a write: store the new keys and clear busy.
    pub fn complete_write(&self, ticket: WriteTicket) -> DvResult<()> {
        self.ctx.complete_write(&self.target(), ticket)
    }

    /// Abandon a write that never reached the device: clear busy and keep
    /// the old keys.
    pub fn abort_write(&self, ticket: WriteTicket) -> DvResult<()> {
        self.ctx.abort_write(&self.target(), ticket)
    }

    /// Settle a write the device failed: its key blocks are marked in error.
    pub fn fail_write(&self, ticket: WriteTicket) -> DvResult<()> {
        self.ctx.fail_write(&self.target(), ticket)
    }

    /// Write the next generation of a block.
    ///
    /// A failed device write marks the key blocks in error and returns the
    /// I/O error.
    pub fn write_block(&self, lba: u64, len: u32) -> DvResult<WriteOutcome> {
        self.ctx.write_block(&self.target(), lba, len)
    }

    /// Mark the key blocks of a workload read busy and capture their
    /// expected keys.
    ///
    /// Returns `None` when the device is excluded or a key block is busy or
    /// in error.
    pub fn begin_read(&self, lba: u64, len: u32) -> DvResult<Option<ReadTicket>> {
        self.begin_read_as(lba, len, ReadReason::Normal)
    }

    /// [`Device::begin_read`] for a read issued for `reason`.
    pub fn begin_read_as(&self, lba: u64, len: u32, reason: ReadReason) -> DvResult<Option<ReadTicket>> {
        self.ctx.begin_read(&self.target(), lba, len, reason)
    }

    /// Validate the data of a finished read, then clear busy.
    ///
    /// Key blocks never written are not compared. Mismatching sectors go to
    /// the aggregator; the block is reported once and its corrupted key
    /// blocks are marked in error.
    pub fn complete_read(&self, ticket: ReadTicket, data: &[u8]) -> DvResult<ReadOutcome> {
        self.ctx.complete_read(&self.target(), ticket, data)
    }

    /// Read a block and validate it against the key map.
    pub fn validate_block(&self, lba: u64, len: u32) -> DvResult<ReadOutcome> {
        self.validate_block_as(lba, len, ReadReason::Normal)
    }

    /// [`Device::validate_block`] for a read issued for `reason`.
    pub fn validate_block_as(&self, lba: u64, len: u32, reason: ReadReason) -> DvResult<ReadOutcome> {
        self.ctx.validate_block(&self.target(), lba, len, reason)
    }

    /// Flush the key map and the report stream, then release the device.
    pub fn close(self) -> DvResult<()> {
        self.io.sync()?;
        self.ctx.close()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("owner", &self.owner)
            .field("store", &self.ctx.store)
            .finish()
    }
}

/// Open devices by storage definition name.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: DashMap<String, Arc<Device>>,
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device under its sd name.
    ///
    /// # Errors
    ///
    /// `ConsistencyViolation` if the name is already registered.
    pub fn register(&self, device: Device) -> DvResult<Arc<Device>> {
        let device = Arc::new(device);
        match self.devices.entry(device.sd().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(DvError::consistency(format!(
                "device {} registered twice",
                device.sd()
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&device));
                Ok(device)
            }
        }
    }

    /// Device registered as `sd`.
    pub fn get(&self, sd: &str) -> Option<Arc<Device>> {
        self.devices.get(sd).map(|d| Arc::clone(d.value()))
    }

    /// Remove a device, returning it.
    pub fn remove(&self, sd: &str) -> Option<Arc<Device>> {
        self.devices.remove(sd).map(|(_, d)| d)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.iter().map(|d| d.key().clone()).collect();
        names.sort();
        names
    }

    /// Recover every registered device, in name order.
    pub fn recover_all(&self) -> DvResult<Vec<(String, RecoverySummary)>> {
        let mut results = Vec::new();
        for name in self.names() {
            if let Some(device) = self.get(&name) {
                results.push((name, device.recover()?));
            }
        }
        Ok(results)
    }
}
