//! Validation engine
//!
//! Connects the key store, the corruption aggregator and the collaborator
//! I/O layer:
//!
//! - `io`: `BlockIo` and `DataPattern` traits, sector comparison, reference
//!   implementations
//! - `device`: per-device validation context and the registry of devices
//! - `anchor`: key map shared by the files of a file system anchor
//! - `recovery`: busy-block reconciliation after an abnormal exit
//! - `exclusion`: bad-block thresholds that take a device out of use
//! - `counters`: per-key read and write counts

pub mod anchor;
mod context;
pub mod counters;
pub mod device;
pub mod exclusion;
pub mod io;
pub mod recovery;

pub use anchor::FileAnchor;
pub use blockdv_forensics::ReadReason;
pub use counters::KeyCounters;
pub use device::{Device, DeviceRegistry, ReadOutcome, ReadTicket, WriteOutcome, WriteTicket};
pub use exclusion::ExclusionTracker;
pub use io::{
    build_block, build_sector, compare_block_pattern, compare_sectors, BlockIo, DataPattern,
    FileDevice, MemDevice, SectorVerdict, XxhPattern,
};
pub use recovery::{
    assign_pending_to_files, recover_device, recover_files, Decision, FileExtent, FileTarget,
    Reconciler, RecoveryRecord, RecoverySummary,
};
