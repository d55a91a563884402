//! Public types for blockdv.
//!
//! This module re-exports types from the internal crates with a flat public
//! interface.

// ============================================================================
// Keys, sectors, errors
// ============================================================================

pub use blockdv_core::{BlockKey, KeyEntry};
pub use blockdv_core::{CorruptionFlags, DeviceName, SectorHeader};
pub use blockdv_core::{DvError, DvResult};
pub use blockdv_core::ValidationConfig;

// ============================================================================
// Key store
// ============================================================================

pub use blockdv_storage::{BusyAcquire, KeyStore, SegmentLayout, StoreOptions, SweepCounts};

// ============================================================================
// Forensics
// ============================================================================

pub use blockdv_forensics::{BadDataBlock, BadKeyBlock, BadSector, BlockOwner, SectorSite};
pub use blockdv_forensics::{CorruptionAggregator, DeviceCounters, ReportBuffer};
pub use blockdv_forensics::{LastUse, Operation, ReadContext, ReadReason, UseHistory};

// ============================================================================
// Engine
// ============================================================================

pub use blockdv_engine::{BlockIo, DataPattern, FileDevice, MemDevice, XxhPattern};
pub use blockdv_engine::{FileAnchor, FileExtent};
pub use blockdv_engine::{Device, DeviceRegistry, ReadOutcome, ReadTicket, WriteOutcome, WriteTicket};
pub use blockdv_engine::{Decision, RecoveryRecord, RecoverySummary};
