//! blockdv: crash-consistent write-generation tracking for block data
//! validation.
//!
//! The workspace is split into:
//!
//! - `blockdv-core`: keys, sector header layout, corruption flags, errors, configuration
//! - `blockdv-storage`: the memory-mapped, segmented key store
//! - `blockdv-forensics`: bad sector analysis and the corruption aggregator
//! - `blockdv-engine`: per-device hooks, exclusion tracking and crash recovery
//!
//! Most users only need the re-exports below.

mod types;

pub use types::*;

pub use blockdv_core as core;
pub use blockdv_engine as engine;
pub use blockdv_forensics as forensics;
pub use blockdv_storage as storage;
