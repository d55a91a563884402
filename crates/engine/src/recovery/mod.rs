//! Crash recovery for key maps
//!
//! This module contains:
//! - `reconcile`: per-block decision between complete, rolled back and torn
//! - `pending`: matching busy lbas of a file anchor to the files that own them
//!
//! Recovery runs once at startup, single-threaded, before any worker issues
//! I/O. Any failure aborts the run: a partially reconciled key map is never
//! used.

mod pending;
mod reconcile;

pub use pending::{assign_pending_to_files, FileExtent};
pub use reconcile::{
    recover_device, recover_files, Decision, FileTarget, Reconciler, RecoveryRecord,
    RecoverySummary,
};
