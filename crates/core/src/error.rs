//! Error types for blockdv
//!
//! Two abort classes are kept apart so callers and tests can tell them
//! apart:
//!
//! - [`DvError::ConsistencyViolation`]: an internal invariant broke. This is a
//!   bug in blockdv or its caller and the run must stop immediately.
//! - [`DvError::FatalRun`]: an operator-facing condition (wrong key map reused,
//!   device unreadable during recovery) carrying device and lba context.
//!
//! Detected data corruption is not an error; it flows through the corruption
//! aggregator as report text.

use std::io;
use thiserror::Error;

/// Result alias used throughout blockdv
pub type DvResult<T> = Result<T, DvError>;

/// Error type for all blockdv operations
#[derive(Debug, Error)]
pub enum DvError {
    /// Internal invariant violated
    #[error("consistency violation: {detail}")]
    ConsistencyViolation {
        /// What was violated
        detail: String,
    },

    /// Run cannot continue; carries device and lba context
    #[error("fatal error on {device}{}: {detail}", lba_suffix(.lba))]
    FatalRun {
        /// Device, anchor or file name
        device: String,
        /// Byte offset involved, if any
        lba: Option<u64>,
        /// Operator-facing description
        detail: String,
    },

    /// I/O failure outside reconciliation
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),
}

fn lba_suffix(lba: &Option<u64>) -> String {
    match lba {
        Some(lba) => format!(" at lba 0x{:08x}", lba),
        None => String::new(),
    }
}

impl DvError {
    /// Build a [`DvError::ConsistencyViolation`].
    pub fn consistency(detail: impl Into<String>) -> Self {
        DvError::ConsistencyViolation {
            detail: detail.into(),
        }
    }

    /// Build a [`DvError::FatalRun`] without lba context.
    pub fn fatal(device: impl Into<String>, detail: impl Into<String>) -> Self {
        DvError::FatalRun {
            device: device.into(),
            lba: None,
            detail: detail.into(),
        }
    }

    /// Build a [`DvError::FatalRun`] at a specific lba.
    pub fn fatal_at(device: impl Into<String>, lba: u64, detail: impl Into<String>) -> Self {
        DvError::FatalRun {
            device: device.into(),
            lba: Some(lba),
            detail: detail.into(),
        }
    }

    /// True for internal invariant violations
    pub fn is_consistency_violation(&self) -> bool {
        matches!(self, DvError::ConsistencyViolation { .. })
    }

    /// True for operator-facing fatal run errors
    pub fn is_fatal_run(&self) -> bool {
        matches!(self, DvError::FatalRun { .. })
    }
}
