//! Core types for block data validation
//!
//! This crate defines the vocabulary shared by every other blockdv crate:
//! - `key`: generation keys and the persisted key-byte encoding
//! - `sector`: the 512-byte sector header layout and corruption flags
//! - `error`: the error taxonomy (`ConsistencyViolation` vs `FatalRun`)
//! - `config`: run configuration loaded from TOML

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod key;
pub mod sector;

pub use config::ValidationConfig;
pub use error::{DvError, DvResult};
pub use key::{BlockKey, KeyEntry};
pub use sector::{
    sector_word, timestamp_checksum, CorruptionFlags, DeviceName, SectorHeader, HEADER_SIZE,
    HEADER_WORDS, PAYLOAD_WORDS, SECTOR_SIZE, SECTOR_WORDS,
};
