//! Run configuration
//!
//! Loaded from a TOML file; every field has a default so an empty file is a
//! valid configuration.
//!
//! ```toml
//! map_dir = "/var/tmp/keymaps"
//! segment_shift = 30
//! key_block_size = 4096
//! crash_recovery = true
//! reuse_maps = true
//! max_bad_blocks = 100
//! max_bad_percent = 1.0
//! track_last_use = false
//! ```

use crate::error::{DvError, DvResult};
use crate::sector::SECTOR_SIZE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Smallest accepted segment shift
pub const MIN_SEGMENT_SHIFT: u32 = 3;
/// Largest accepted segment shift
pub const MAX_SEGMENT_SHIFT: u32 = 40;
/// Default segment shift: 2^30 blocks per segment
pub const DEFAULT_SEGMENT_SHIFT: u32 = 30;

/// Data validation settings for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationConfig {
    /// Directory holding persisted key maps.
    pub map_dir: PathBuf,
    /// log2 of blocks per key-map segment.
    pub segment_shift: u32,
    /// Bytes tracked by one generation key.
    pub key_block_size: u32,
    /// Reconcile busy blocks at startup.
    pub crash_recovery: bool,
    /// Reuse key maps left by a previous run instead of zeroing them.
    pub reuse_maps: bool,
    /// Exclude a device once more than this many blocks are bad.
    pub max_bad_blocks: u64,
    /// Exclude a device once more than this percentage of its bytes are bad.
    pub max_bad_percent: f64,
    /// Remember the last read or write of every key block for corruption
    /// timelines. Costs one map entry per block touched.
    pub track_last_use: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            map_dir: PathBuf::from("keymaps"),
            segment_shift: DEFAULT_SEGMENT_SHIFT,
            key_block_size: SECTOR_SIZE as u32,
            crash_recovery: true,
            reuse_maps: false,
            max_bad_blocks: 100,
            max_bad_percent: 1.0,
            track_last_use: false,
        }
    }
}

impl ValidationConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> DvResult<Self> {
        let config: ValidationConfig =
            toml::from_str(text).map_err(|e| DvError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> DvResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges.
    pub fn validate(&self) -> DvResult<()> {
        if !(MIN_SEGMENT_SHIFT..=MAX_SEGMENT_SHIFT).contains(&self.segment_shift) {
            return Err(DvError::Config(format!(
                "segment_shift {} outside {}..={}",
                self.segment_shift, MIN_SEGMENT_SHIFT, MAX_SEGMENT_SHIFT
            )));
        }
        if self.key_block_size == 0 || self.key_block_size as usize % SECTOR_SIZE != 0 {
            return Err(DvError::Config(format!(
                "key_block_size {} is not a multiple of {}",
                self.key_block_size, SECTOR_SIZE
            )));
        }
        if !(0.0..=100.0).contains(&self.max_bad_percent) {
            return Err(DvError::Config(format!(
                "max_bad_percent {} outside 0..=100",
                self.max_bad_percent
            )));
        }
        Ok(())
    }

    /// Sectors per key block.
    pub fn sectors_per_key_block(&self) -> u32 {
        self.key_block_size / SECTOR_SIZE as u32
    }
}
