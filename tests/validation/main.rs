//! End-to-end validation tests
//!
//! Drive the public `blockdv` surface against file-backed devices:
//! - Concurrent writers on disjoint blocks, then full read-back
//! - Configuration loaded from TOML, maps reused across a clean restart
//! - Several devices recovered through one registry after a crash
//! - Files of an anchor written from several threads, damaged and recovered

mod files;
mod restart;
mod workload;

use blockdv::{
    BlockIo, CorruptionAggregator, DataPattern, Device, FileDevice, ReportBuffer,
    ValidationConfig, XxhPattern,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub const KBS: u32 = 4096;
pub const BLOCKS: u64 = 256;
pub const SIZE: u64 = BLOCKS * KBS as u64;

pub struct Rig {
    pub dir: TempDir,
    pub buffer: ReportBuffer,
    pub aggregator: Arc<CorruptionAggregator>,
}

impl Rig {
    pub fn new() -> Self {
        let buffer = ReportBuffer::new();
        Rig {
            dir: TempDir::new().unwrap(),
            aggregator: Arc::new(CorruptionAggregator::new(buffer.clone())),
            buffer,
        }
    }

    pub fn config(&self, reuse: bool) -> ValidationConfig {
        ValidationConfig {
            map_dir: self.dir.path().join("maps"),
            segment_shift: 6,
            key_block_size: KBS,
            reuse_maps: reuse,
            ..ValidationConfig::default()
        }
    }

    pub fn lun(&self, sd: &str) -> std::path::PathBuf {
        self.dir.path().join(format!("{}.lun", sd))
    }

    pub fn create_lun(&self, sd: &str) -> Arc<FileDevice> {
        Arc::new(FileDevice::create(self.lun(sd), SIZE).unwrap())
    }

    pub fn open_lun(&self, sd: &str) -> Arc<FileDevice> {
        Arc::new(FileDevice::open(self.lun(sd)).unwrap())
    }

    pub fn device(&self, config: &ValidationConfig, sd: &str, io: Arc<FileDevice>) -> Device {
        open_device(config, sd, &self.lun(sd), io, &self.aggregator)
    }
}

pub fn open_device(
    config: &ValidationConfig,
    sd: &str,
    lun: &Path,
    io: Arc<FileDevice>,
    aggregator: &Arc<CorruptionAggregator>,
) -> Device {
    let io: Arc<dyn BlockIo> = io;
    let pattern: Arc<dyn DataPattern> = Arc::new(XxhPattern);
    Device::open(
        config,
        sd,
        &lun.display().to_string(),
        SIZE,
        io,
        pattern,
        Arc::clone(aggregator),
    )
    .unwrap()
}
