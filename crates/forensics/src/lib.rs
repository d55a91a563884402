//! Sector forensics and corruption aggregation
//!
//! When a read fails validation the comparator produces one verdict per
//! mismatching sector. This crate shapes those verdicts into reports:
//!
//! - `bad_sector`: forensic record of one mismatching sector
//! - `key_block`: sectors of one key block and their derived properties
//! - `data_block`: key blocks of one I/O granule
//! - `aggregator`: pending map, report-once discipline and report text
//! - `timeline`: read reason and per-block history shown with a report

pub mod aggregator;
pub mod bad_sector;
pub mod data_block;
pub mod key_block;
pub mod timeline;

pub use aggregator::{CorruptionAggregator, DeviceCounters, ReportBuffer};
pub use bad_sector::{BadSector, BlockOwner, SectorSite};
pub use data_block::BadDataBlock;
pub use key_block::{compress_sector_numbers, BadKeyBlock};
pub use timeline::{timeline_lines, LastUse, Operation, ReadContext, ReadReason, UseHistory};
