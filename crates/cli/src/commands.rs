//! Subcommand implementations
//!
//! Each command returns the text to print so it can be tested without a
//! terminal.

use anyhow::{Context, Result};
use blockdv_core::ValidationConfig;
use blockdv_forensics::compress_sector_numbers;
use blockdv_storage::{KeyStore, SegmentLayout, StoreOptions, SweepCounts};
use clap::Args;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Which key map to open
#[derive(Args, Debug, Clone)]
pub struct MapArgs {
    /// Device or anchor name the map was written for
    #[arg(long)]
    pub device: String,

    /// Number of key blocks the map tracks
    #[arg(long)]
    pub blocks: u64,

    /// Key map directory (overrides the configuration)
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// log2 of blocks per segment (overrides the configuration)
    #[arg(long)]
    pub segment_shift: Option<u32>,
}

/// Arguments of `get`
#[derive(Args, Debug, Clone)]
pub struct GetArgs {
    #[command(flatten)]
    pub map: MapArgs,

    /// Block index
    #[arg(long)]
    pub block: u64,
}

/// Arguments of `compress`
#[derive(Args, Debug, Clone)]
pub struct CompressArgs {
    /// Sectors in the key block
    #[arg(long)]
    pub max: u32,

    /// Bad sector numbers
    pub sectors: Vec<u32>,
}

/// Configuration from `path`, or defaults.
pub fn load_config(path: Option<&Path>) -> Result<ValidationConfig> {
    match path {
        Some(path) => ValidationConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display())),
        None => Ok(ValidationConfig::default()),
    }
}

fn open_existing(config: &ValidationConfig, args: &MapArgs) -> Result<KeyStore> {
    let dir = args.dir.clone().unwrap_or_else(|| config.map_dir.clone());
    let layout = SegmentLayout::new(args.segment_shift.unwrap_or(config.segment_shift))?;
    let options = StoreOptions::new().reuse(true).layout(layout);
    debug!(device = %args.device, dir = %dir.display(), shift = layout.shift(), "opening key map");
    KeyStore::open(&dir, &args.device, args.blocks, options)
        .with_context(|| format!("opening key map of {} in {}", args.device, dir.display()))
}

fn counts_text(device: &str, counts: SweepCounts) -> String {
    format!(
        "{}: bad={} busy={} known={}",
        device, counts.bad, counts.busy, counts.known
    )
}

/// `census`
pub fn census(config: &ValidationConfig, args: MapArgs) -> Result<String> {
    let store = open_existing(config, &args)?;
    let text = counts_text(&args.device, store.census());
    store.close()?;
    Ok(text)
}

/// `get`
pub fn get(config: &ValidationConfig, args: GetArgs) -> Result<String> {
    let store = open_existing(config, &args.map)?;
    let entry = store.get(args.block)?;
    store.close()?;
    Ok(format!(
        "block {}: key={} busy={}",
        args.block, entry.key, entry.busy
    ))
}

/// `clear-busy`
pub fn clear_busy(config: &ValidationConfig, args: MapArgs) -> Result<String> {
    let store = open_existing(config, &args)?;
    let counts = store.sweep_clear_busy()?;
    store.close()?;
    Ok(counts_text(&args.device, counts))
}

/// `compress`
pub fn compress(mut args: CompressArgs) -> Result<String> {
    args.sectors.sort_unstable();
    args.sectors.dedup();
    if let Some(&last) = args.sectors.last() {
        anyhow::ensure!(
            last < args.max,
            "sector {} outside a key block of {} sectors",
            last,
            args.max
        );
    }
    Ok(compress_sector_numbers(&args.sectors, args.max))
}
