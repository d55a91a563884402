//! Key blocks of one corrupted data block

use crate::bad_sector::{BadSector, BlockOwner};
use crate::key_block::BadKeyBlock;
use blockdv_core::{DvError, DvResult};

/// One I/O granule with at least one bad sector.
#[derive(Debug, Clone)]
pub struct BadDataBlock {
    owner: BlockOwner,
    data_lba: u64,
    data_block_size: u32,
    key_block_size: u32,
    key_blocks: Vec<Option<BadKeyBlock>>,
}

impl BadDataBlock {
    /// Empty data block shaped after `first`.
    pub fn for_sector(first: &BadSector) -> Self {
        let site = &first.site;
        let count = (site.data_block_size / site.key_block_size) as usize;
        BadDataBlock {
            owner: site.owner.clone(),
            data_lba: site.data_lba,
            data_block_size: site.data_block_size,
            key_block_size: site.key_block_size,
            key_blocks: vec![None; count],
        }
    }

    /// Route a sector into its key block, creating the key block as needed.
    ///
    /// # Errors
    ///
    /// `ConsistencyViolation` when the sector's geometry disagrees with the
    /// block's, or the sector was already recorded.
    pub fn add(&mut self, sector: BadSector) -> DvResult<()> {
        let site = &sector.site;
        if site.owner != self.owner
            || site.data_lba != self.data_lba
            || site.data_block_size != self.data_block_size
            || site.key_block_size != self.key_block_size
        {
            return Err(DvError::consistency(format!(
                "sector for {} lba 0x{:08x} ({}/{} bytes) routed to data block {} lba 0x{:08x} ({}/{} bytes)",
                site.owner.device_id(),
                site.data_lba,
                site.data_block_size,
                site.key_block_size,
                self.owner.device_id(),
                self.data_lba,
                self.data_block_size,
                self.key_block_size
            )));
        }
        let index = site.key_block_index() as usize;
        let key_block_lba = site.key_block_lba();
        let key_block_size = self.key_block_size;
        self.key_blocks[index]
            .get_or_insert_with(|| BadKeyBlock::new(key_block_lba, key_block_size))
            .add(sector)
    }

    /// Owner of the block.
    pub fn owner(&self) -> &BlockOwner {
        &self.owner
    }

    /// Lba relative to the owner.
    pub fn lba(&self) -> u64 {
        self.data_lba
    }

    /// Offset keying the pending map.
    pub fn absolute_offset(&self) -> u64 {
        self.owner.absolute(self.data_lba)
    }

    /// Transfer size in bytes.
    pub fn data_block_size(&self) -> u32 {
        self.data_block_size
    }

    /// Key block size in bytes.
    pub fn key_block_size(&self) -> u32 {
        self.key_block_size
    }

    /// Number of key blocks in the data block.
    pub fn key_block_count(&self) -> usize {
        self.key_blocks.len()
    }

    /// Key blocks with at least one bad sector, in lba order.
    pub fn corrupted_key_blocks(&self) -> impl Iterator<Item = &BadKeyBlock> {
        self.key_blocks.iter().flatten()
    }

    /// Total bad sectors across all key blocks.
    pub fn bad_sector_count(&self) -> usize {
        self.corrupted_key_blocks()
            .map(BadKeyBlock::bad_sector_count)
            .sum()
    }

    /// Locator line naming the block.
    pub fn locator(&self) -> String {
        match &self.owner {
            BlockOwner::Device { sd, lun } => format!(
                "Corrupted data block for sd={},lun={}; lba: {} (0x{:08x}) xfersize={}",
                sd, lun, self.data_lba, self.data_lba, self.data_block_size
            ),
            BlockOwner::File { anchor, file, .. } => format!(
                "Corrupted data block for fsd={},file={}; file lba: 0x{:08x} xfersize={}",
                anchor, file, self.data_lba, self.data_block_size
            ),
        }
    }

    /// Full report text for the block.
    pub fn render(&self, complete_scan: bool) -> String {
        let total = self.key_block_count();
        let corrupted = self.corrupted_key_blocks().count();

        let mut out = String::new();
        out.push_str(&self.locator());
        out.push('\n');
        out.push_str(&format!(
            "Data block has {} key block(s) of {} bytes each.\n",
            total, self.key_block_size
        ));
        if corrupted == total {
            out.push_str("All key blocks are corrupted.\n");
        } else {
            out.push_str(&format!(
                "{} of {} key blocks are corrupted.\n",
                corrupted, total
            ));
        }
        for key_block in self.corrupted_key_blocks() {
            out.push_str(&key_block.render(complete_scan));
        }
        out
    }
}
