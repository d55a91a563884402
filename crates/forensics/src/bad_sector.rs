//! Forensic record of one mismatching sector
//!
//! A `BadSector` is pure data: what the sector should have contained, what
//! was actually read, and a few derived facts that let the report tell
//! stale data apart from genuine corruption.

use blockdv_core::{
    sector_word, BlockKey, CorruptionFlags, DeviceName, DvError, DvResult, SectorHeader,
    HEADER_WORDS, PAYLOAD_WORDS, SECTOR_SIZE, SECTOR_WORDS,
};
use crate::timeline::ReadContext;
use chrono::{DateTime, Utc};
use std::fmt;

/// Who owns a data block: a raw device or a file under an anchor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlockOwner {
    /// Raw block device
    Device {
        /// Storage definition name
        sd: String,
        /// Device path
        lun: String,
    },
    /// File inside a file system anchor
    File {
        /// Anchor (file system definition) name
        anchor: String,
        /// File path
        file: String,
        /// Offset of the file's first block in the anchor's key map
        file_start: u64,
    },
}

impl BlockOwner {
    /// Name keying the owner's pending map and counters.
    pub fn device_id(&self) -> &str {
        match self {
            BlockOwner::Device { sd, .. } => sd,
            BlockOwner::File { anchor, .. } => anchor,
        }
    }

    /// Absolute offset in the owner's key map of a block-relative lba.
    pub fn absolute(&self, lba: u64) -> u64 {
        match self {
            BlockOwner::Device { .. } => lba,
            BlockOwner::File { file_start, .. } => file_start + lba,
        }
    }
}

/// Where a mismatching sector lives and what it should contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorSite {
    /// Owner of the data block
    pub owner: BlockOwner,
    /// Lba of the data block, relative to the owner
    pub data_lba: u64,
    /// Data block (I/O granule) size in bytes
    pub data_block_size: u32,
    /// Key block size in bytes
    pub key_block_size: u32,
    /// Sector index inside the data block
    pub sector_index: u32,
    /// Key the key map expects
    pub expected_key: BlockKey,
    /// Name fingerprint the sector should carry
    pub expected_name: DeviceName,
}

impl SectorSite {
    /// Lba this sector should carry in its header.
    pub fn sector_lba(&self) -> u64 {
        self.data_lba + self.sector_index as u64 * SECTOR_SIZE as u64
    }

    /// Key block index inside the data block.
    pub fn key_block_index(&self) -> u32 {
        self.sector_index * SECTOR_SIZE as u32 / self.key_block_size
    }

    /// Sector index inside its key block.
    pub fn sector_in_key_block(&self) -> u32 {
        self.sector_index % (self.key_block_size / SECTOR_SIZE as u32)
    }

    /// Lba of the key block holding this sector.
    pub fn key_block_lba(&self) -> u64 {
        self.data_lba + self.key_block_index() as u64 * self.key_block_size as u64
    }
}

/// One sector that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadSector {
    /// Location and expectation
    pub site: SectorSite,
    /// Header actually read
    pub observed: SectorHeader,
    /// Comparator verdict
    pub flags: CorruptionFlags,
    /// Payload still mismatches when regenerated from the key, lba and name
    /// that were actually read
    pub still_bad_as_read: bool,
    /// Payload words differing from the expected pattern
    pub differing_words: u32,
    /// Differing payload words that are off by exactly one bit
    pub single_bit_words: u32,
    /// Engine state when the sector was found bad
    pub context: ReadContext,
}

impl BadSector {
    /// Build the forensic record for one sector.
    ///
    /// - `observed`: the 512 bytes read
    /// - `expected`: the 512 bytes the sector should contain
    /// - `regenerated`: the 512 bytes implied by the header that was read
    ///
    /// # Errors
    ///
    /// `ConsistencyViolation` for short buffers, an empty verdict, or a site
    /// whose sector does not fit in its data block.
    pub fn analyze(
        site: SectorSite,
        flags: CorruptionFlags,
        observed: &[u8],
        expected: &[u8],
        regenerated: &[u8],
    ) -> DvResult<Self> {
        if flags.is_empty() {
            return Err(DvError::consistency(format!(
                "sector {} at lba 0x{:08x} reported bad without any corruption flag",
                site.sector_index, site.data_lba
            )));
        }
        if observed.len() < SECTOR_SIZE || expected.len() < SECTOR_SIZE || regenerated.len() < SECTOR_SIZE {
            return Err(DvError::consistency("sector buffer shorter than 512 bytes"));
        }
        if site.key_block_size == 0
            || site.key_block_size as usize % SECTOR_SIZE != 0
            || site.data_block_size % site.key_block_size != 0
            || (site.sector_index as u64 + 1) * SECTOR_SIZE as u64 > site.data_block_size as u64
        {
            return Err(DvError::consistency(format!(
                "sector {} does not fit a {}-byte data block of {}-byte key blocks",
                site.sector_index, site.data_block_size, site.key_block_size
            )));
        }

        let observed_header = SectorHeader::read_from(observed)
            .map_err(|e| DvError::consistency(format!("unreadable sector header: {}", e)))?;
        let (differing_words, single_bit_words) = count_differences(observed, expected);
        let (still_differing, _) = count_differences(observed, regenerated);

        Ok(BadSector {
            site,
            observed: observed_header,
            flags: flags.normalized(),
            still_bad_as_read: still_differing > 0,
            differing_words,
            single_bit_words,
            context: ReadContext::default(),
        })
    }

    /// Attach the engine's read context.
    pub fn with_context(mut self, context: ReadContext) -> Self {
        self.context = context;
        self
    }

    /// Key actually read.
    pub fn observed_key(&self) -> BlockKey {
        BlockKey::new(self.observed.key)
    }

    /// True when the key read differs from the expected one.
    pub fn wrong_key(&self) -> bool {
        self.observed.key != self.site.expected_key.value()
    }

    /// True when the lba read differs from the sector's real lba.
    pub fn wrong_lba(&self) -> bool {
        self.observed.lba != self.site.sector_lba()
    }

    /// True when the name fingerprint differs.
    pub fn wrong_name(&self) -> bool {
        self.observed.name != self.site.expected_name
    }

    /// Some but not all payload words match.
    pub fn is_partial(&self) -> bool {
        self.differing_words > 0 && (self.differing_words as usize) < PAYLOAD_WORDS
    }

    /// Sector is stale or misplaced and its payload is corrupt even so.
    pub fn corrupt_beyond_header(&self) -> bool {
        (self.wrong_key() || self.wrong_lba()) && self.still_bad_as_read
    }
}

impl fmt::Display for BadSector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ts = format_ms(self.observed.timestamp_ms);
        write!(
            f,
            "sector {:>3} lba 0x{:08x}: key {}/{:02x} lba 0x{:08x} name {}/{} written {} pid {}; {} of 120 words differ ({} single-bit); {}",
            self.site.sector_in_key_block(),
            self.site.sector_lba(),
            self.site.expected_key,
            self.observed.key,
            self.observed.lba,
            self.site.expected_name,
            self.observed.name,
            ts,
            self.observed.pid,
            self.differing_words,
            self.single_bit_words,
            self.flags
        )
    }
}

/// Milliseconds since the Unix epoch as report text.
pub(crate) fn format_ms(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_else(|| "invalid".to_string())
}

/// Differing payload words and how many of them differ by a single bit.
fn count_differences(a: &[u8], b: &[u8]) -> (u32, u32) {
    let mut differing = 0;
    let mut single_bit = 0;
    for word in HEADER_WORDS..SECTOR_WORDS {
        let diff = sector_word(a, word) ^ sector_word(b, word);
        if diff != 0 {
            differing += 1;
            if diff.count_ones() == 1 {
                single_bit += 1;
            }
        }
    }
    (differing, single_bit)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn device_owner() -> BlockOwner {
        BlockOwner::Device {
            sd: "sd1".to_string(),
            lun: "/dev/sdb".to_string(),
        }
    }

    pub(crate) fn site(sector_index: u32) -> SectorSite {
        SectorSite {
            owner: device_owner(),
            data_lba: 0x10000,
            data_block_size: 8192,
            key_block_size: 4096,
            sector_index,
            expected_key: BlockKey::new(5),
            expected_name: DeviceName::from_name("sd1"),
        }
    }

    pub(crate) fn sector_bytes(lba: u64, key: u8, fill: u8) -> Vec<u8> {
        let mut bytes = vec![fill; SECTOR_SIZE];
        SectorHeader::new(lba, key, DeviceName::from_name("sd1"), 1_700_000_000_000, 7)
            .write_to(&mut bytes)
            .unwrap();
        bytes
    }

    #[test]
    fn test_site_geometry() {
        let s = site(9);
        assert_eq!(s.sector_lba(), 0x10000 + 9 * 512);
        assert_eq!(s.key_block_index(), 1);
        assert_eq!(s.sector_in_key_block(), 1);
        assert_eq!(s.key_block_lba(), 0x11000);
    }

    #[test]
    fn test_stale_sector_is_not_still_bad() {
        let s = site(0);
        let expected = sector_bytes(s.sector_lba(), 5, 0xaa);
        let observed = sector_bytes(s.sector_lba(), 4, 0x55);
        let bad = BadSector::analyze(
            s,
            CorruptionFlags::BAD_KEY | CorruptionFlags::BAD_DATA,
            &observed,
            &expected,
            &observed,
        )
        .unwrap();

        assert!(bad.wrong_key());
        assert!(!bad.wrong_lba());
        assert!(!bad.still_bad_as_read);
        assert!(!bad.corrupt_beyond_header());
        assert_eq!(bad.flags, CorruptionFlags::BAD_KEY);
        assert_eq!(bad.differing_words, 120);
        assert!(!bad.is_partial());
    }

    #[test]
    fn test_single_bit_flip() {
        let s = site(2);
        let expected = sector_bytes(s.sector_lba(), 5, 0);
        let mut observed = expected.clone();
        observed[100] ^= 0x10;
        let bad = BadSector::analyze(s, CorruptionFlags::BAD_DATA, &observed, &expected, &expected).unwrap();

        assert_eq!(bad.differing_words, 1);
        assert_eq!(bad.single_bit_words, 1);
        assert!(bad.is_partial());
        assert!(bad.still_bad_as_read);
        assert!(!bad.corrupt_beyond_header());
    }

    #[test]
    fn test_wrong_key_and_corrupt_payload() {
        let s = site(1);
        let expected = sector_bytes(s.sector_lba(), 5, 0x11);
        let observed = sector_bytes(s.sector_lba(), 9, 0x22);
        let regenerated = sector_bytes(s.sector_lba(), 9, 0x33);
        let bad = BadSector::analyze(s, CorruptionFlags::BAD_KEY, &observed, &expected, &regenerated).unwrap();
        assert!(bad.corrupt_beyond_header());
        assert_eq!(bad.observed_key(), BlockKey::new(9));
    }

    #[test]
    fn test_empty_verdict_rejected() {
        let s = site(0);
        let bytes = sector_bytes(s.sector_lba(), 5, 0);
        let err = BadSector::analyze(s, CorruptionFlags::empty(), &bytes, &bytes, &bytes).unwrap_err();
        assert!(err.is_consistency_violation());
    }

    #[test]
    fn test_sector_outside_block_rejected() {
        let s = site(16);
        let bytes = sector_bytes(s.sector_lba(), 5, 0);
        let err = BadSector::analyze(s, CorruptionFlags::BAD_DATA, &bytes, &bytes, &bytes).unwrap_err();
        assert!(err.is_consistency_violation());
    }

    #[test]
    fn test_file_owner_absolute_offset() {
        let owner = BlockOwner::File {
            anchor: "fsd1".to_string(),
            file: "/mnt/a/file1".to_string(),
            file_start: 0x100000,
        };
        assert_eq!(owner.device_id(), "fsd1");
        assert_eq!(owner.absolute(0x2000), 0x102000);
    }
}
