//! Mismatching sectors of one key block

use crate::bad_sector::BadSector;
use crate::timeline::timeline_lines;
use blockdv_core::{CorruptionFlags, DeviceName, DvError, DvResult, SECTOR_SIZE};
use std::collections::{BTreeMap, BTreeSet};

/// Most wrong lbas listed on one classification line.
const MAX_LISTED_LBAS: usize = 3;

/// The bad sectors of one key block, ordered by sector index.
#[derive(Debug, Clone)]
pub struct BadKeyBlock {
    key_block_lba: u64,
    sectors_per_key_block: u32,
    sectors: BTreeMap<u32, BadSector>,
}

impl BadKeyBlock {
    /// Empty key block at `key_block_lba`.
    pub fn new(key_block_lba: u64, key_block_size: u32) -> Self {
        BadKeyBlock {
            key_block_lba,
            sectors_per_key_block: key_block_size / SECTOR_SIZE as u32,
            sectors: BTreeMap::new(),
        }
    }

    /// Record one bad sector.
    ///
    /// # Errors
    ///
    /// `ConsistencyViolation` when the sector belongs to another key block or
    /// was already recorded.
    pub fn add(&mut self, sector: BadSector) -> DvResult<()> {
        if sector.site.key_block_lba() != self.key_block_lba {
            return Err(DvError::consistency(format!(
                "sector of key block 0x{:08x} routed to key block 0x{:08x}",
                sector.site.key_block_lba(),
                self.key_block_lba
            )));
        }
        let index = sector.site.sector_in_key_block();
        if self.sectors.contains_key(&index) {
            return Err(DvError::consistency(format!(
                "sector {} of key block 0x{:08x} reported twice",
                index, self.key_block_lba
            )));
        }
        self.sectors.insert(index, sector);
        Ok(())
    }

    /// Lba of the key block.
    pub fn lba(&self) -> u64 {
        self.key_block_lba
    }

    /// Sectors in a key block of this size.
    pub fn sectors_per_key_block(&self) -> u32 {
        self.sectors_per_key_block
    }

    /// Recorded sectors in index order.
    pub fn sectors(&self) -> impl Iterator<Item = &BadSector> {
        self.sectors.values()
    }

    /// Number of recorded sectors.
    pub fn bad_sector_count(&self) -> usize {
        self.sectors.len()
    }

    /// Keys read that differ from the expected key.
    pub fn wrong_keys(&self) -> BTreeSet<u8> {
        self.sectors()
            .filter(|s| s.wrong_key())
            .map(|s| s.observed.key)
            .collect()
    }

    /// Lbas read that differ from the sectors' real lbas.
    pub fn wrong_lbas(&self) -> BTreeSet<u64> {
        self.sectors()
            .filter(|s| s.wrong_lba())
            .map(|s| s.observed.lba)
            .collect()
    }

    /// Device-name fingerprints read that differ from the expected one.
    pub fn wrong_names(&self) -> BTreeSet<DeviceName> {
        self.sectors()
            .filter(|s| s.wrong_name())
            .map(|s| s.observed.name)
            .collect()
    }

    /// Sectors with at least one single-bit word error.
    pub fn single_bit_count(&self) -> usize {
        self.sectors().filter(|s| s.single_bit_words > 0).count()
    }

    /// True when the terminal sector of the key block was observed.
    pub fn last_sector_observed(&self) -> bool {
        self.sectors
            .contains_key(&(self.sectors_per_key_block.saturating_sub(1)))
    }

    /// Compressed range text of the bad sectors.
    pub fn sector_ranges(&self) -> String {
        let numbers: Vec<u32> = self.sectors.keys().copied().collect();
        compress_sector_numbers(&numbers, self.sectors_per_key_block)
    }

    /// Classification lines, each present only when its predicate holds for
    /// some sector of the block.
    pub fn classification(&self) -> Vec<String> {
        let mut lines = Vec::new();

        let keys = self.wrong_keys();
        if !keys.is_empty() {
            let listed: Vec<String> = keys.iter().map(|k| format!("{:02x}", k)).collect();
            lines.push(format!("Invalid key(s) read: {}", listed.join(" ")));
        }

        let lbas = self.wrong_lbas();
        if !lbas.is_empty() {
            let mut listed: Vec<String> = lbas
                .iter()
                .take(MAX_LISTED_LBAS)
                .map(|l| format!("0x{:x}", l))
                .collect();
            if lbas.len() > MAX_LISTED_LBAS {
                listed.push("...".to_string());
            }
            lines.push(format!("Invalid lba read: {}", listed.join(" ")));
        }

        if self.single_bit_count() > 0 {
            lines.push("At least one single-bit error.".to_string());
        }

        let names = self.wrong_names();
        if !names.is_empty() {
            let listed: Vec<String> = names.iter().map(|n| n.to_string()).collect();
            lines.push(format!("Invalid device name read: {}", listed.join(" ")));
        }

        if self.sectors().any(BadSector::corrupt_beyond_header) {
            lines.push("Data corruption even when using wrong lba or key.".to_string());
        }

        if self.sectors().any(BadSector::is_partial) {
            lines.push("At least one partial sector match.".to_string());
        } else if self.sectors().any(|s| s.differing_words > 0 && !s.wrong_key()) {
            lines.push("Data corruption.".to_string());
        }

        lines
    }

    /// True when every recorded sector carries the same corruption flags.
    pub fn matching_flags(&self) -> bool {
        let mut flags = self.sectors().map(|s| s.flags);
        match flags.next() {
            Some(first) => flags.all(|f| f == first),
            None => true,
        }
    }

    /// Number of sectors showing each corruption flag, in flag order.
    pub fn flag_counts(&self) -> Vec<(CorruptionFlags, usize)> {
        CorruptionFlags::all()
            .iter()
            .map(|flag| (flag, self.sectors().filter(|s| s.flags.contains(flag)).count()))
            .filter(|(_, count)| *count > 0)
            .collect()
    }

    /// Report section for this key block.
    ///
    /// With `complete_scan` the comparator examined every sector; otherwise a
    /// missing terminal sector marks the range summary incomplete. When every
    /// sector is bad in the same way only the first one is listed.
    pub fn render(&self, complete_scan: bool) -> String {
        let total = self.sectors_per_key_block as usize;
        let bad = self.bad_sector_count();

        let mut out = String::new();
        out.push_str(&format!("Key block lba: 0x{:08x}\n", self.key_block_lba));
        out.push_str(&format!(
            "   Key block of {} bytes has {} sectors.\n",
            total * SECTOR_SIZE,
            total
        ));
        if let Some(first) = self.sectors().next() {
            for line in timeline_lines(first) {
                out.push_str(&format!("   {}\n", line));
            }
        }
        for line in self.classification() {
            out.push_str(&format!("   - {}\n", line));
        }
        let marker = if !complete_scan && !self.last_sector_observed() {
            "(incomplete) "
        } else {
            ""
        };
        out.push_str(&format!("   - Bad sectors: {}{}\n", marker, self.sector_ranges()));

        if bad == total {
            out.push_str(&format!(
                "   All {} sectors in this key block are corrupted.\n",
                total
            ));
            if let Some(first) = self.sectors().next().filter(|_| self.matching_flags()) {
                out.push_str("   All corruptions are of the same type:\n");
                for label in first.flags.labels() {
                    out.push_str(&format!("   ===> {}\n", label));
                }
                out.push_str("   Only the first sector is reported:\n");
                out.push_str(&format!("     {}\n", first));
                return out;
            }
            out.push_str("   Corruption types do not match. Reporting all sectors:\n");
        } else {
            out.push_str(&format!(
                "   {} of {} sectors are corrupted. All are reported:\n",
                bad, total
            ));
        }

        out.push_str("   Error type counts:\n");
        for (flag, count) in self.flag_counts() {
            let label = format!("{}:", flag.labels().join(", "));
            out.push_str(&format!("   ===> {:<28} {:>4}\n", label, count));
        }
        for sector in self.sectors() {
            out.push_str(&format!("     {}\n", sector));
        }
        out
    }
}

/// Compress sorted sector numbers into range text.
///
/// ```
/// use blockdv_forensics::compress_sector_numbers;
/// assert_eq!(compress_sector_numbers(&[0, 1, 2, 3, 7, 9, 10, 11], 16), "0-3,7,9-11 (8 of 16)");
/// ```
pub fn compress_sector_numbers(numbers: &[u32], max: u32) -> String {
    if numbers.is_empty() {
        return format!(
            "All {} sectors good (based on lba and key that was read)",
            max
        );
    }
    if numbers.len() as u32 == max {
        return format!("All {} sectors bad", max);
    }

    let mut parts: Vec<String> = Vec::new();
    let mut start = numbers[0];
    let mut prev = numbers[0];
    for &n in &numbers[1..] {
        if n == prev + 1 {
            prev = n;
            continue;
        }
        parts.push(range_text(start, prev));
        start = n;
        prev = n;
    }
    parts.push(range_text(start, prev));

    format!("{} ({} of {})", parts.join(","), numbers.len(), max)
}

fn range_text(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}-{}", start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bad_sector::tests::{sector_bytes, site};
    use crate::timeline::{ReadContext, ReadReason, UseHistory};
    use proptest::prelude::*;

    fn bad(sector_index: u32, observed_key: u8, flip: bool) -> BadSector {
        let s = site(sector_index);
        let expected = sector_bytes(s.sector_lba(), 5, 0);
        let mut observed = sector_bytes(s.sector_lba(), observed_key, 0);
        if flip {
            observed[64] ^= 0x01;
        }
        let flags = if observed_key != 5 {
            CorruptionFlags::BAD_KEY
        } else {
            CorruptionFlags::BAD_DATA
        };
        BadSector::analyze(s, flags, &observed, &expected, &observed).unwrap()
    }

    #[test]
    fn test_compress_ranges() {
        assert_eq!(
            compress_sector_numbers(&[0, 1, 2, 3, 7, 9, 10, 11], 16),
            "0-3,7,9-11 (8 of 16)"
        );
        assert_eq!(compress_sector_numbers(&[5], 8), "5 (1 of 8)");
    }

    #[test]
    fn test_compress_empty_and_full() {
        assert_eq!(
            compress_sector_numbers(&[], 8),
            "All 8 sectors good (based on lba and key that was read)"
        );
        assert_eq!(compress_sector_numbers(&[0, 1, 2, 3], 4), "All 4 sectors bad");
    }

    #[test]
    fn test_duplicate_sector_rejected() {
        let mut kb = BadKeyBlock::new(0x10000, 4096);
        kb.add(bad(1, 6, false)).unwrap();
        let err = kb.add(bad(1, 6, false)).unwrap_err();
        assert!(err.is_consistency_violation());
    }

    #[test]
    fn test_wrong_key_block_rejected() {
        let mut kb = BadKeyBlock::new(0x10000, 4096);
        let err = kb.add(bad(8, 6, false)).unwrap_err();
        assert!(err.is_consistency_violation());
    }

    #[test]
    fn test_classification_for_stale_keys() {
        let mut kb = BadKeyBlock::new(0x10000, 4096);
        kb.add(bad(0, 6, false)).unwrap();
        kb.add(bad(1, 7, false)).unwrap();
        assert_eq!(kb.wrong_keys().into_iter().collect::<Vec<_>>(), vec![6, 7]);
        assert_eq!(kb.classification(), vec!["Invalid key(s) read: 06 07".to_string()]);
    }

    #[test]
    fn test_classification_for_bit_flip() {
        let mut kb = BadKeyBlock::new(0x10000, 4096);
        kb.add(bad(3, 5, true)).unwrap();
        assert_eq!(kb.single_bit_count(), 1);
        assert_eq!(
            kb.classification(),
            vec![
                "At least one single-bit error.".to_string(),
                "At least one partial sector match.".to_string(),
            ]
        );
    }

    #[test]
    fn test_render_incomplete_marker() {
        let mut kb = BadKeyBlock::new(0x10000, 4096);
        kb.add(bad(0, 6, false)).unwrap();
        let text = kb.render(false);
        assert!(text.starts_with("Key block lba: 0x00010000\n"));
        assert!(text.contains("- Bad sectors: (incomplete) 0 (1 of 8)"));

        let text = kb.render(true);
        assert!(text.contains("- Bad sectors: 0 (1 of 8)"));

        kb.add(bad(7, 6, false)).unwrap();
        assert!(kb.last_sector_observed());
        assert!(kb.render(false).contains("- Bad sectors: 0,7 (2 of 8)"));
    }

    fn sector_lines(text: &str) -> usize {
        text.lines().filter(|l| l.starts_with("     sector")).count()
    }

    #[test]
    fn test_render_all_sectors_same_flags() {
        let mut kb = BadKeyBlock::new(0x10000, 4096);
        for i in 0..8 {
            kb.add(bad(i, 6, false)).unwrap();
        }
        assert!(kb.matching_flags());

        let text = kb.render(true);
        assert!(text.contains("   All 8 sectors in this key block are corrupted.\n"));
        assert!(text.contains("   All corruptions are of the same type:\n   ===> bad key\n"));
        assert!(text.contains("   Only the first sector is reported:\n     sector   0 "));
        assert_eq!(sector_lines(&text), 1);
        assert!(!text.contains("Error type counts"));
    }

    #[test]
    fn test_render_all_sectors_mixed_flags() {
        let mut kb = BadKeyBlock::new(0x10000, 4096);
        for i in 0..4 {
            kb.add(bad(i, 6, false)).unwrap();
        }
        for i in 4..8 {
            kb.add(bad(i, 5, true)).unwrap();
        }
        assert!(!kb.matching_flags());
        assert_eq!(
            kb.flag_counts(),
            vec![(CorruptionFlags::BAD_KEY, 4), (CorruptionFlags::BAD_DATA, 4)]
        );

        let text = kb.render(true);
        assert!(text.contains("   Corruption types do not match. Reporting all sectors:\n   Error type counts:\n"));
        let count_lines: Vec<&str> = text.lines().filter(|l| l.starts_with("   ===> ")).collect();
        assert_eq!(count_lines.len(), 2);
        assert!(count_lines[0].starts_with("   ===> bad key:") && count_lines[0].ends_with(" 4"));
        assert!(count_lines[1].starts_with("   ===> bad data:") && count_lines[1].ends_with(" 4"));
        assert_eq!(sector_lines(&text), 8);
    }

    #[test]
    fn test_render_some_sectors_lists_all_of_them() {
        let mut kb = BadKeyBlock::new(0x10000, 4096);
        kb.add(bad(2, 6, false)).unwrap();
        kb.add(bad(3, 6, false)).unwrap();

        let text = kb.render(true);
        assert!(text.contains("   2 of 8 sectors are corrupted. All are reported:\n"));
        assert!(text.contains("   Error type counts:\n"));
        assert_eq!(sector_lines(&text), 2);
    }

    #[test]
    fn test_render_includes_timeline_of_first_sector() {
        let mut kb = BadKeyBlock::new(0x10000, 4096);
        let ctx = ReadContext {
            reason: ReadReason::PreRead,
            history: UseHistory::Unused,
            detected_ms: 1_700_000_000_500,
        };
        kb.add(bad(1, 6, false).with_context(ctx)).unwrap();

        let text = kb.render(true);
        let timeline = text.find("   Timeline:\n").unwrap();
        assert!(timeline < text.find("   - Bad sectors:").unwrap());
        assert!(text.contains("   This key block has not been used (yet) during this run.\n"));
        assert!(text.contains("first found to be corrupted during a read-before-write."));
    }

    proptest! {
        #[test]
        fn prop_compress_counts_every_sector(set in proptest::collection::btree_set(0u32..64, 1..63)) {
            let numbers: Vec<u32> = set.into_iter().collect();
            let text = compress_sector_numbers(&numbers, 64);
            let suffix = format!("({} of 64)", numbers.len());
            prop_assert!(text.ends_with(&suffix));

            let ranges = text.split(' ').next().unwrap();
            let mut expanded = Vec::new();
            for part in ranges.split(',') {
                match part.split_once('-') {
                    Some((a, b)) => expanded.extend(a.parse::<u32>().unwrap()..=b.parse::<u32>().unwrap()),
                    None => expanded.push(part.parse::<u32>().unwrap()),
                }
            }
            prop_assert_eq!(expanded, numbers);
        }
    }
}
