//! Pending lba to file assignment

use blockdv_core::{DvError, DvResult};

/// A file's slice of its anchor's key map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileExtent {
    /// File path
    pub path: String,
    /// Anchor byte offset of the file's first block
    pub start_lba: u64,
    /// File size in bytes
    pub size: u64,
}

impl FileExtent {
    /// Anchor offset one past the file's last byte.
    pub fn end_lba(&self) -> u64 {
        self.start_lba + self.size
    }

    /// True if the anchor offset falls inside the file.
    pub fn contains(&self, lba: u64) -> bool {
        lba >= self.start_lba && lba < self.end_lba()
    }
}

/// Match pending anchor lbas to their owning files.
///
/// Lbas are sorted and matched by a single forward pass over the files in
/// ascending start-lba order. Returns `(file index, anchor lba)` pairs in lba
/// order, where the index refers to `files` as given.
///
/// # Errors
///
/// `ConsistencyViolation` if any lba is not inside a file.
pub fn assign_pending_to_files(pending: &[u64], files: &[FileExtent]) -> DvResult<Vec<(usize, u64)>> {
    let mut lbas = pending.to_vec();
    lbas.sort_unstable();

    let mut order: Vec<usize> = (0..files.len()).collect();
    order.sort_by_key(|&i| files[i].start_lba);

    let mut assigned = Vec::with_capacity(lbas.len());
    let mut cursor = 0;
    for lba in lbas {
        while cursor < order.len() && files[order[cursor]].end_lba() <= lba {
            cursor += 1;
        }
        match order.get(cursor) {
            Some(&index) if files[index].contains(lba) => assigned.push((index, lba)),
            _ => {
                return Err(DvError::consistency(format!(
                    "busy block at anchor lba 0x{:08x} belongs to no file",
                    lba
                )))
            }
        }
    }
    Ok(assigned)
}
