//! One memory-mapped key-map segment

use blockdv_core::{DvError, DvResult};
use fs2::FileExt;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU8;

/// A segment file mapped read-write and locked exclusively for the life of
/// the handle. Dropping the handle unmaps the file and releases the lock.
pub(crate) struct Segment {
    path: PathBuf,
    cells: *const AtomicU8,
    map: MmapMut,
    file: File,
}

// SAFETY: `cells` points into `map`, which is owned by the segment and never
// remapped. Every access through it is atomic.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create (or zero) a segment of `len` bytes.
    pub(crate) fn create(device: &str, path: &Path, len: usize) -> DvResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        lock(device, path, &file)?;
        // Truncate first so stale contents never survive a fresh open.
        file.set_len(0)?;
        file.set_len(len as u64)?;
        Self::map(path, file, len)
    }

    /// Map an existing segment, which must be exactly `len` bytes.
    pub(crate) fn reuse(device: &str, path: &Path, len: usize) -> DvResult<Self> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(DvError::fatal(
                    device,
                    format!("key map {} not found; cannot reuse", path.display()),
                ))
            }
            Err(e) => return Err(e.into()),
        };
        lock(device, path, &file)?;
        let found = file.metadata()?.len();
        if found != len as u64 {
            return Err(DvError::fatal(
                device,
                format!(
                    "key map {} holds {} blocks, expected {}; device size changed since it was written",
                    path.display(),
                    found,
                    len
                ),
            ));
        }
        Self::map(path, file, len)
    }

    fn map(path: &Path, file: File, len: usize) -> DvResult<Self> {
        // SAFETY: the file is exclusively locked, so no other cooperating
        // process resizes it while mapped.
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let cells = map.as_mut_ptr() as *const AtomicU8;
        Ok(Segment {
            path: path.to_path_buf(),
            cells,
            map,
            file,
        })
    }

    /// Key bytes as atomic cells.
    pub(crate) fn cells(&self) -> &[AtomicU8] {
        // SAFETY: AtomicU8 has the layout of u8 and the mapping outlives the
        // returned borrow.
        unsafe { std::slice::from_raw_parts(self.cells, self.map.len()) }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn flush(&self) -> DvResult<()> {
        self.map.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

fn lock(device: &str, path: &Path, file: &File) -> DvResult<()> {
    file.try_lock_exclusive().map_err(|e| {
        DvError::fatal(
            device,
            format!("key map {} is in use by another run: {}", path.display(), e),
        )
    })
}
