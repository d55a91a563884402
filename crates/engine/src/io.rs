//! Collaborator I/O capabilities
//!
//! The validation engine never performs raw I/O or pattern generation on
//! its own; it consumes them through two traits:
//!
//! - [`BlockIo`]: positional reads and writes on a device or file
//! - [`DataPattern`]: the deterministic payload of a sector
//!
//! On top of those, [`compare_sectors`] and [`compare_block_pattern`] produce
//! one verdict per sector of a block.

use blockdv_core::{
    BlockKey, CorruptionFlags, DeviceName, SectorHeader, HEADER_SIZE, SECTOR_SIZE,
};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use xxhash_rust::xxh3::xxh3_64;

/// Positional block I/O on one device or file.
pub trait BlockIo: Send + Sync {
    /// Read `len` bytes at byte offset `lba`.
    fn read_block(&self, lba: u64, len: usize) -> io::Result<Vec<u8>>;

    /// Write `data` at byte offset `lba`.
    fn write_block(&self, lba: u64, data: &[u8]) -> io::Result<()>;

    /// Flush writes to stable storage.
    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Deterministic sector payload generator.
pub trait DataPattern: Send + Sync {
    /// Fill the 480-byte payload of the sector at `lba` written with `key`
    /// on the device named `name`.
    fn fill_payload(&self, lba: u64, key: BlockKey, name: DeviceName, payload: &mut [u8]);
}

/// Reference payload: xxh3 of (lba, key, name) seeding an xorshift stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct XxhPattern;

impl DataPattern for XxhPattern {
    fn fill_payload(&self, lba: u64, key: BlockKey, name: DeviceName, payload: &mut [u8]) {
        let mut seed = [0u8; 17];
        seed[..8].copy_from_slice(&lba.to_be_bytes());
        seed[8] = key.value();
        seed[9..].copy_from_slice(name.as_bytes());
        let mut state = xxh3_64(&seed) | 1;
        for word in payload.chunks_mut(4) {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let bytes = (state as u32).to_be_bytes();
            word.copy_from_slice(&bytes[..word.len()]);
        }
    }
}

/// Bytes of one sector as written by a validated workload.
pub fn build_sector(
    pattern: &dyn DataPattern,
    header: &SectorHeader,
) -> io::Result<[u8; SECTOR_SIZE]> {
    let mut sector = [0u8; SECTOR_SIZE];
    header.write_to(&mut sector)?;
    pattern.fill_payload(
        header.lba,
        BlockKey::new(header.key),
        header.name,
        &mut sector[HEADER_SIZE..],
    );
    Ok(sector)
}

/// Bytes of a whole block, one key per key block.
pub fn build_block(
    pattern: &dyn DataPattern,
    lba: u64,
    keys: &[BlockKey],
    key_block_size: u32,
    name: DeviceName,
    timestamp_ms: u64,
    pid: u32,
) -> io::Result<Vec<u8>> {
    let sectors_per_key = key_block_size as usize / SECTOR_SIZE;
    let mut data = Vec::with_capacity(keys.len() * key_block_size as usize);
    for (i, key) in keys.iter().enumerate() {
        for s in 0..sectors_per_key {
            let sector_lba = lba + ((i * sectors_per_key + s) * SECTOR_SIZE) as u64;
            let header = SectorHeader::new(sector_lba, key.value(), name, timestamp_ms, pid);
            data.extend_from_slice(&build_sector(pattern, &header)?);
        }
    }
    Ok(data)
}

/// Verdict for one sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorVerdict {
    /// Sector index in the block
    pub sector: u32,
    /// Empty when the sector is good
    pub flags: CorruptionFlags,
}

impl SectorVerdict {
    /// True when the sector matched.
    pub fn is_ok(&self) -> bool {
        self.flags.is_empty()
    }
}

/// Compare block bytes read at `lba` against the expected pattern.
///
/// `expected_keys` holds one key per key block. Timestamp and process id are
/// not compared; the checksum must still be consistent.
pub fn compare_sectors(
    pattern: &dyn DataPattern,
    data: &[u8],
    lba: u64,
    expected_keys: &[BlockKey],
    key_block_size: u32,
    name: DeviceName,
) -> io::Result<Vec<SectorVerdict>> {
    let sectors_per_key = key_block_size as usize / SECTOR_SIZE;
    let mut expected_payload = [0u8; SECTOR_SIZE - HEADER_SIZE];
    let mut verdicts = Vec::with_capacity(data.len() / SECTOR_SIZE);

    for (index, sector) in data.chunks_exact(SECTOR_SIZE).enumerate() {
        let key = expected_keys
            .get(index / sectors_per_key)
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "fewer keys than key blocks"))?;
        let sector_lba = lba + (index * SECTOR_SIZE) as u64;
        let header = SectorHeader::read_from(sector)?;

        let mut flags = CorruptionFlags::empty();
        if header.key != key.value() {
            flags |= CorruptionFlags::BAD_KEY;
        }
        if header.lba != sector_lba {
            flags |= CorruptionFlags::BAD_LBA;
        }
        if header.name != name {
            flags |= CorruptionFlags::BAD_NAME;
        }
        if !header.checksum_ok() {
            flags |= CorruptionFlags::BAD_CHECKSUM;
        }
        if header.reserved != 0 {
            flags |= CorruptionFlags::BAD_ZERO;
        }
        pattern.fill_payload(sector_lba, key, name, &mut expected_payload);
        if sector[HEADER_SIZE..] != expected_payload[..] {
            flags |= CorruptionFlags::BAD_DATA;
        }

        verdicts.push(SectorVerdict {
            sector: index as u32,
            flags: flags.normalized(),
        });
    }
    Ok(verdicts)
}

/// Read a block and compare it against the expected pattern.
pub fn compare_block_pattern(
    io: &dyn BlockIo,
    pattern: &dyn DataPattern,
    lba: u64,
    len: usize,
    expected_keys: &[BlockKey],
    key_block_size: u32,
    name: DeviceName,
) -> io::Result<Vec<SectorVerdict>> {
    let data = io.read_block(lba, len)?;
    compare_sectors(pattern, &data, lba, expected_keys, key_block_size, name)
}

/// In-memory device, mainly for tests and dry runs.
#[derive(Debug)]
pub struct MemDevice {
    bytes: RwLock<Vec<u8>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemDevice {
    /// Zero-filled device of `size` bytes.
    pub fn new(size: usize) -> Self {
        MemDevice {
            bytes: RwLock::new(vec![0; size]),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent read fail.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail without touching the data.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Overwrite raw bytes, bypassing validation.
    pub fn poke(&self, offset: usize, data: &[u8]) {
        self.bytes.write()[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Xor one byte, bypassing validation.
    pub fn flip(&self, offset: usize, mask: u8) {
        self.bytes.write()[offset] ^= mask;
    }
}

fn range(size: usize, lba: u64, len: usize) -> io::Result<std::ops::Range<usize>> {
    let start = usize::try_from(lba)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "lba overflows usize"))?;
    let end = start
        .checked_add(len)
        .filter(|end| *end <= size)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range 0x{:x}+{} beyond device of {} bytes", lba, len, size),
            )
        })?;
    Ok(start..end)
}

impl BlockIo for MemDevice {
    fn read_block(&self, lba: u64, len: usize) -> io::Result<Vec<u8>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected read failure"));
        }
        let bytes = self.bytes.read();
        let range = range(bytes.len(), lba, len)?;
        Ok(bytes[range].to_vec())
    }

    fn write_block(&self, lba: u64, data: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        let mut bytes = self.bytes.write();
        let range = range(bytes.len(), lba, data.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }
}

/// File or raw device accessed with `pread`/`pwrite`.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
}

impl FileDevice {
    /// Open an existing file or device for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(FileDevice { file })
    }

    /// Create a file of `size` bytes.
    pub fn create(path: impl AsRef<Path>, size: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(FileDevice { file })
    }
}

impl BlockIo for FileDevice {
    fn read_block(&self, lba: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, lba)?;
        Ok(buf)
    }

    fn write_block(&self, lba: u64, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, lba)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}
