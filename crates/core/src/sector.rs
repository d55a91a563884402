//! Sector layout
//!
//! Every 512-byte sector written by a validated workload starts with a
//! 32-byte header followed by a 480-byte payload derived from the sector's
//! lba, key and device name:
//!
//! ```text
//! 0x00-0x07  byte offset (lba) of this sector
//! 0x08-0x0f  write timestamp, ms since epoch
//! 0x10       generation key
//! 0x11       checksum of the low 7 timestamp bytes
//! 0x12-0x13  reserved, zero
//! 0x14-0x1b  device-name fingerprint, space padded
//! 0x1c-0x1f  writer process id
//! 0x20-0x1ff payload, 120 words
//! ```
//!
//! All multi-byte fields are big-endian.

use bitflags::bitflags;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{self, Cursor, Write};

/// Physical sector size in bytes
pub const SECTOR_SIZE: usize = 512;
/// 32-bit words per sector
pub const SECTOR_WORDS: usize = SECTOR_SIZE / 4;
/// Header words at the start of every sector
pub const HEADER_WORDS: usize = 8;
/// Payload words per sector
pub const PAYLOAD_WORDS: usize = SECTOR_WORDS - HEADER_WORDS;
/// Header length in bytes
pub const HEADER_SIZE: usize = HEADER_WORDS * 4;

/// Eight-byte device-name fingerprint stored in every sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceName([u8; 8]);

impl DeviceName {
    /// Fingerprint of a name: its first eight bytes, padded with spaces.
    pub fn from_name(name: &str) -> Self {
        let mut bytes = [b' '; 8];
        for (dst, src) in bytes.iter_mut().zip(name.bytes()) {
            *dst = src;
        }
        DeviceName(bytes)
    }

    /// Wrap raw bytes read from a sector.
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        DeviceName(bytes)
    }

    /// Raw fingerprint bytes.
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.0);
        f.write_str(text.trim_end())
    }
}

/// Checksum stored at 0x11: sum of the low seven timestamp bytes, mod 256.
pub fn timestamp_checksum(timestamp_ms: u64) -> u8 {
    timestamp_ms.to_be_bytes()[1..]
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Decoded sector header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorHeader {
    /// Byte offset this sector claims to live at
    pub lba: u64,
    /// Write timestamp, ms since epoch
    pub timestamp_ms: u64,
    /// Generation key byte
    pub key: u8,
    /// Timestamp checksum byte
    pub checksum: u8,
    /// Reserved field, expected zero
    pub reserved: u16,
    /// Device-name fingerprint
    pub name: DeviceName,
    /// Writer process id
    pub pid: u32,
}

impl SectorHeader {
    /// Header for a freshly written sector, with a valid checksum.
    pub fn new(lba: u64, key: u8, name: DeviceName, timestamp_ms: u64, pid: u32) -> Self {
        SectorHeader {
            lba,
            timestamp_ms,
            key,
            checksum: timestamp_checksum(timestamp_ms),
            reserved: 0,
            name,
            pid,
        }
    }

    /// Decode the first 32 bytes of `sector`.
    pub fn read_from(sector: &[u8]) -> io::Result<Self> {
        let mut cur = Cursor::new(sector);
        let lba = cur.read_u64::<BigEndian>()?;
        let timestamp_ms = cur.read_u64::<BigEndian>()?;
        let key = cur.read_u8()?;
        let checksum = cur.read_u8()?;
        let reserved = cur.read_u16::<BigEndian>()?;
        let mut name = [0u8; 8];
        io::Read::read_exact(&mut cur, &mut name)?;
        let pid = cur.read_u32::<BigEndian>()?;
        Ok(SectorHeader {
            lba,
            timestamp_ms,
            key,
            checksum,
            reserved,
            name: DeviceName(name),
            pid,
        })
    }

    /// Encode into the first 32 bytes of `sector`.
    pub fn write_to(&self, sector: &mut [u8]) -> io::Result<()> {
        let mut cur = Cursor::new(sector);
        cur.write_u64::<BigEndian>(self.lba)?;
        cur.write_u64::<BigEndian>(self.timestamp_ms)?;
        cur.write_u8(self.key)?;
        cur.write_u8(self.checksum)?;
        cur.write_u16::<BigEndian>(self.reserved)?;
        cur.write_all(&self.name.0)?;
        cur.write_u32::<BigEndian>(self.pid)?;
        Ok(())
    }

    /// True when the checksum byte matches the timestamp.
    pub fn checksum_ok(&self) -> bool {
        self.checksum == timestamp_checksum(self.timestamp_ms)
    }
}

/// Big-endian 32-bit word `index` of a sector.
pub fn sector_word(sector: &[u8], index: usize) -> u32 {
    let start = index * 4;
    u32::from_be_bytes([
        sector[start],
        sector[start + 1],
        sector[start + 2],
        sector[start + 3],
    ])
}

bitflags! {
    /// Per-sector corruption verdict bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CorruptionFlags: u16 {
        /// Key byte differs from the expected key
        const BAD_KEY = 0x0001;
        /// Timestamp checksum does not match
        const BAD_CHECKSUM = 0x0002;
        /// Lba field differs from the sector's real offset
        const BAD_LBA = 0x0004;
        /// Device-name fingerprint differs
        const BAD_NAME = 0x0008;
        /// Payload differs from the expected pattern
        const BAD_DATA = 0x0010;
        /// Reserved field is not zero
        const BAD_ZERO = 0x0080;
    }
}

impl CorruptionFlags {
    /// Flags as reported: a bad key makes the payload mismatch a foregone
    /// conclusion, so `BAD_DATA` is dropped when `BAD_KEY` is set.
    pub fn normalized(self) -> Self {
        if self.contains(CorruptionFlags::BAD_KEY) {
            self - CorruptionFlags::BAD_DATA
        } else {
            self
        }
    }

    /// Human-readable labels for the set bits, in bit order.
    pub fn labels(self) -> Vec<&'static str> {
        let mut labels = Vec::new();
        for (flag, text) in [
            (CorruptionFlags::BAD_KEY, "bad key"),
            (CorruptionFlags::BAD_CHECKSUM, "bad timestamp checksum"),
            (CorruptionFlags::BAD_LBA, "bad lba"),
            (CorruptionFlags::BAD_NAME, "bad device name"),
            (CorruptionFlags::BAD_DATA, "bad data"),
            (CorruptionFlags::BAD_ZERO, "reserved field not zero"),
        ] {
            if self.contains(flag) {
                labels.push(text);
            }
        }
        labels
    }
}

impl fmt::Display for CorruptionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}: {}", self.bits(), self.labels().join(", "))
    }
}
