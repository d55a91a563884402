//! Generation keys
//!
//! Every block carries a small cyclic generation key that is embedded in each
//! of its sectors and incremented on every rewrite.
//!
//! # Encoding
//!
//! One byte per block in the persisted key map:
//!
//! ```text
//! bit 7      busy (write issued, not yet confirmed)
//! bits 0..6  key: 0 = never written, 1..=126 cyclic, 127 = error
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

const BUSY_BIT: u8 = 0x80;
const KEY_MASK: u8 = 0x7f;

/// Generation key of a block.
///
/// Valid written keys cycle through `1..=126`. `0` marks a block that was
/// never written and `127` marks a block permanently excluded from
/// validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockKey(u8);

impl BlockKey {
    /// Key of a block that has never been written.
    pub const NEVER_WRITTEN: BlockKey = BlockKey(0);
    /// Terminal key of a block that is permanently excluded.
    pub const ERROR: BlockKey = BlockKey(127);
    /// Highest key produced by [`BlockKey::increment`].
    pub const MAX_VALID: u8 = 126;

    /// Build a key from its 7-bit value. The busy bit is discarded.
    pub const fn new(raw: u8) -> Self {
        BlockKey(raw & KEY_MASK)
    }

    /// The 7-bit key value.
    pub const fn value(self) -> u8 {
        self.0
    }

    /// True for the terminal error key.
    pub const fn is_error(self) -> bool {
        self.0 == Self::ERROR.0
    }

    /// True when the block has been written at least once and is not in error.
    pub const fn is_written(self) -> bool {
        self.0 != 0 && !self.is_error()
    }

    /// Next generation key.
    ///
    /// `0` and `126` both advance to `1`. The error key never moves.
    pub const fn increment(self) -> Self {
        if self.is_error() {
            return self;
        }
        if self.0 >= Self::MAX_VALID {
            BlockKey(1)
        } else {
            BlockKey(self.0 + 1)
        }
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

/// Decoded key-map byte: a key plus the busy flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeyEntry {
    /// Generation key
    pub key: BlockKey,
    /// Write issued but not confirmed
    pub busy: bool,
}

impl KeyEntry {
    /// Entry of a block never written and not busy.
    pub const EMPTY: KeyEntry = KeyEntry {
        key: BlockKey::NEVER_WRITTEN,
        busy: false,
    };

    /// Create an entry.
    pub const fn new(key: BlockKey, busy: bool) -> Self {
        KeyEntry { key, busy }
    }

    /// Decode a persisted key-map byte.
    pub const fn from_byte(byte: u8) -> Self {
        KeyEntry {
            key: BlockKey::new(byte),
            busy: byte & BUSY_BIT != 0,
        }
    }

    /// Encode as `(busy << 7) | key`.
    pub const fn to_byte(self) -> u8 {
        let busy = if self.busy { BUSY_BIT } else { 0 };
        busy | self.key.value()
    }

    /// Same key, busy flag cleared.
    pub const fn cleared(self) -> Self {
        KeyEntry {
            key: self.key,
            busy: false,
        }
    }
}
