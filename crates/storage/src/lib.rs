//! Persistent per-block key store
//!
//! One byte per key block records the block's generation key and busy flag.
//! The byte array of a device is split into power-of-two segments, each
//! persisted as a memory-mapped file so the state survives process death.
//!
//! - `layout`: segment/offset arithmetic and segment file naming
//! - `segment`: one memory-mapped, exclusively locked segment file
//! - `key_store`: the `KeyStore` handle owned by a device or file anchor

pub mod key_store;
pub mod layout;
mod segment;

pub use key_store::{BusyAcquire, KeyStore, StoreOptions, SweepCounts};
pub use layout::{segment_path, SegmentLayout};
