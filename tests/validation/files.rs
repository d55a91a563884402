//! File anchors backed by real files

use crate::{Rig, KBS};
use blockdv::{
    BlockIo, BlockKey, DataPattern, FileAnchor, FileDevice, KeyEntry, ReadOutcome,
    ValidationConfig, WriteOutcome, XxhPattern,
};
use std::sync::Arc;
use std::thread;

const FILES: u64 = 3;
const FILE_BLOCKS: u64 = 16;

fn file_path(rig: &Rig, index: u64) -> String {
    rig.dir
        .path()
        .join(format!("fsd1.dir/vdb_f{:04}.file", index + 1))
        .display()
        .to_string()
}

/// Anchor over `FILES` files laid out back to back in the key map.
fn open_anchor(rig: &Rig, config: &ValidationConfig, create: bool) -> FileAnchor {
    if create {
        std::fs::create_dir_all(rig.dir.path().join("fsd1.dir")).unwrap();
    }
    let pattern: Arc<dyn DataPattern> = Arc::new(XxhPattern);
    let mut anchor = FileAnchor::open(
        config,
        "fsd1",
        FILES * FILE_BLOCKS * KBS as u64,
        pattern,
        Arc::clone(&rig.aggregator),
    )
    .unwrap();
    for i in 0..FILES {
        let path = file_path(rig, i);
        let size = FILE_BLOCKS * KBS as u64;
        let file = if create {
            FileDevice::create(&path, size).unwrap()
        } else {
            FileDevice::open(&path).unwrap()
        };
        let io: Arc<dyn BlockIo> = Arc::new(file);
        anchor.add_file(&path, i * size, size, io).unwrap();
    }
    anchor
}

#[test]
fn test_file_writers_then_corruption_and_restart() {
    let rig = Rig::new();
    let anchor = Arc::new(open_anchor(&rig, &rig.config(false), true));
    anchor.recover().unwrap();

    // One writer per file
    let handles: Vec<_> = (0..FILES as usize)
        .map(|file| {
            let anchor = Arc::clone(&anchor);
            thread::spawn(move || {
                for _ in 0..2 {
                    for block in 0..FILE_BLOCKS {
                        let outcome = anchor.write_block(file, block * KBS as u64, KBS).unwrap();
                        assert!(matches!(outcome, WriteOutcome::Written(_)));
                    }
                }
                for block in 0..FILE_BLOCKS {
                    assert_eq!(
                        anchor.validate_block(file, block * KBS as u64, KBS).unwrap(),
                        ReadOutcome::Valid
                    );
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(anchor.store().census().known, FILES * FILE_BLOCKS);
    assert_eq!(anchor.counters().writes(BlockKey::new(2)), FILES * FILE_BLOCKS);

    // Damage key block 3 of the second file behind the anchor's back
    let victim = FileDevice::open(file_path(&rig, 1)).unwrap();
    let lba = 3 * KBS as u64;
    let mut data = victim.read_block(lba, KBS as usize).unwrap();
    data[KBS as usize - 1] ^= 0x20;
    victim.write_block(lba, &data).unwrap();

    let report = match anchor.validate_block(1, lba, KBS).unwrap() {
        ReadOutcome::Corrupted { report: Some(report), .. } => report,
        other => panic!("unexpected {:?}", other),
    };
    let header = format!(
        "Corrupted data block for fsd=fsd1,file={}; file lba: 0x{:08x} xfersize={}",
        file_path(&rig, 1),
        lba,
        KBS
    );
    assert!(report.contains(&header));
    assert!(rig.buffer.contents().contains(&header));

    let anchor = Arc::try_unwrap(anchor).unwrap();
    anchor.close().unwrap();

    // Clean restart: keys and the error mark survive
    let anchor = open_anchor(&rig, &rig.config(true), false);
    let summary = anchor.recover().unwrap();
    assert!(summary.records.is_empty());
    assert_eq!(
        anchor.store().get(FILE_BLOCKS + 3).unwrap(),
        KeyEntry::new(BlockKey::ERROR, false)
    );
    assert_eq!(anchor.validate_block(1, lba, KBS).unwrap(), ReadOutcome::Skipped);
    assert_eq!(anchor.validate_block(2, lba, KBS).unwrap(), ReadOutcome::Valid);
}
