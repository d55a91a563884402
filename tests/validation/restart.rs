//! Restarts: clean close, crash, configuration from disk

use crate::{open_device, Rig, KBS};
use blockdv::{
    BlockIo, BlockKey, Decision, DeviceRegistry, KeyEntry, ReadOutcome, ValidationConfig,
};

fn write_config(rig: &Rig, reuse: bool) -> ValidationConfig {
    let path = rig.dir.path().join(if reuse { "reuse.toml" } else { "fresh.toml" });
    let text = format!(
        "map_dir = {:?}\nsegment_shift = 5\nkey_block_size = {}\nreuse_maps = {}\nmax_bad_blocks = 2\n",
        rig.dir.path().join("maps").display().to_string(),
        KBS,
        reuse
    );
    std::fs::write(&path, text).unwrap();
    ValidationConfig::load(&path).unwrap()
}

#[test]
fn test_clean_restart_from_toml_config() {
    let rig = Rig::new();
    let fresh = write_config(&rig, false);
    assert_eq!(fresh.segment_shift, 5);

    let device = rig.device(&fresh, "sd1", rig.create_lun("sd1"));
    device.recover().unwrap();
    for block in 0..40u64 {
        device.write_block(block * KBS as u64, KBS).unwrap();
    }
    assert_eq!(device.store().segment_count(), 8);
    device.close().unwrap();

    let reuse = write_config(&rig, true);
    let device = rig.device(&reuse, "sd1", rig.open_lun("sd1"));
    let summary = device.recover().unwrap();
    assert_eq!(summary.counts.busy, 0);
    assert_eq!(summary.counts.known, 40);
    assert!(summary.records.is_empty());
    assert_eq!(device.validate_block(0, 40 * KBS).unwrap(), ReadOutcome::Valid);

    // Zero one sector in the middle of key block 10
    let io = rig.open_lun("sd1");
    io.write_block(10 * KBS as u64 + 1024, &[0u8; 512]).unwrap();
    match device.validate_block(8 * KBS as u64, 4 * KBS).unwrap() {
        ReadOutcome::Corrupted { bad_key_blocks: 1, report: Some(report) } => {
            assert!(report.contains("Key block lba: 0x0000a000"));
            assert!(report.contains("1 of 4 key blocks are corrupted."));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(device.store().get(10).unwrap(), KeyEntry::new(BlockKey::ERROR, false));
    assert!(rig.buffer.contents().starts_with("Time of first corruption:"));
    device.close().unwrap();

    // The error key survives the next restart
    let device = rig.device(&reuse, "sd1", rig.open_lun("sd1"));
    assert_eq!(device.recover().unwrap().counts.bad, 1);
    assert_eq!(device.validate_block(8 * KBS as u64, 2 * KBS).unwrap(), ReadOutcome::Valid);
    assert_eq!(device.validate_block(10 * KBS as u64, KBS).unwrap(), ReadOutcome::Skipped);
}

#[test]
fn test_registry_recovers_every_device_after_crash() {
    let rig = Rig::new();
    let config = rig.config(false);

    {
        let registry = DeviceRegistry::new();
        for sd in ["sd1", "sd2"] {
            let device = registry
                .register(rig.device(&config, sd, rig.create_lun(sd)))
                .unwrap();
            device.write_block(0, KBS).unwrap();
            device.write_block(KBS as u64, KBS).unwrap();
        }
        // sd1: pending write never reaches the disk; sd2: it does
        let sd1 = registry.get("sd1").unwrap();
        let _lost = sd1.begin_write(0, KBS).unwrap().unwrap();
        let sd2 = registry.get("sd2").unwrap();
        let ticket = sd2.begin_write(KBS as u64, KBS).unwrap().unwrap();
        let data = blockdv::engine::build_block(
            &blockdv::XxhPattern,
            KBS as u64,
            ticket.new_keys(),
            KBS,
            blockdv::DeviceName::from_name("sd2"),
            7,
            1,
        )
        .unwrap();
        rig.open_lun("sd2").write_block(KBS as u64, &data).unwrap();
        // Registry and devices dropped without close
    }

    let reuse = rig.config(true);
    let registry = DeviceRegistry::new();
    for sd in ["sd1", "sd2"] {
        registry
            .register(open_device(&reuse, sd, &rig.lun(sd), rig.open_lun(sd), &rig.aggregator))
            .unwrap();
    }
    assert_eq!(registry.names(), vec!["sd1".to_string(), "sd2".to_string()]);

    let results = registry.recover_all().unwrap();
    assert_eq!(results.len(), 2);
    for (sd, summary) in &results {
        assert_eq!(summary.records.len(), 1);
        let expected = if sd == "sd1" { Decision::RolledBack } else { Decision::Complete };
        assert_eq!(summary.records[0].decision, expected, "{}", sd);
    }
    assert_eq!(
        registry.get("sd1").unwrap().store().get(0).unwrap(),
        KeyEntry::new(BlockKey::new(1), false)
    );
    assert_eq!(
        registry.get("sd2").unwrap().store().get(1).unwrap(),
        KeyEntry::new(BlockKey::new(2), false)
    );
    assert!(rig.buffer.contents().is_empty());
}
