use super::*;
use std::collections::BTreeMap;
use tempfile::tempdir;

// --------------------- Level 0 -> 1 ---------------------

#[test]
fn l0_compaction_merges_into_level1() -> Result<()> {
    let dir = tempdir()?;
    let engine = open_manual(dir.path())?;

    put(&engine, "a", "1")?;
    put(&engine, "c", "1")?;
    engine.force_flush()?;
    put(&engine, "b", "2")?;
    put(&engine, "c", "2")?;
    engine.force_flush()?;
    assert_eq!(engine.level_table_counts(), vec![2, 0, 0, 0]);

    engine.compact_level(0)?;
    assert_eq!(engine.level_table_counts(), vec![0, 1, 0, 0]);
    assert_eq!(count_sst_files(dir.path()), 1);
    assert_eq!(engine.stats().compactions, 1);

    assert_eq!(
        scan_all(&engine)?,
        vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
            ("c".to_string(), "2".to_string()),
        ]
    );
    Ok(())
}

#[test]
fn compacting_empty_or_bottom_level_is_noop() -> Result<()> {
    let dir = tempdir()?;
    let engine = open_manual(dir.path())?;

    engine.compact_level(0)?;
    put(&engine, "k", "v")?;
    engine.force_flush()?;
    engine.compact_level(3)?;
    engine.compact_level(9)?;
    assert_eq!(engine.level_table_counts(), vec![1, 0, 0, 0]);
    Ok(())
}

#[test]
fn l0_trigger_drives_compact() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(StorageConfig {
        l0_compaction_trigger: 2,
        ..manual_config(dir.path())
    })?;

    put(&engine, "a", "1")?;
    engine.force_flush()?;
    assert_eq!(engine.compaction_backlog(), 0);
    put(&engine, "b", "1")?;
    engine.force_flush()?;
    assert_eq!(engine.compaction_backlog(), 1);
    assert_eq!(engine.stats().compaction_backlog, 1);

    engine.compact()?;
    assert_eq!(engine.compaction_backlog(), 0);
    assert_eq!(engine.level_table_counts()[0], 0);
    Ok(())
}

#[test]
fn background_worker_keeps_l0_under_trigger() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(StorageConfig::for_testing(dir.path()))?;

    let value = "v".repeat(64);
    for i in 0..600 {
        put(&engine, &format!("key{:05}", i % 150), &format!("{}{}", value, i))?;
    }
    engine.wait_for_background();

    assert!(engine.level_table_counts()[0] < engine.config().l0_compaction_trigger);
    assert!(engine.stats().compactions > 0);
    for i in 450..600 {
        assert_eq!(
            get_str(&engine, &format!("key{:05}", i % 150))?,
            Some(format!("{}{}", value, i))
        );
    }
    Ok(())
}

// --------------------- Output shape ---------------------

#[test]
fn output_is_split_into_non_overlapping_tables() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(StorageConfig {
        target_table_size: 2 * 1024,
        ..manual_config(dir.path())
    })?;

    let value = "x".repeat(50);
    for i in 0..300 {
        put(&engine, &format!("k{:04}", i), &value)?;
    }
    engine.force_flush()?;
    engine.compact_level(0)?;

    let v = engine.current_version();
    let level1 = &v.levels[1];
    assert!(level1.len() > 1);
    for pair in level1.windows(2) {
        assert!(pair[0].reader.max_key() < pair[1].reader.min_key());
    }
    assert_eq!(engine.scan(b"", b"")?.len(), 300);
    Ok(())
}

#[test]
fn versions_of_one_key_share_a_table() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(StorageConfig {
        target_table_size: 512,
        ..manual_config(dir.path())
    })?;

    let _pins: Vec<_> = (0..20)
        .map(|_| -> Result<ReadSnapshot> {
            put(&engine, "hot", &"h".repeat(100))?;
            engine.snapshot()
        })
        .collect::<Result<_>>()?;
    put(&engine, "z", "tail")?;
    engine.force_flush()?;
    engine.compact_level(0)?;

    let v = engine.current_version();
    let holding_hot = v.levels[1]
        .iter()
        .filter(|t| t.reader.min_key() <= b"hot".as_slice() && t.reader.max_key() >= b"hot".as_slice())
        .count();
    assert_eq!(holding_hot, 1);
    Ok(())
}

#[test]
fn non_overlapping_table_is_moved_down() -> Result<()> {
    let dir = tempdir()?;
    let engine = open_manual(dir.path())?;

    put(&engine, "k", "v")?;
    engine.force_flush()?;
    engine.compact_level(0)?;
    let id = engine.current_version().levels[1][0].id();

    engine.compact_level(1)?;
    let v = engine.current_version();
    assert_eq!(engine.level_table_counts(), vec![0, 0, 1, 0]);
    assert_eq!(v.levels[2][0].id(), id);
    assert_eq!(count_sst_files(dir.path()), 1);
    assert_eq!(get_str(&engine, "k")?.as_deref(), Some("v"));
    Ok(())
}

#[test]
fn obsolete_tables_outlive_readers_holding_them() -> Result<()> {
    let dir = tempdir()?;
    let engine = open_manual(dir.path())?;

    put(&engine, "a", "1")?;
    engine.force_flush()?;
    put(&engine, "b", "2")?;
    engine.force_flush()?;

    let held = engine.current_version();
    engine.compact_level(0)?;
    assert_eq!(count_sst_files(dir.path()), 3);
    for t in &held.levels[0] {
        assert!(t.path().exists());
    }

    drop(held);
    assert_eq!(count_sst_files(dir.path()), 1);
    Ok(())
}

// --------------------- Correctness ---------------------

#[test]
fn compaction_preserves_visible_state() -> Result<()> {
    let dir = tempdir()?;
    let engine = open_manual(dir.path())?;
    let mut expected: BTreeMap<String, String> = BTreeMap::new();

    for round in 0..6u64 {
        for i in 0..80u64 {
            let key = format!("key{:03}", (i * 7 + round * 13) % 97);
            if (i + round) % 5 == 0 {
                del(&engine, &key)?;
                expected.remove(&key);
            } else {
                let value = format!("r{}i{}", round, i);
                put(&engine, &key, &value)?;
                expected.insert(key, value);
            }
        }
        engine.force_flush()?;
    }

    let before = scan_all(&engine)?;
    let expected: Vec<(String, String)> = expected.into_iter().collect();
    assert_eq!(before, expected);

    engine.compact_level(0)?;
    engine.compact_level(1)?;
    assert_eq!(scan_all(&engine)?, expected);
    for (k, v) in &expected {
        assert_eq!(get_str(&engine, k)?.as_ref(), Some(v));
    }
    Ok(())
}

// --------------------- Tombstones ---------------------

fn apply_put(engine: &Engine, key: &str, value: &str, seq: u64) -> Result<ApplyOutcome> {
    let index = engine.applied_index() + 1;
    engine.apply_put(index, key.as_bytes().to_vec(), value.as_bytes().to_vec(), seq)
}

fn apply_delete(engine: &Engine, key: &str, seq: u64) -> Result<ApplyOutcome> {
    let index = engine.applied_index() + 1;
    engine.apply_delete(index, key.as_bytes().to_vec(), seq)
}

#[test]
fn tombstone_over_lower_sequence_in_memtable_survives_compaction() -> Result<()> {
    let dir = tempdir()?;
    let engine = open_manual(dir.path())?;

    apply_put(&engine, "k", "old", 1)?;
    engine.force_flush()?;
    engine.compact_level(0)?;
    apply_delete(&engine, "k", 9)?;
    engine.force_flush()?;
    // lower sequence applied after the delete: hidden by it
    assert_eq!(apply_put(&engine, "k", "late", 7)?, ApplyOutcome::Written);
    apply_put(&engine, "filler", "x", 20)?;
    assert!(engine.get(b"k")?.is_none());

    engine.compact_level(0)?;
    assert!(engine.get(b"k")?.is_none());
    engine.force_flush()?;
    engine.compact_level(0)?;
    assert!(engine.get(b"k")?.is_none());
    Ok(())
}

#[test]
fn tombstone_over_lower_sequence_in_unmerged_table_survives_compaction() -> Result<()> {
    let dir = tempdir()?;
    let engine = open_manual(dir.path())?;

    // a wide table on L2 so that L1 -> L2 is a real merge
    apply_put(&engine, "a", "1", 1)?;
    apply_put(&engine, "z", "1", 2)?;
    engine.force_flush()?;
    engine.compact_level(0)?;
    engine.compact_level(1)?;
    assert_eq!(engine.level_table_counts()[2], 1);

    apply_delete(&engine, "k", 9)?;
    engine.force_flush()?;
    engine.compact_level(0)?;
    apply_put(&engine, "k", "late", 7)?;
    engine.force_flush()?;
    apply_put(&engine, "filler", "x", 20)?;

    // the L0 table holding k@7 is not part of this merge
    engine.compact_level(1)?;
    assert_eq!(engine.level_table_counts()[0], 1);
    assert!(engine.get(b"k")?.is_none());
    Ok(())
}

#[test]
fn tombstone_within_late_write_window_is_kept() -> Result<()> {
    let dir = tempdir()?;
    let engine = open_manual(dir.path())?;

    put(&engine, "k", "v")?;
    del(&engine, "k")?;
    engine.force_flush()?;
    engine.compact_level(0)?;
    assert_eq!(engine.current_version().levels[1][0].reader.len(), 1);

    // still inside the window, so the write lands and stays hidden
    assert_eq!(apply_put(&engine, "k", "late", 1)?, ApplyOutcome::Written);
    assert!(engine.get(b"k")?.is_none());
    engine.force_flush()?;
    engine.compact_level(0)?;
    assert!(engine.get(b"k")?.is_none());
    Ok(())
}

#[test]
fn write_below_late_floor_is_refused() -> Result<()> {
    let dir = tempdir()?;
    let engine = open_manual(dir.path())?;

    apply_put(&engine, "a", "1", 10)?;
    assert_eq!(engine.late_floor(), Some(6));
    assert_eq!(apply_put(&engine, "k", "v", 6)?, ApplyOutcome::TooLate { floor: 6 });
    assert_eq!(apply_delete(&engine, "a", 2)?, ApplyOutcome::TooLate { floor: 6 });
    assert_eq!(engine.applied_index(), 3);
    assert!(engine.get(b"k")?.is_none());
    assert_eq!(get_str(&engine, "a")?.as_deref(), Some("1"));

    assert_eq!(apply_put(&engine, "k", "v", 7)?, ApplyOutcome::Written);
    assert_eq!(get_str(&engine, "k")?.as_deref(), Some("v"));
    Ok(())
}
