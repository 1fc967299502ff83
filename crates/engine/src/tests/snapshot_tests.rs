use super::*;
use tempfile::tempdir;

#[test]
fn snapshot_is_repeatable() -> Result<()> {
    let dir = tempdir()?;
    let engine = open_manual(dir.path())?;

    put(&engine, "k", "before")?;
    let snap = engine.snapshot()?;
    put(&engine, "k", "after")?;
    put(&engine, "new", "x")?;

    assert_eq!(snap.sequence(), 1);
    assert_eq!(snap.get(b"k")?, Some((1, b"before".to_vec())));
    assert!(snap.get(b"new")?.is_none());
    assert_eq!(snap.scan(b"", b"")?.len(), 1);
    assert_eq!(get_str(&engine, "k")?.as_deref(), Some("after"));
    Ok(())
}

#[test]
fn pinned_version_survives_compaction() -> Result<()> {
    let dir = tempdir()?;
    let engine = open_manual(dir.path())?;

    put(&engine, "k", "v1")?;
    let snap = engine.snapshot()?;
    put(&engine, "k", "v2")?;
    engine.force_flush()?;
    put(&engine, "k", "v3")?;
    engine.force_flush()?;
    engine.compact_level(0)?;

    assert_eq!(snap.get(b"k")?, Some((1, b"v1".to_vec())));
    assert_eq!(engine.get_at(b"k", 1)?, Some((1, b"v1".to_vec())));
    assert_eq!(get_str(&engine, "k")?.as_deref(), Some("v3"));

    // v2 shares the newest stripe with v3 and is gone
    let v = engine.current_version();
    assert_eq!(v.levels[1][0].reader.len(), 2);
    Ok(())
}

#[test]
fn tombstone_kept_while_snapshot_sees_older_version() -> Result<()> {
    let dir = tempdir()?;
    let engine = open_manual(dir.path())?;

    put(&engine, "k", "v1")?;
    let snap = engine.snapshot()?;
    del(&engine, "k")?;
    engine.force_flush()?;
    engine.compact_level(0)?;

    assert_eq!(snap.get(b"k")?, Some((1, b"v1".to_vec())));
    assert!(engine.get(b"k")?.is_none());
    Ok(())
}

#[test]
fn unpinned_history_is_collapsed() -> Result<()> {
    let dir = tempdir()?;
    let engine = open_manual(dir.path())?;

    put(&engine, "a", "1")?;
    put(&engine, "b", "1")?;
    engine.force_flush()?;
    put(&engine, "a", "2")?;
    del(&engine, "b")?;
    engine.force_flush()?;
    // move the late-write floor past the tombstone
    for _ in 0..4 {
        put(&engine, "z", "later")?;
    }
    engine.compact_level(0)?;

    // the tombstone and every older version dropped
    let v = engine.current_version();
    assert_eq!(v.levels[1].len(), 1);
    assert_eq!(v.levels[1][0].reader.len(), 1);
    assert_eq!(
        scan_all(&engine)?,
        vec![
            ("a".to_string(), "2".to_string()),
            ("z".to_string(), "later".to_string())
        ]
    );
    Ok(())
}

#[test]
fn dropping_snapshot_releases_pin() -> Result<()> {
    let dir = tempdir()?;
    let engine = open_manual(dir.path())?;

    put(&engine, "k", "v")?;
    let a = engine.snapshot()?;
    let b = engine.snapshot()?;
    let stats = engine.stats();
    assert_eq!(stats.pinned_snapshots, 2);
    assert_eq!(stats.oldest_pinned, Some(1));

    drop(a);
    assert_eq!(engine.stats().pinned_snapshots, 1);
    drop(b);
    assert_eq!(engine.stats().pinned_snapshots, 0);
    assert_eq!(engine.stats().oldest_pinned, None);
    Ok(())
}

#[test]
fn snapshot_at_below_watermark_is_refused() -> Result<()> {
    let dir = tempdir()?;
    let engine = open_manual(dir.path())?;

    put(&engine, "k", "v1")?;
    put(&engine, "k", "v2")?;
    engine.force_flush()?;
    engine.compact_level(0)?;

    let err = engine.snapshot_at(1).unwrap_err();
    assert!(is_snapshot_too_old(&err));
    let snap = engine.snapshot_at(2)?;
    assert_eq!(snap.get(b"k")?, Some((2, b"v2".to_vec())));
    Ok(())
}

#[test]
fn snapshot_pinned_early_stays_readable_below_watermark() -> Result<()> {
    let dir = tempdir()?;
    let engine = open_manual(dir.path())?;

    put(&engine, "k", "v1")?;
    let early = engine.snapshot_at(1)?;
    put(&engine, "k", "v2")?;
    engine.force_flush()?;
    engine.compact_level(0)?;
    assert!(engine.gc_watermark() > early.sequence());

    // a second pin at an already pinned sequence is fine
    let again = engine.snapshot_at(1)?;
    assert_eq!(again.get(b"k")?, Some((1, b"v1".to_vec())));
    assert_eq!(early.scan(b"", b"")?, vec![(b"k".to_vec(), b"v1".to_vec())]);
    Ok(())
}
