use super::*;
use crate::manifest::{parse_table_file_name, table_file_name};
use tempfile::tempdir;

fn meta(name: &str, level: usize, min: &[u8], max: &[u8]) -> TableMeta {
    TableMeta {
        file_name: name.to_string(),
        level,
        min_key: min.to_vec(),
        max_key: max.to_vec(),
    }
}

#[test]
fn missing_manifest_loads_empty() -> Result<()> {
    let dir = tempdir()?;
    let m = Manifest::load_or_create(dir.path())?;
    assert!(m.tables.is_empty());
    assert_eq!(m.flushed_index, 0);
    assert_eq!(m.next_file_id, 1);
    Ok(())
}

#[test]
fn save_and_reload() -> Result<()> {
    let dir = tempdir()?;
    let mut m = Manifest::load_or_create(dir.path())?;
    m.add(meta("0000000001.sst", 1, b"", b"\xffzz"));
    m.add(meta("0000000002.sst", 0, b"a", b"m"));
    m.flushed_index = 42;
    m.last_sequence = 40;
    m.next_file_id = 3;
    m.save()?;

    let loaded = Manifest::load_or_create(dir.path())?;
    assert_eq!(loaded.tables, m.tables);
    assert_eq!(loaded.flushed_index, 42);
    assert_eq!(loaded.last_sequence, 40);
    assert_eq!(loaded.next_file_id, 3);
    assert!(!dir.path().join("MANIFEST.tmp").exists());
    Ok(())
}

#[test]
fn add_keeps_l0_newest_first() -> Result<()> {
    let dir = tempdir()?;
    let mut m = Manifest::load_or_create(dir.path())?;
    m.add(meta("0000000001.sst", 0, b"a", b"b"));
    m.add(meta("0000000005.sst", 2, b"a", b"b"));
    m.add(meta("0000000002.sst", 0, b"a", b"b"));

    let l0: Vec<&str> = m.tables_at(0).map(|t| t.file_name.as_str()).collect();
    assert_eq!(l0, vec!["0000000002.sst", "0000000001.sst"]);
    assert_eq!(m.tables.last().map(|t| t.level), Some(2));
    Ok(())
}

#[test]
fn remove_files_and_contains() -> Result<()> {
    let dir = tempdir()?;
    let mut m = Manifest::load_or_create(dir.path())?;
    m.add(meta("0000000001.sst", 0, b"a", b"b"));
    m.add(meta("0000000002.sst", 0, b"c", b"d"));

    m.remove_files(&["0000000001.sst".to_string()]);
    assert!(!m.contains("0000000001.sst"));
    assert!(m.contains("0000000002.sst"));
    Ok(())
}

#[test]
fn unknown_tag_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    fs::write(dir.path().join(MANIFEST_FILENAME), "bogus:1\n")?;
    let err = Manifest::load_or_create(dir.path()).unwrap_err();
    assert!(err.to_string().contains("unknown tag"));
    Ok(())
}

#[test]
fn bad_hex_key_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    fs::write(
        dir.path().join(MANIFEST_FILENAME),
        "L0:0000000001.sst 6g 61\n",
    )?;
    assert!(Manifest::load_or_create(dir.path()).is_err());
    Ok(())
}

#[test]
fn comments_and_blank_lines_are_ignored() -> Result<()> {
    let dir = tempdir()?;
    fs::write(
        dir.path().join(MANIFEST_FILENAME),
        "# header\n\nflushed_index:7\nL1:0000000003.sst 61 7a\n",
    )?;
    let m = Manifest::load_or_create(dir.path())?;
    assert_eq!(m.flushed_index, 7);
    assert_eq!(m.tables, vec![meta("0000000003.sst", 1, b"a", b"z")]);
    Ok(())
}

#[test]
fn table_file_names_round_trip() {
    assert_eq!(table_file_name(17), "0000000017.sst");
    assert_eq!(parse_table_file_name("0000000017.sst"), Some(17));
    assert_eq!(parse_table_file_name("MANIFEST"), None);
    assert_eq!(parse_table_file_name("abc.sst"), None);
}

#[test]
fn engine_commits_every_table_to_manifest() -> Result<()> {
    let dir = tempdir()?;
    let engine = open_manual(dir.path())?;

    put(&engine, "a", "1")?;
    engine.force_flush()?;
    put(&engine, "b", "2")?;
    engine.force_flush()?;
    engine.compact_level(0)?;

    let m = Manifest::load_or_create(&dir.path().join(TABLE_DIR))?;
    assert_eq!(m.tables.len(), 1);
    assert_eq!(m.tables[0].level, 1);
    assert_eq!(m.tables[0].min_key, b"a".to_vec());
    assert_eq!(m.tables[0].max_key, b"b".to_vec());
    assert_eq!(m.flushed_index, 2);
    assert_eq!(m.last_sequence, 2);
    Ok(())
}
