mod compaction_tests;
mod manifest_tests;
mod snapshot_tests;

use crate::*;
use anyhow::Result;
use config::StorageConfig;
use std::fs;
use std::path::Path;

/// Tiny tables, but rotation and compaction only when a test asks for them.
pub(crate) fn manual_config(dir: &Path) -> StorageConfig {
    StorageConfig {
        memtable_size_threshold: 1024 * 1024,
        l0_compaction_trigger: 100,
        ..StorageConfig::for_testing(dir)
    }
}

pub(crate) fn open_manual(dir: &Path) -> Result<Engine> {
    Engine::open(manual_config(dir))
}

/// Applies a put as the next log entry; the entry's index doubles as its
/// sequence.
pub(crate) fn put(engine: &Engine, key: &str, value: &str) -> Result<u64> {
    let index = engine.applied_index() + 1;
    engine.apply_put(index, key.as_bytes().to_vec(), value.as_bytes().to_vec(), index)?;
    Ok(index)
}

pub(crate) fn del(engine: &Engine, key: &str) -> Result<u64> {
    let index = engine.applied_index() + 1;
    engine.apply_delete(index, key.as_bytes().to_vec(), index)?;
    Ok(index)
}

pub(crate) fn get_str(engine: &Engine, key: &str) -> Result<Option<String>> {
    Ok(engine
        .get(key.as_bytes())?
        .map(|(_, v)| String::from_utf8_lossy(&v).into_owned()))
}

pub(crate) fn scan_all(engine: &Engine) -> Result<Vec<(String, String)>> {
    Ok(engine
        .scan(b"", b"")?
        .into_iter()
        .map(|(k, v)| {
            (
                String::from_utf8_lossy(&k).into_owned(),
                String::from_utf8_lossy(&v).into_owned(),
            )
        })
        .collect())
}

pub(crate) fn count_sst_files(dir: &Path) -> usize {
    fs::read_dir(dir.join(TABLE_DIR))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|ext| ext == "sst")
                .unwrap_or(false)
        })
        .count()
}
