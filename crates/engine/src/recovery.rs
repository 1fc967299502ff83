/// Cold start: rebuilding the committed table set from the manifest.
///
/// Everything not named in the manifest is garbage from an interrupted
/// flush or compaction: `.tmp` files and unlisted `.sst` files are deleted.
/// A listed table that is missing or fails verification is a corrupt
/// committed artifact and fails the open.
use anyhow::Result;
use arc_swap::ArcSwap;
use config::StorageConfig;
use memtable::Memtable;
use parking_lot::Mutex;
use sstable::{BlockCache, BloomFilterCache, CorruptionError, SSTableReader};
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::manifest::{parse_table_file_name, Manifest};
use crate::snapshot::SnapshotRegistry;
use crate::version::{Table, Version};
use crate::{Shared, TABLE_DIR};

/// Removes leftover `*.tmp` files from interrupted table or manifest writes.
pub(crate) fn cleanup_tmp_files(sst_dir: &Path) {
    if let Ok(entries) = std::fs::read_dir(sst_dir) {
        for entry in entries.flatten() {
            let p = entry.path();
            if let Some(name) = p.file_name().and_then(|n| n.to_str()) {
                if name.ends_with(".tmp") {
                    tracing::debug!(file = name, "removing leftover temp file");
                    let _ = std::fs::remove_file(&p);
                }
            }
        }
    }
}

/// Deletes `.sst` files that the manifest does not list.
fn cleanup_orphans(sst_dir: &Path, manifest: &Manifest) -> Result<()> {
    for entry in std::fs::read_dir(sst_dir)?.flatten() {
        let p = entry.path();
        let Some(name) = p.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(".sst") && !manifest.contains(name) {
            tracing::warn!(file = name, "deleting table not in manifest");
            let _ = std::fs::remove_file(&p);
        }
    }
    Ok(())
}

pub(crate) fn recover(config: StorageConfig) -> Result<Shared> {
    let sst_dir = config.data_dir.join(TABLE_DIR);
    std::fs::create_dir_all(&sst_dir)?;
    cleanup_tmp_files(&sst_dir);

    let manifest = Manifest::load_or_create(&sst_dir)?;
    cleanup_orphans(&sst_dir, &manifest)?;

    let mut version = Version::empty(Arc::new(Memtable::new(1)), config.max_levels);
    let mut max_id = 0u64;
    let mut max_seq = manifest.last_sequence;

    for meta in &manifest.tables {
        let path = sst_dir.join(&meta.file_name);
        let Some(id) = parse_table_file_name(&meta.file_name) else {
            return Err(CorruptionError::new(&path, "unrecognised table file name").into());
        };
        if !path.exists() {
            return Err(CorruptionError::new(&path, "table listed in manifest is missing").into());
        }
        if meta.level >= config.max_levels {
            return Err(CorruptionError::new(
                &path,
                format!("level {} beyond max_levels {}", meta.level, config.max_levels),
            )
            .into());
        }
        let reader = SSTableReader::open(&path, id)?;
        if config.verify_tables_on_open {
            reader.verify()?;
        }
        max_id = max_id.max(id);
        max_seq = max_seq.max(reader.max_seq());
        version.push_loaded(Arc::new(Table::new(reader, meta.level)));
    }

    tracing::info!(
        dir = %sst_dir.display(),
        tables = version.table_count(),
        flushed_index = manifest.flushed_index,
        last_sequence = max_seq,
        "recovered table set"
    );

    let next_file_id = manifest.next_file_id.max(max_id + 1);
    let flushed_index = manifest.flushed_index;
    let max_levels = config.max_levels;
    Ok(Shared {
        block_cache: Arc::new(BlockCache::new(config.block_cache_bytes)),
        bloom_cache: BloomFilterCache::new(config.bloom_cache_bytes),
        config,
        sst_dir,
        version: ArcSwap::from_pointee(version),
        write_lock: Mutex::new(()),
        install_lock: Mutex::new(()),
        background_lock: Mutex::new(()),
        manifest: Mutex::new(manifest),
        snapshots: SnapshotRegistry::new(max_seq),
        next_file_id: AtomicU64::new(next_file_id),
        next_memtable_id: AtomicU64::new(2),
        last_sequence: AtomicU64::new(max_seq),
        applied_index: AtomicU64::new(flushed_index),
        flushed_index: AtomicU64::new(flushed_index),
        compact_pointer: Mutex::new(vec![Vec::new(); max_levels]),
        flushes: AtomicU64::new(0),
        compactions: AtomicU64::new(0),
        background_error: Mutex::new(None),
    })
}
