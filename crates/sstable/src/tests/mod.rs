
use crate::*;
use anyhow::Result;
use memtable::Memtable;
use std::path::Path;
use std::sync::Arc;

/// Versions as `(key, value or tombstone, seq)`.
pub(crate) type Rows<'a> = &'a [(&'a [u8], Option<&'a [u8]>, u64)];

/// Borrows string literals as a byte [`Rows`].
pub(crate) fn strs<'a>(entries: &[(&'a str, Option<&'a str>, u64)]) -> Vec<(&'a [u8], Option<&'a [u8]>, u64)> {
    entries
        .iter()
        .map(|&(k, v, seq)| (k.as_bytes(), v.map(str::as_bytes), seq))
        .collect()
}

pub(crate) fn memtable_of(entries: Rows<'_>) -> Memtable {
    let mem = Memtable::new(1);
    for &(key, val, seq) in entries {
        match val {
            Some(v) => mem.put(key.to_vec(), v.to_vec(), seq),
            None => mem.delete(key.to_vec(), seq),
        };
    }
    mem
}

pub(crate) fn small_blocks() -> TableOptions {
    TableOptions {
        block_size: 64,
        ..TableOptions::default()
    }
}

/// Writes `entries` to `dir/name` and opens the result as table `id`.
pub(crate) fn write_and_open(
    dir: &Path,
    name: &str,
    id: u64,
    entries: Rows<'_>,
    opts: TableOptions,
) -> Result<Arc<SSTableReader>> {
    let path = dir.join(name);
    SSTableWriter::write_from_memtable(&path, &memtable_of(entries), opts)?;
    Ok(Arc::new(SSTableReader::open(&path, id)?))
}
