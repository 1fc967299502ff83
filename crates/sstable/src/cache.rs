//! Shared read caches.
//!
//! | Cache              | Key                   | Value               |
//! |--------------------|-----------------------|---------------------|
//! | [`BlockCache`]     | `(table_id, offset)`  | decoded data block  |
//! | [`BloomFilterCache`] | `table_id`          | table bloom filter  |
//!
//! Both are byte-budgeted LRU maps. Neither is authoritative: a miss always
//! falls back to the table file, and evicting everything changes only speed.

use anyhow::Result;
use bloom::BloomFilter;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::format::Block;

/// Hit/miss counters of one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub bytes: usize,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Slot<V> {
    value: Arc<V>,
    charge: usize,
    tick: u64,
}

/// LRU by access tick: `map` holds the values, `order` maps tick -> key so the
/// oldest entry is `order`'s first element.
struct Lru<K, V> {
    map: HashMap<K, Slot<V>>,
    order: BTreeMap<u64, K>,
    next_tick: u64,
    used: usize,
    capacity: usize,
}

impl<K: Hash + Eq + Clone, V> Lru<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            used: 0,
            capacity,
        }
    }

    fn get(&mut self, key: &K) -> Option<Arc<V>> {
        let tick = self.next_tick;
        let slot = self.map.get_mut(key)?;
        self.order.remove(&slot.tick);
        slot.tick = tick;
        self.order.insert(tick, key.clone());
        self.next_tick += 1;
        Some(Arc::clone(&slot.value))
    }

    fn insert(&mut self, key: K, value: Arc<V>, charge: usize) {
        if charge > self.capacity {
            return;
        }
        self.remove(&key);
        while self.used + charge > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            if let Some(evicted) = self.map.remove(&oldest) {
                self.used -= evicted.charge;
            }
        }
        let tick = self.next_tick;
        self.next_tick += 1;
        self.order.insert(tick, key.clone());
        self.map.insert(
            key,
            Slot {
                value,
                charge,
                tick,
            },
        );
        self.used += charge;
    }

    fn remove(&mut self, key: &K) {
        if let Some(slot) = self.map.remove(key) {
            self.order.remove(&slot.tick);
            self.used -= slot.charge;
        }
    }

    fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        let doomed: Vec<K> = self.map.keys().filter(|k| !keep(k)).cloned().collect();
        for k in doomed {
            self.remove(&k);
        }
    }
}

/// Decoded data blocks shared across all tables.
pub struct BlockCache {
    inner: Mutex<Lru<(u64, u64), Block>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlockCache {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Lru::new(capacity_bytes)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns block `block_id` of `table_id`, running `load` on a miss and
    /// caching its result. The lock is not held while `load` runs.
    pub fn get_block<F>(&self, table_id: u64, block_id: u64, load: F) -> Result<Arc<Block>>
    where
        F: FnOnce() -> Result<Block>,
    {
        if let Some(block) = self.inner.lock().get(&(table_id, block_id)) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(block);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let block = Arc::new(load()?);
        let charge = block.charge();
        self.inner
            .lock()
            .insert((table_id, block_id), Arc::clone(&block), charge);
        Ok(block)
    }

    /// Drops every block of `table_id` (the table was deleted).
    pub fn evict_table(&self, table_id: u64) {
        self.inner.lock().retain(|(t, _)| *t != table_id);
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: inner.map.len(),
            bytes: inner.used,
        }
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache").field("stats", &self.stats()).finish()
    }
}

/// Bloom filters of open tables, loaded lazily from the table file.
pub struct BloomFilterCache {
    inner: Mutex<Lru<u64, BloomFilter>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BloomFilterCache {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Lru::new(capacity_bytes)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the filter of `table_id`, running `load` on a miss.
    pub fn filter<F>(&self, table_id: u64, load: F) -> Result<Arc<BloomFilter>>
    where
        F: FnOnce() -> Result<BloomFilter>,
    {
        if let Some(bf) = self.inner.lock().get(&table_id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(bf);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let bf = Arc::new(load()?);
        let charge = bf.encoded_len();
        self.inner.lock().insert(table_id, Arc::clone(&bf), charge);
        Ok(bf)
    }

    /// `false` guarantees `key` is absent from `table_id`; `true` must be
    /// verified against the table.
    pub fn might_contain<F>(&self, table_id: u64, key: &[u8], load: F) -> Result<bool>
    where
        F: FnOnce() -> Result<BloomFilter>,
    {
        Ok(self.filter(table_id, load)?.might_contain(key))
    }

    pub fn evict_table(&self, table_id: u64) {
        self.inner.lock().remove(&table_id);
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: inner.map.len(),
            bytes: inner.used,
        }
    }
}

impl std::fmt::Debug for BloomFilterCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilterCache")
            .field("stats", &self.stats())
            .finish()
    }
}
