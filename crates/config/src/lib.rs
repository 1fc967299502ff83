//! # Config
//!
//! Plain configuration records shared by every crate of the node, with
//! `Default` values and an environment loader (`RKV_*` variables).
//!
//! | Struct          | Consumed by                                   |
//! |-----------------|-----------------------------------------------|
//! | `StorageConfig` | `engine` (memtable, tables, caches, WAL)      |
//! | `RaftConfig`    | `raft` (timers, batching) and `replica`       |
//! | `NodeConfig`    | `replica` (node identity, tick interval)      |
//!
//! Values are validated with [`NodeConfig::validate`] before a node opens.

use anyhow::{bail, ensure, Result};
use std::path::PathBuf;
use std::str::FromStr;

/// Compression applied to SSTable data and index blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockCompression {
    None,
    #[default]
    Lz4,
}

impl BlockCompression {
    /// On-disk tag stored in the table footer.
    pub fn tag(self) -> u8 {
        match self {
            BlockCompression::None => 0,
            BlockCompression::Lz4 => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(BlockCompression::None),
            1 => Some(BlockCompression::Lz4),
            _ => None,
        }
    }
}

impl FromStr for BlockCompression {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(BlockCompression::None),
            "lz4" => Ok(BlockCompression::Lz4),
            other => bail!("unknown block compression '{}'", other),
        }
    }
}

/// Storage engine tuning.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory of the node's data (`raft/`, `sst/`).
    pub data_dir: PathBuf,
    /// Active memtable size (bytes) at which it is frozen and queued for flush.
    pub memtable_size_threshold: usize,
    /// Number of L0 tables that triggers an L0 -> L1 compaction.
    pub l0_compaction_trigger: usize,
    pub max_levels: usize,
    /// Byte budget of L1; each deeper level is `level_size_multiplier` times larger.
    pub level1_max_bytes: u64,
    pub level_size_multiplier: u64,
    /// Compaction output is split into tables of roughly this size.
    pub target_table_size: u64,
    /// Uncompressed data block size target.
    pub block_size: usize,
    pub compression: BlockCompression,
    pub bloom_false_positive_rate: f64,
    pub block_cache_bytes: usize,
    pub bloom_cache_bytes: usize,
    /// A WAL segment is sealed once it grows past this many bytes.
    pub wal_segment_bytes: u64,
    /// fsync the WAL on every append.
    pub wal_sync: bool,
    /// Read every block of every table on open instead of only footers and
    /// indexes.
    pub verify_tables_on_open: bool,
    /// How far below the highest applied sequence a write may still land.
    /// Older writes are refused; tombstones this far behind may be purged.
    pub late_write_window: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            memtable_size_threshold: 64 * 1024 * 1024,
            l0_compaction_trigger: 4,
            max_levels: 7,
            level1_max_bytes: 256 * 1024 * 1024,
            level_size_multiplier: 10,
            target_table_size: 64 * 1024 * 1024,
            block_size: 4 * 1024,
            compression: BlockCompression::Lz4,
            bloom_false_positive_rate: 0.01,
            block_cache_bytes: 256 * 1024 * 1024,
            bloom_cache_bytes: 32 * 1024 * 1024,
            wal_segment_bytes: 64 * 1024 * 1024,
            wal_sync: true,
            verify_tables_on_open: false,
            late_write_window: 1_000_000,
        }
    }
}

impl StorageConfig {
    /// A small configuration rooted at `dir`, suited to tests: tiny memtable,
    /// tiny blocks, tiny WAL segments, so rotation and compaction happen often.
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: dir.into(),
            memtable_size_threshold: 4 * 1024,
            l0_compaction_trigger: 2,
            max_levels: 4,
            level1_max_bytes: 64 * 1024,
            level_size_multiplier: 4,
            target_table_size: 16 * 1024,
            block_size: 512,
            compression: BlockCompression::Lz4,
            bloom_false_positive_rate: 0.01,
            block_cache_bytes: 256 * 1024,
            bloom_cache_bytes: 64 * 1024,
            wal_segment_bytes: 8 * 1024,
            wal_sync: false,
            verify_tables_on_open: true,
            late_write_window: 4,
        }
    }

    /// Byte budget of `level` (>= 1).
    pub fn level_max_bytes(&self, level: usize) -> u64 {
        let mut budget = self.level1_max_bytes;
        for _ in 1..level {
            budget = budget.saturating_mul(self.level_size_multiplier);
        }
        budget
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.memtable_size_threshold > 0,
            "memtable_size_threshold must be > 0"
        );
        ensure!(
            self.max_levels >= 2,
            "max_levels must be >= 2 (got {})",
            self.max_levels
        );
        ensure!(
            self.l0_compaction_trigger >= 1,
            "l0_compaction_trigger must be >= 1"
        );
        ensure!(self.block_size >= 64, "block_size must be >= 64 bytes");
        ensure!(
            self.bloom_false_positive_rate > 0.0 && self.bloom_false_positive_rate < 1.0,
            "bloom_false_positive_rate must be in (0, 1)"
        );
        ensure!(
            self.level_size_multiplier >= 2,
            "level_size_multiplier must be >= 2"
        );
        ensure!(self.target_table_size > 0, "target_table_size must be > 0");
        ensure!(self.wal_segment_bytes > 0, "wal_segment_bytes must be > 0");
        Ok(())
    }
}

/// Consensus timers and batching. All durations are in ticks; the node's
/// driver converts wall-clock time into ticks (`NodeConfig::tick_interval_ms`).
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub heartbeat_ticks: u64,
    /// Election timeout is drawn uniformly from `[min, max)` on every reset.
    pub election_timeout_min_ticks: u64,
    pub election_timeout_max_ticks: u64,
    pub max_entries_per_append: usize,
    /// A follower whose next index falls below the first retained log entry
    /// is sent a snapshot instead of entries.
    pub snapshot_chunk_bytes: usize,
    /// Take a snapshot once this many entries were applied since the last one.
    pub snapshot_threshold: u64,
    /// Entries kept below the snapshot point for lagging followers.
    pub snapshot_trailing_entries: u64,
    /// Allow lease-based reads on leader and followers.
    pub lease_reads: bool,
    /// Leader steps down if it has not heard from a quorum within an
    /// election timeout.
    pub check_quorum: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_ticks: 1,
            election_timeout_min_ticks: 10,
            election_timeout_max_ticks: 20,
            max_entries_per_append: 256,
            snapshot_chunk_bytes: 1024 * 1024,
            snapshot_threshold: 10_000,
            snapshot_trailing_entries: 1_000,
            lease_reads: true,
            check_quorum: true,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.heartbeat_ticks >= 1, "heartbeat_ticks must be >= 1");
        ensure!(
            self.election_timeout_min_ticks > self.heartbeat_ticks,
            "election timeout ({}) must exceed heartbeat interval ({})",
            self.election_timeout_min_ticks,
            self.heartbeat_ticks
        );
        ensure!(
            self.election_timeout_max_ticks > self.election_timeout_min_ticks,
            "election_timeout_max_ticks must be > election_timeout_min_ticks"
        );
        ensure!(
            self.max_entries_per_append >= 1,
            "max_entries_per_append must be >= 1"
        );
        ensure!(
            self.snapshot_chunk_bytes >= 1,
            "snapshot_chunk_bytes must be >= 1"
        );
        Ok(())
    }
}

/// Identity and wiring of a single replica.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u64,
    /// Initial voters. Ignored once the node has durable membership. A node
    /// missing from this list starts as a non-voter and waits to be added.
    pub peers: Vec<u64>,
    pub tick_interval_ms: u64,
    pub storage: StorageConfig,
    pub raft: RaftConfig,
}

impl NodeConfig {
    pub fn new(node_id: u64, peers: Vec<u64>, storage: StorageConfig) -> Self {
        Self {
            node_id,
            peers,
            tick_interval_ms: 10,
            storage,
            raft: RaftConfig::default(),
        }
    }

    /// Loads a configuration from `RKV_*` environment variables, falling back
    /// to defaults for anything unset.
    ///
    /// | Variable                 | Field                              |
    /// |--------------------------|------------------------------------|
    /// | `RKV_NODE_ID`            | `node_id` (required)               |
    /// | `RKV_PEERS`              | `peers`, comma separated ids       |
    /// | `RKV_DATA_DIR`           | `storage.data_dir`                 |
    /// | `RKV_MEMTABLE_KB`        | `storage.memtable_size_threshold`  |
    /// | `RKV_L0_TRIGGER`         | `storage.l0_compaction_trigger`    |
    /// | `RKV_BLOCK_CACHE_MB`     | `storage.block_cache_bytes`        |
    /// | `RKV_COMPRESSION`        | `storage.compression` (none/lz4)   |
    /// | `RKV_WAL_SYNC`           | `storage.wal_sync`                 |
    /// | `RKV_VERIFY_TABLES`      | `storage.verify_tables_on_open`    |
    /// | `RKV_LATE_WRITE_WINDOW`  | `storage.late_write_window`        |
    /// | `RKV_TICK_MS`            | `tick_interval_ms`                 |
    /// | `RKV_ELECTION_TICKS`     | `raft.election_timeout_min_ticks`  |
    /// | `RKV_SNAPSHOT_THRESHOLD` | `raft.snapshot_threshold`          |
    pub fn from_env() -> Result<Self> {
        let node_id: u64 = match std::env::var("RKV_NODE_ID") {
            Ok(v) => parse_var("RKV_NODE_ID", &v)?,
            Err(_) => bail!("RKV_NODE_ID is required"),
        };
        let peers = env_or("RKV_PEERS", &node_id.to_string())
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| parse_var::<u64>("RKV_PEERS", s.trim()))
            .collect::<Result<Vec<_>>>()?;

        let mut storage = StorageConfig {
            data_dir: PathBuf::from(env_or("RKV_DATA_DIR", "data")),
            ..StorageConfig::default()
        };
        let memtable_kb: usize = parse_var("RKV_MEMTABLE_KB", &env_or("RKV_MEMTABLE_KB", "65536"))?;
        storage.memtable_size_threshold = memtable_kb * 1024;
        storage.l0_compaction_trigger = parse_var("RKV_L0_TRIGGER", &env_or("RKV_L0_TRIGGER", "4"))?;
        let cache_mb: usize =
            parse_var("RKV_BLOCK_CACHE_MB", &env_or("RKV_BLOCK_CACHE_MB", "256"))?;
        storage.block_cache_bytes = cache_mb * 1024 * 1024;
        storage.compression = env_or("RKV_COMPRESSION", "lz4").parse()?;
        storage.wal_sync = parse_var("RKV_WAL_SYNC", &env_or("RKV_WAL_SYNC", "true"))?;
        storage.verify_tables_on_open =
            parse_var("RKV_VERIFY_TABLES", &env_or("RKV_VERIFY_TABLES", "false"))?;
        storage.late_write_window = parse_var(
            "RKV_LATE_WRITE_WINDOW",
            &env_or("RKV_LATE_WRITE_WINDOW", "1000000"),
        )?;

        let mut raft = RaftConfig::default();
        let election: u64 = parse_var("RKV_ELECTION_TICKS", &env_or("RKV_ELECTION_TICKS", "10"))?;
        raft.election_timeout_min_ticks = election;
        raft.election_timeout_max_ticks = election * 2;
        raft.snapshot_threshold = parse_var(
            "RKV_SNAPSHOT_THRESHOLD",
            &env_or("RKV_SNAPSHOT_THRESHOLD", "10000"),
        )?;

        let cfg = Self {
            node_id,
            peers,
            tick_interval_ms: parse_var("RKV_TICK_MS", &env_or("RKV_TICK_MS", "10"))?,
            storage,
            raft,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.node_id != 0, "node_id 0 is reserved");
        ensure!(!self.peers.is_empty(), "peers must not be empty");
        ensure!(!self.peers.contains(&0), "peers {:?} contain reserved id 0", self.peers);
        ensure!(self.tick_interval_ms >= 1, "tick_interval_ms must be >= 1");
        self.storage.validate()?;
        self.raft.validate()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    match raw.parse() {
        Ok(v) => Ok(v),
        Err(_) => bail!("{}: cannot parse '{}'", key, raw),
    }
}
