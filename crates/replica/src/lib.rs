//! # Replica - replicated RiptideKV node
//!
//! Binds the [`raft`] consensus core to the durable log in [`wal`] and the
//! LSM state machine in [`engine`]. Every committed entry is applied on one
//! thread in log order, so replicas that applied the same prefix hold the
//! same data.
//!
//! ## Architecture
//!
//! ```text
//!            Client (any thread)
//!               |  Request
//!               v
//! ┌──────────────────────────────────────────────────────────┐
//! │ driver.rs (apply actor thread)                           │
//! │   tick / inbox / requests ─▶ Replica                     │
//! │                                |                         │
//! │       RaftNode<DiskStorage> ── Ready ──▶ apply to Engine │
//! │         |  log, hard state, snapshot     answer requests │
//! │         v                                                │
//! │       raft/wal/*.seg  raft/hard_state  raft/snapshot     │
//! └──────────────────────────────────────────────────────────┘
//!               |  Message
//!               v
//!           Transport
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module        | Purpose                                                   |
//! |---------------|-----------------------------------------------------------|
//! | [`replica`]   | `Replica` actor: proposals, reads, apply, fence handling  |
//! | [`disk`]      | `DiskStorage`: raft `Storage` over the segmented WAL      |
//! | `snapfile`    | checksummed snapshot image file, chunked reads            |
//! | [`snapshot`]  | snapshot scheduling and the log retention floor           |
//! | `fence`       | durability fence with probe backoff                       |
//! | [`stats`]     | counters and health for monitoring                        |
//! | [`transport`] | `Transport` trait, in-process `LocalNetwork`              |
//! | [`driver`]    | threaded `Node` and the blocking `Client`                 |
//! | [`error`]     | `ReplicaError` classes returned to callers                |
//!
//! ## On-disk layout
//!
//! Under `StorageConfig::data_dir`: `sst/` holds the engine's tables and
//! manifest, `raft/` the log segments, the hard state and the latest
//! snapshot image.

pub mod disk;
pub mod driver;
pub mod error;
mod fence;
pub mod replica;
mod snapfile;
pub mod snapshot;
pub mod stats;
pub mod transport;

pub use disk::{DiskStorage, WriteFault};
pub use driver::{Client, Node, DEFAULT_TIMEOUT};
pub use error::{ConsistencyError, ReplicaError, Result};
pub use replica::{pending, raft_dir, Pending, Replica, Reply, Write, RAFT_DIR};
pub use snapshot::{RetentionFloor, SnapshotManager};
pub use stats::{CommitLatency, Health, ReplicaStats};
pub use transport::{LocalNetwork, LocalTransport, Transport};
