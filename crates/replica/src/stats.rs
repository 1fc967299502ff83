//! Counters and health signals for the monitoring layer. Read only.

use engine::EngineStats;
use raft::{NodeId, Role};
use std::collections::BTreeSet;
use std::time::Duration;

/// Weight of the newest sample in the moving average.
const EWMA_ALPHA: f64 = 0.2;

/// Proposal-to-apply latency on the leader.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CommitLatency {
    pub commits: u64,
    pub last_us: u64,
    pub avg_us: f64,
}

impl CommitLatency {
    pub(crate) fn record(&mut self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.avg_us = if self.commits == 0 {
            us as f64
        } else {
            EWMA_ALPHA * us as f64 + (1.0 - EWMA_ALPHA) * self.avg_us
        };
        self.last_us = us;
        self.commits += 1;
    }
}

#[derive(Debug, Clone)]
pub struct ReplicaStats {
    pub id: NodeId,
    pub role: Role,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub first_index: u64,
    pub last_index: u64,
    /// Entries still held in the log.
    pub log_length: u64,
    pub snapshot_index: u64,
    pub retention_floor: u64,
    pub voters: BTreeSet<NodeId>,
    pub joint: bool,
    pub fenced: bool,
    pub failed_probes: u64,
    /// The node lost its vote record and no longer votes or campaigns.
    pub vote_lost: bool,
    pub pending_proposals: usize,
    pub pending_reads: usize,
    pub commit_latency: CommitLatency,
    pub engine: EngineStats,
}

impl ReplicaStats {
    pub fn block_cache_hit_ratio(&self) -> f64 {
        self.engine.block_cache.hit_ratio()
    }

    pub fn bloom_cache_hit_ratio(&self) -> f64 {
        self.engine.bloom_cache.hit_ratio()
    }

    pub fn compaction_backlog(&self) -> usize {
        self.engine.compaction_backlog
    }

    pub fn health(&self) -> Health {
        Health {
            id: self.id,
            role: self.role,
            term: self.term,
            leader: self.leader,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            serving: !self.fenced,
        }
    }
}

/// The minimal signal a health check needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Health {
    pub id: NodeId,
    pub role: Role,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    /// `false` while the durability fence is up.
    pub serving: bool,
}
