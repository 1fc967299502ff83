//! Durability fence.
//!
//! After a failed durable write the node stops acknowledging anything and
//! probes its storage on a doubling tick backoff until a probe succeeds.

const INITIAL_BACKOFF_TICKS: u64 = 1;
const MAX_BACKOFF_TICKS: u64 = 64;

#[derive(Debug, Default)]
pub(crate) struct Fence {
    reason: Option<String>,
    backoff: u64,
    /// Ticks left before the next probe.
    wait: u64,
    failed_probes: u64,
}

impl Fence {
    pub(crate) fn is_active(&self) -> bool {
        self.reason.is_some()
    }

    pub(crate) fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub(crate) fn failed_probes(&self) -> u64 {
        self.failed_probes
    }

    /// Raises the fence. A fence already up keeps its backoff.
    pub(crate) fn trip(&mut self, reason: String) {
        if self.reason.is_none() {
            self.backoff = INITIAL_BACKOFF_TICKS;
            self.wait = INITIAL_BACKOFF_TICKS;
            self.failed_probes = 0;
        }
        self.reason = Some(reason);
    }

    /// Advances one tick; `true` when a probe is due.
    pub(crate) fn tick(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        self.wait = self.wait.saturating_sub(1);
        self.wait == 0
    }

    pub(crate) fn probe_failed(&mut self, reason: String) {
        self.failed_probes += 1;
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF_TICKS);
        self.wait = self.backoff;
        self.reason = Some(reason);
    }

    pub(crate) fn clear(&mut self) {
        self.reason = None;
        self.backoff = 0;
        self.wait = 0;
    }
}
