/// Leader-side view of one follower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Progress {
    /// Next index to send. Advanced optimistically on send.
    pub next: u64,
    /// Highest index known to be stored on the follower.
    pub matched: u64,
    /// Highest broadcast round the follower answered.
    pub acked_round: u64,
    /// Answered anything since the last quorum check.
    pub recent_active: bool,
    /// Snapshot transfer in flight: (snapshot index, next byte offset).
    pub snapshot: Option<(u64, u64)>,
}

impl Progress {
    pub fn new(next: u64) -> Self {
        Self {
            next,
            matched: 0,
            acked_round: 0,
            recent_active: true,
            snapshot: None,
        }
    }

    /// Records a successful append up to `index`.
    pub fn on_match(&mut self, index: u64) {
        if index > self.matched {
            self.matched = index;
        }
        self.next = self.next.max(index + 1);
    }

    /// Backs `next` off after a rejection, never below what already matched.
    /// A hint below `matched` means the follower lost its log (it was wiped
    /// for a resync) and has to be matched again from the hint.
    pub fn on_reject(&mut self, hint: u64) {
        if hint < self.matched {
            self.matched = hint;
            self.next = hint + 1;
            return;
        }
        let candidate = self.next.saturating_sub(1).min(hint + 1);
        self.next = candidate.max(self.matched + 1).max(1);
    }
}
