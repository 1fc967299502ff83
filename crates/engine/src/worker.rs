//! Background flush / compaction thread.
//!
//! The apply path only ever enqueues [`Task`]s; the worker drains frozen
//! memtables into L0 tables and then compacts until no level is over budget.
//! A failure (disk full, I/O error) leaves the published table set intact;
//! the worker records the error, backs off and retries, so a transient
//! condition heals without the apply path noticing anything but a growing
//! queue of immutable memtables.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use crate::Shared;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

pub(crate) enum Task {
    Flush,
    Compact,
    /// Answered once every earlier task has been handled.
    Barrier(Sender<()>),
    Shutdown,
}

pub(crate) fn run(shared: Arc<Shared>, rx: Receiver<Task>) {
    tracing::debug!(dir = %shared.sst_dir.display(), "engine worker started");
    while let Ok(task) = rx.recv() {
        match task {
            Task::Flush | Task::Compact => {
                if !work_until_done(&shared, &rx) {
                    break;
                }
            }
            Task::Barrier(done) => {
                let _ = done.send(());
            }
            Task::Shutdown => break,
        }
    }
    tracing::debug!("engine worker stopped");
}

/// Flushes and compacts, retrying with backoff on failure. Returns `false`
/// if a shutdown arrived meanwhile.
fn work_until_done(shared: &Shared, rx: &Receiver<Task>) -> bool {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let result = {
            let _bg = shared.background_lock.lock();
            background_pass(shared)
        };
        match result {
            Ok(()) => {
                *shared.background_error.lock() = None;
                return true;
            }
            Err(e) => {
                let msg = format!("{:#}", e);
                tracing::warn!(error = %msg, backoff_ms = backoff.as_millis() as u64, "background work failed; retrying");
                *shared.background_error.lock() = Some(msg);
            }
        }
        match rx.recv_timeout(backoff) {
            Ok(Task::Shutdown) | Err(RecvTimeoutError::Disconnected) => return false,
            Ok(Task::Barrier(done)) => {
                let _ = done.send(());
            }
            Ok(Task::Flush | Task::Compact) | Err(RecvTimeoutError::Timeout) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

fn background_pass(shared: &Shared) -> anyhow::Result<()> {
    while shared.flush_oldest()? {}
    shared.compact_while_needed()
}
