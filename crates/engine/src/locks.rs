//! Per-run concurrency control.
//!
//! Guarantees the engine's core invariant: at most one worker advances a
//! given run at a time. Distinct runs proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// Manages per-run drive locks.
///
/// Each run maps to a `Semaphore(1)`. Holding the permit grants exclusive
/// access for one drive pass; it auto-releases on drop.
pub struct RunLockMap {
    locks: Mutex<HashMap<Uuid, Arc<Semaphore>>>,
}

impl Default for RunLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RunLockMap {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the drive lock for a run, waiting if another worker holds it.
    pub async fn acquire(&self, run_id: Uuid) -> OwnedSemaphorePermit {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(run_id)
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        // The semaphore is never closed, so acquisition cannot fail.
        sem.acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("run lock semaphore closed"))
    }

    /// Number of tracked runs (for monitoring).
    pub fn run_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Drop lock entries for runs no worker currently holds.
    pub fn prune_idle(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, sem| sem.available_permits() == 0);
    }
}
