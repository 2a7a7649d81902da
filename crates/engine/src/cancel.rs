//! Per-run cancellation tokens.
//!
//! Each active run holds a `CancelToken`. Cancellation flips the flag; the
//! activity observes it at its next suspension point. The terminal event is
//! written by the coordinator, not by the token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

/// A cancellation flag checked by activities between awaits.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Tracks the active token per run.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<Uuid, CancelToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the token for a run. The same token is reused across
    /// drive passes so a cancel during a wait still lands.
    pub fn token(&self, run_id: Uuid) -> CancelToken {
        self.tokens.lock().entry(run_id).or_default().clone()
    }

    /// Signal cancellation. Returns true if the run had an active token.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        if let Some(token) = self.tokens.lock().get(&run_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Drop the token once a run terminates.
    pub fn remove(&self, run_id: Uuid) {
        self.tokens.lock().remove(&run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn map_reuses_token_per_run() {
        let map = CancelMap::new();
        let run_id = Uuid::new_v4();
        let first = map.token(run_id);
        assert!(map.cancel(run_id));
        // The token handed out earlier observes the cancel.
        assert!(first.is_cancelled());

        map.remove(run_id);
        assert!(!map.cancel(run_id));
        // A fresh token after removal starts clean.
        assert!(!map.token(run_id).is_cancelled());
    }
}
