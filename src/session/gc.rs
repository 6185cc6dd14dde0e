//! Garbage collection of expired sessions

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::entity::now;
use super::persistence::{seconds_ago, SessionBackend};
use super::store::{ChecksumLedger, SessionStore};

/// Removes sessions idle for longer than the inactivity timeout
pub struct GarbageCollector {
    store: Arc<SessionStore>,
    ledger: Arc<ChecksumLedger>,
    backend: Option<Arc<dyn SessionBackend>>,
    inactivity_timeout: i64,
    probability: f64,
}

impl GarbageCollector {
    pub fn new(
        store: Arc<SessionStore>,
        ledger: Arc<ChecksumLedger>,
        backend: Option<Arc<dyn SessionBackend>>,
        inactivity_timeout: i64,
        probability: f64,
    ) -> Self {
        Self {
            store,
            ledger,
            backend,
            inactivity_timeout,
            probability: probability.clamp(0.0, 1.0),
        }
    }

    /// Roll against the configured probability
    pub fn should_collect(&self) -> bool {
        self.probability > 0.0 && rand::random::<f64>() < self.probability
    }

    /// Sweep if the probability gate passes, returning the removed count
    pub fn collect(&self) -> usize {
        if !self.should_collect() {
            return 0;
        }
        self.sweep(now())
    }

    /// Unconditional sweep as of `now`
    pub fn sweep(&self, now: i64) -> usize {
        if self.inactivity_timeout <= 0 {
            return 0;
        }

        let mut removed = 0;
        for (key, shared) in self.store.snapshot() {
            let mut session = shared.lock();
            if session.inactivity(now) <= self.inactivity_timeout {
                continue;
            }

            self.store.remove_if_same(&key, &shared);
            self.ledger.forget(&key);
            if !session.is_destroyed() {
                session.destroy();
            }
            drop(session);

            if let Some(backend) = &self.backend {
                if let Err(e) = backend.remove(&key) {
                    warn!(session = %key, "failed to delete expired session file: {e}");
                }
            }
            removed += 1;
        }

        removed += self.purge_stored();

        if removed > 0 {
            info!(removed, "expired sessions collected");
        } else {
            debug!("garbage collection found nothing to remove");
        }
        removed
    }

    /// Delete stored sessions that expired while not resident
    fn purge_stored(&self) -> usize {
        let Some(backend) = &self.backend else {
            return 0;
        };

        let stale = match backend.modified_before(seconds_ago(self.inactivity_timeout)) {
            Ok(ids) => ids,
            Err(e) => {
                warn!("failed to scan stored sessions: {e}");
                return 0;
            }
        };

        stale
            .into_iter()
            .filter(|id| !self.store.contains(id))
            .filter(|id| match backend.remove(id) {
                Ok(()) => true,
                Err(e) => {
                    warn!(session = %id, "failed to delete stale session file: {e}");
                    false
                }
            })
            .count()
    }
}

// ============================================================================
// TESTS
// ============================================================================
