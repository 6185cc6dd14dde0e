//! Concurrent session store and checksum ledger
//!
//! Both are shared by the session manager, the persistence sweep and the
//! garbage collector. Sweeps work on a snapshot so no map shard lock is held
//! while a session mutex is taken.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::entity::{Session, SharedSession};

/// Session ID to session, at most one entry per ID
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<String, SharedSession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Insert or replace the entry for `id`, returning the previous one
    pub fn insert(&self, id: &str, session: SharedSession) -> Option<SharedSession> {
        self.sessions.insert(id.to_string(), session)
    }

    /// Wrap and insert a plain session
    pub fn insert_owned(&self, id: &str, session: Session) -> SharedSession {
        let shared = Arc::new(Mutex::new(session));
        self.insert(id, Arc::clone(&shared));
        shared
    }

    /// Insert `session` unless `id` is already present
    ///
    /// Returns the resident entry and whether it is the one just inserted.
    pub fn insert_if_absent(&self, id: &str, session: Session) -> (SharedSession, bool) {
        let mut inserted = false;
        let resident = Arc::clone(
            self.sessions
                .entry(id.to_string())
                .or_insert_with(|| {
                    inserted = true;
                    Arc::new(Mutex::new(session))
                })
                .value(),
        );
        (resident, inserted)
    }

    /// Whether `id` still maps to `session`
    pub fn is_current(&self, id: &str, session: &SharedSession) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), session))
    }

    pub fn get(&self, id: &str) -> Option<SharedSession> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn remove(&self, id: &str) -> Option<SharedSession> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Remove `id` only if it still maps to `session`
    pub fn remove_if_same(&self, id: &str, session: &SharedSession) -> bool {
        self.sessions
            .remove_if(id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    /// Point-in-time copy of all entries for sweeping
    pub fn snapshot(&self) -> Vec<(String, SharedSession)> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Session ID to the checksum last written to storage
#[derive(Debug, Default)]
pub struct ChecksumLedger {
    entries: DashMap<String, String>,
}

impl ChecksumLedger {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<String> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    /// Whether `checksum` differs from the recorded one (missing counts as changed)
    pub fn is_changed(&self, id: &str, checksum: &str) -> bool {
        self.entries
            .get(id)
            .map_or(true, |entry| entry.value() != checksum)
    }

    pub fn record(&self, id: &str, checksum: String) {
        self.entries.insert(id.to_string(), checksum);
    }

    pub fn forget(&self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
