//! Session manager
//!
//! Composes the store, the pool, persistence and garbage collection for one
//! application and owns their background loops.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::entity::{now, SessionOptions, SharedSession};
use super::gc::GarbageCollector;
use super::persistence::{PersistenceManager, SessionBackend};
use super::pool::SessionPool;
use super::store::{ChecksumLedger, SessionStore};
use crate::background::BackgroundLoop;
use crate::config::SessionSettings;
use crate::error::{EngineError, EngineResult};
use crate::token::{generate_session_id, is_valid_session_id};

/// Lookups retried when the entry is swapped out from under `find`
const FIND_ATTEMPTS: usize = 3;

pub struct SessionManager {
    settings: SessionSettings,
    store: Arc<SessionStore>,
    ledger: Arc<ChecksumLedger>,
    pool: Arc<SessionPool>,
    persistence: Option<Arc<PersistenceManager>>,
    collector: Arc<GarbageCollector>,
    loops: Mutex<Vec<BackgroundLoop>>,
}

impl SessionManager {
    /// Build a manager; with a backend, stored sessions are restored first
    pub fn new(
        settings: SessionSettings,
        pool: Arc<SessionPool>,
        backend: Option<Arc<dyn SessionBackend>>,
    ) -> EngineResult<Self> {
        let store = Arc::new(SessionStore::new());
        let ledger = Arc::new(ChecksumLedger::new());

        let persistence = backend.clone().map(|backend| {
            Arc::new(PersistenceManager::new(
                store.clone(),
                ledger.clone(),
                backend,
                settings.inactivity_timeout,
            ))
        });
        if let Some(persistence) = &persistence {
            persistence.restore()?;
        }

        let collector = Arc::new(GarbageCollector::new(
            store.clone(),
            ledger.clone(),
            backend,
            settings.inactivity_timeout,
            settings.gc_probability,
        ));

        Ok(Self {
            settings,
            store,
            ledger,
            pool,
            persistence,
            collector,
            loops: Mutex::new(Vec::new()),
        })
    }

    /// Start the persistence sweep and, if configured, the background collector
    pub fn start_background(&self, label: &str) -> EngineResult<()> {
        let mut loops = self.loops.lock();
        if !loops.is_empty() {
            return Ok(());
        }

        if let Some(persistence) = &self.persistence {
            let persistence = Arc::clone(persistence);
            loops.push(BackgroundLoop::spawn(
                &format!("{label}-persist"),
                self.settings.persist_interval(),
                move || {
                    persistence.tick();
                },
            )?);
        }

        if let Some(interval) = self.settings.gc_interval() {
            let collector = Arc::clone(&self.collector);
            loops.push(BackgroundLoop::spawn(&format!("{label}-gc"), interval, move || {
                collector.collect();
            })?);
        }

        info!(app = %label, loops = loops.len(), "session background loops started");
        Ok(())
    }

    /// Stop background loops, flushing dirty sessions one last time
    pub fn shutdown(&self) {
        let loops: Vec<_> = self.loops.lock().drain(..).collect();
        for background in loops {
            background.stop();
        }
        if let Some(persistence) = &self.persistence {
            let stats = persistence.tick();
            debug!(?stats, "final persistence flush");
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Create, start and attach a new session
    ///
    /// # Arguments
    /// * `options` - Per-session overrides; unset fields fall back to the
    ///   manager's settings and a missing ID is generated on start
    ///
    /// # Returns
    /// The attached session, already started. An explicit ID that is not
    /// alphanumeric is rejected with `InvalidArgument`.
    pub fn create(&self, options: SessionOptions) -> EngineResult<SharedSession> {
        if let Some(id) = &options.id {
            if !is_valid_session_id(id) {
                return Err(EngineError::InvalidArgument(format!("invalid session id: {id}")));
            }
        }

        let mut session = self.pool.acquire();
        session.initialize(options, &self.settings);
        session.start();

        let shared = Arc::new(Mutex::new(session));
        self.attach(&shared)?;
        Ok(shared)
    }

    /// Insert or replace the store entry under the session's ID
    pub fn attach(&self, session: &SharedSession) -> EngineResult<()> {
        let id = session
            .lock()
            .id()
            .map(str::to_string)
            .ok_or(EngineError::SessionNotStarted)?;
        self.store.insert(&id, Arc::clone(session));
        Ok(())
    }

    /// Look up a resumable session, reloading it from storage if needed
    ///
    /// # Arguments
    /// * `id` - Session ID carried by the request cookie
    ///
    /// # Returns
    /// The resident session with its activity refreshed, or `None` when the
    /// ID is unknown or the session is past its inactivity timeout. A stored
    /// copy that cannot be read is `SessionDataNotReadable`.
    pub fn find(&self, id: &str) -> EngineResult<Option<SharedSession>> {
        if !is_valid_session_id(id) {
            return Ok(None);
        }

        for _ in 0..FIND_ATTEMPTS {
            if let Some(persistence) = &self.persistence {
                persistence.unpersist(id)?;
            }

            let Some(shared) = self.store.get(id) else {
                return Ok(None);
            };

            let now = now();
            let mut session = shared.lock();
            if !self.store.is_current(id, &shared) {
                // evicted or renewed while waiting for the lock
                continue;
            }
            if !session.can_be_resumed(self.settings.inactivity_timeout, now) {
                debug!(session = %id, "session cannot be resumed");
                return Ok(None);
            }
            let idle = session.resume(now);
            debug!(session = %id, idle, "session resumed");
            drop(session);

            return Ok(Some(shared));
        }
        Ok(None)
    }

    /// Destroy a session in place; the persistence sweep removes its file
    pub fn invalidate(&self, id: &str) -> bool {
        let Some(shared) = self.store.get(id) else {
            return false;
        };
        shared.lock().destroy();
        if self.persistence.is_none() {
            self.store.remove_if_same(id, &shared);
            self.ledger.forget(id);
        }
        true
    }

    /// Give a session a fresh ID and move its store entry
    pub fn regenerate_id(&self, session: &SharedSession) -> EngineResult<String> {
        let mut guard = session.lock();
        let old_id = guard.id().map(str::to_string).ok_or(EngineError::SessionNotStarted)?;
        let new_id = generate_session_id();
        guard.set_id(new_id.clone());
        drop(guard);

        self.store.remove_if_same(&old_id, session);
        self.ledger.forget(&old_id);
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.backend().remove(&old_id) {
                warn!(session = %old_id, "failed to delete renewed session file: {e}");
            }
        }
        self.attach(session)?;
        Ok(new_id)
    }

    /// Per-request hook, collects inline when no background collector runs
    pub fn service(&self) -> usize {
        if self.settings.gc_interval().is_some() {
            return 0;
        }
        self.collector.collect()
    }

    pub fn collector(&self) -> &GarbageCollector {
        &self.collector
    }

    pub fn persistence(&self) -> Option<&PersistenceManager> {
        self.persistence.as_deref()
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::entity::Session;
    use crate::session::persistence::FileBackend;
    use std::time::{Duration, SystemTime};

    fn settings() -> SessionSettings {
        SessionSettings {
            gc_interval: 0,
            gc_probability: 1.0,
            inactivity_timeout: 600,
            ..SessionSettings::default()
        }
    }

    fn manager(backend: Option<Arc<dyn SessionBackend>>) -> SessionManager {
        let pool = SessionPool::new(4, 1).unwrap();
        SessionManager::new(settings(), pool, backend).unwrap()
    }

    #[test]
    fn test_create_returns_started_session() {
        let manager = manager(None);
        let session = manager.create(SessionOptions::default()).unwrap();
        let guard = session.lock();

        assert!(guard.is_started());
        assert_eq!(guard.id().unwrap().len(), 32);
        assert_eq!(guard.name(), "SESSID");
        assert!(manager.store().contains(guard.id().unwrap()));
    }

    #[test]
    fn test_create_with_explicit_id() {
        let manager = manager(None);
        let session = manager.create(SessionOptions::default().with_id("fixedId1")).unwrap();
        assert_eq!(session.lock().id(), Some("fixedId1"));

        assert!(matches!(
            manager.create(SessionOptions::default().with_id("bad/id")),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_attach_overwrites() {
        let manager = manager(None);
        let first = manager.create(SessionOptions::default().with_id("same")).unwrap();
        let second = manager.create(SessionOptions::default().with_id("same")).unwrap();

        assert_eq!(manager.len(), 1);
        let found = manager.find("same").unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &second));
        assert!(!Arc::ptr_eq(&found, &first));
    }

    #[test]
    fn test_attach_requires_id() {
        let manager = manager(None);
        let shared = Arc::new(Mutex::new(Session::empty()));
        assert!(matches!(manager.attach(&shared), Err(EngineError::SessionNotStarted)));
    }

    #[test]
    fn test_find_skips_expired_sessions() {
        let manager = manager(None);
        let session = manager.create(SessionOptions::default().with_id("idle")).unwrap();
        session.lock().set_last_activity(now() - 601);

        assert!(manager.find("idle").unwrap().is_none());
        assert!(manager.find("unknown").unwrap().is_none());
    }

    #[test]
    fn test_find_resumes() {
        let manager = manager(None);
        let session = manager.create(SessionOptions::default().with_id("live")).unwrap();
        session.lock().set_last_activity(now() - 30);

        let found = manager.find("live").unwrap().unwrap();
        assert!(found.lock().inactivity(now()) <= 1);
    }

    #[test]
    fn test_find_reloads_from_storage() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn SessionBackend> = Arc::new(FileBackend::new(dir.path(), "sess_").unwrap());
        {
            let writer = manager(Some(backend.clone()));
            let session = writer.create(SessionOptions::default().with_id("stored")).unwrap();
            session.lock().set("cart", &vec![1, 2, 3]).unwrap();
            writer.shutdown();
        }

        let reader = manager(Some(backend));
        reader.store().remove("stored");
        let found = reader.find("stored").unwrap().unwrap();
        assert_eq!(found.lock().get::<Vec<i32>>("cart").unwrap(), Some(vec![1, 2, 3]));
    }

    /// File backend with slow loads
    struct SlowLoad(FileBackend);

    impl SessionBackend for SlowLoad {
        fn persist(&self, id: &str, session: &Session) -> EngineResult<()> {
            self.0.persist(id, session)
        }

        fn load(&self, id: &str) -> EngineResult<Option<Session>> {
            std::thread::sleep(Duration::from_millis(150));
            self.0.load(id)
        }

        fn remove(&self, id: &str) -> EngineResult<()> {
            self.0.remove(id)
        }

        fn exists(&self, id: &str) -> bool {
            self.0.exists(id)
        }

        fn modified_since(&self, since: SystemTime) -> EngineResult<Vec<String>> {
            self.0.modified_since(since)
        }

        fn modified_before(&self, before: SystemTime) -> EngineResult<Vec<String>> {
            self.0.modified_before(before)
        }
    }

    #[test]
    fn test_concurrent_reloads_share_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileBackend::new(dir.path(), "sess_").unwrap();
        let manager = manager(Some(Arc::new(SlowLoad(files.clone()))));

        let mut stored = Session::empty();
        stored.initialize(SessionOptions::default().with_id("abc"), manager.settings());
        stored.start();
        stored.set("n", &1).unwrap();
        files.persist("abc", &stored).unwrap();

        let (a, b) = std::thread::scope(|s| {
            let first = s.spawn(|| manager.find("abc").unwrap().unwrap());
            std::thread::sleep(Duration::from_millis(20));
            let second = s.spawn(|| manager.find("abc").unwrap().unwrap());
            (first.join().unwrap(), second.join().unwrap())
        });

        assert!(Arc::ptr_eq(&a, &b));
        a.lock().set("n", &2).unwrap();
        let resident = manager.store().get("abc").unwrap();
        assert_eq!(resident.lock().get::<i32>("n").unwrap(), Some(2));
    }

    #[test]
    fn test_find_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sess_broken"), "garbage").unwrap();
        let backend: Arc<dyn SessionBackend> = Arc::new(FileBackend::new(dir.path(), "sess_").unwrap());
        let manager = manager(Some(backend));

        assert!(matches!(
            manager.find("broken"),
            Err(EngineError::SessionDataNotReadable(_))
        ));
    }

    #[test]
    fn test_invalidate() {
        let manager = manager(None);
        let session = manager.create(SessionOptions::default().with_id("gone")).unwrap();

        assert!(manager.invalidate("gone"));
        assert!(session.lock().id().is_none());
        assert!(manager.find("gone").unwrap().is_none());
        assert!(!manager.invalidate("gone"));
    }

    #[test]
    fn test_regenerate_id() {
        let manager = manager(None);
        let session = manager.create(SessionOptions::default().with_id("before")).unwrap();
        session.lock().set("k", &1).unwrap();

        let new_id = manager.regenerate_id(&session).unwrap();
        assert_ne!(new_id, "before");
        assert!(!manager.store().contains("before"));
        let found = manager.find(&new_id).unwrap().unwrap();
        assert_eq!(found.lock().get::<i32>("k").unwrap(), Some(1));
    }

    #[test]
    fn test_service_collects_inline_without_background_gc() {
        let manager = manager(None);
        let session = manager.create(SessionOptions::default().with_id("old")).unwrap();
        session.lock().set_last_activity(now() - 601);

        assert_eq!(manager.service(), 1);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_service_is_noop_with_background_gc() {
        let pool = SessionPool::new(2, 1).unwrap();
        let manager = SessionManager::new(
            SessionSettings {
                gc_interval: 5,
                gc_probability: 1.0,
                ..SessionSettings::default()
            },
            pool,
            None,
        )
        .unwrap();
        let session = manager.create(SessionOptions::default()).unwrap();
        session.lock().set_last_activity(0);

        assert_eq!(manager.service(), 0);
        assert_eq!(manager.len(), 1);
    }
}
