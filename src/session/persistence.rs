//! Session persistence
//!
//! `SessionBackend` is the storage seam; `FileBackend` keeps one JSON file
//! per session named `<prefix><id>`. `PersistenceManager` runs the sweep
//! that writes dirty sessions, removes destroyed ones and evicts idle ones
//! from memory once their final state is on disk.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use super::entity::{now, Session};
use super::store::{ChecksumLedger, SessionStore};
use crate::error::{EngineError, EngineResult};
use crate::token::is_valid_session_id;

/// Durable storage for sessions
pub trait SessionBackend: Send + Sync {
    /// Write the full state of `session` under `id`
    fn persist(&self, id: &str, session: &Session) -> EngineResult<()>;

    /// Load a stored session, `Ok(None)` when nothing is stored under `id`
    fn load(&self, id: &str) -> EngineResult<Option<Session>>;

    /// Delete the stored copy, succeeding when there was none
    fn remove(&self, id: &str) -> EngineResult<()>;

    fn exists(&self, id: &str) -> bool;

    /// IDs of stored sessions last written after `since`
    fn modified_since(&self, since: SystemTime) -> EngineResult<Vec<String>>;

    /// IDs of stored sessions last written before `before`
    fn modified_before(&self, before: SystemTime) -> EngineResult<Vec<String>>;
}

/// One file per session inside a directory
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
    prefix: String,
}

impl FileBackend {
    /// Use `dir` (created if missing) with file names `<prefix><id>`
    pub fn new(dir: impl Into<PathBuf>, prefix: &str) -> EngineResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            prefix: prefix.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", self.prefix, id))
    }

    fn stored_ids(&self) -> EngineResult<Vec<(String, SystemTime)>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(id) = file_name
                .to_str()
                .and_then(|name| name.strip_prefix(self.prefix.as_str()))
            else {
                continue;
            };
            if !is_valid_session_id(id) {
                continue;
            }
            let modified = match fs::metadata(entry.path()).and_then(|m| m.modified()) {
                Ok(modified) => modified,
                // deleted by a concurrent sweep since the listing
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            ids.push((id.to_string(), modified));
        }
        Ok(ids)
    }
}

impl SessionBackend for FileBackend {
    fn persist(&self, id: &str, session: &Session) -> EngineResult<()> {
        let path = self.file_path(id);
        let tmp = self.dir.join(format!("{}{}.tmp", self.prefix, id));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(session.marshall()?.as_bytes())?;
        // the modification time carries the session's last activity
        file.set_modified(system_time(session.last_activity()))?;
        drop(file);
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, id: &str) -> EngineResult<Option<Session>> {
        let path = self.file_path(id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(EngineError::SessionDataNotReadable(format!("{}: {e}", path.display())))
            }
        };

        let mut session = Session::empty();
        session.unmarshall(&raw)?;
        if let Some(modified) = fs::metadata(&path).and_then(|m| m.modified()).ok() {
            session.set_last_activity(unix_seconds(modified));
        }
        Ok(Some(session))
    }

    fn remove(&self, id: &str) -> EngineResult<()> {
        match fs::remove_file(self.file_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, id: &str) -> bool {
        self.file_path(id).is_file()
    }

    fn modified_since(&self, since: SystemTime) -> EngineResult<Vec<String>> {
        Ok(self
            .stored_ids()?
            .into_iter()
            .filter(|(_, modified)| *modified > since)
            .map(|(id, _)| id)
            .collect())
    }

    fn modified_before(&self, before: SystemTime) -> EngineResult<Vec<String>> {
        Ok(self
            .stored_ids()?
            .into_iter()
            .filter(|(_, modified)| *modified < before)
            .map(|(id, _)| id)
            .collect())
    }
}

fn system_time(unix_seconds: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(unix_seconds.max(0) as u64)
}

fn unix_seconds(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// `now - seconds` as a `SystemTime`
pub(crate) fn seconds_ago(seconds: i64) -> SystemTime {
    SystemTime::now()
        .checked_sub(Duration::from_secs(seconds.max(0) as u64))
        .unwrap_or(UNIX_EPOCH)
}

/// Counters for one persistence sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PersistStats {
    pub written: usize,
    pub deleted: usize,
    pub evicted: usize,
    pub failed: usize,
}

/// Writes dirty sessions and reloads stored ones
pub struct PersistenceManager {
    store: Arc<SessionStore>,
    ledger: Arc<ChecksumLedger>,
    backend: Arc<dyn SessionBackend>,
    inactivity_timeout: i64,
}

impl PersistenceManager {
    pub fn new(
        store: Arc<SessionStore>,
        ledger: Arc<ChecksumLedger>,
        backend: Arc<dyn SessionBackend>,
        inactivity_timeout: i64,
    ) -> Self {
        Self {
            store,
            ledger,
            backend,
            inactivity_timeout,
        }
    }

    pub fn backend(&self) -> &Arc<dyn SessionBackend> {
        &self.backend
    }

    /// Load every stored session younger than the inactivity timeout
    ///
    /// Runs once before the sweep starts. Unreadable files are skipped.
    pub fn restore(&self) -> EngineResult<usize> {
        let since = if self.inactivity_timeout > 0 {
            seconds_ago(self.inactivity_timeout)
        } else {
            UNIX_EPOCH
        };

        let mut restored = 0;
        for id in self.backend.modified_since(since)? {
            match self.backend.load(&id) {
                Ok(Some(session)) => {
                    self.ledger.record(&id, session.checksum());
                    self.store.insert_owned(&id, session);
                    restored += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(session = %id, "skipping unreadable session file: {e}"),
            }
        }

        info!(restored, "sessions restored from storage");
        Ok(restored)
    }

    /// Bring `id` back into the store if it is only on disk
    ///
    /// Concurrent reloads of one ID all end up sharing the first inserted
    /// object; copies loaded by the losers are dropped.
    pub fn unpersist(&self, id: &str) -> EngineResult<()> {
        if self.store.contains(id) || !self.backend.exists(id) {
            return Ok(());
        }

        match self.backend.load(id)? {
            Some(session) => {
                let checksum = session.checksum();
                let (_, inserted) = self.store.insert_if_absent(id, session);
                if inserted {
                    self.ledger.record(id, checksum);
                    debug!(session = %id, "session reloaded from storage");
                }
                Ok(())
            }
            None => Err(EngineError::SessionDataNotReadable(format!(
                "session file for {id} vanished while loading"
            ))),
        }
    }

    /// One pass over the store
    pub fn tick(&self) -> PersistStats {
        let now = now();
        let mut stats = PersistStats::default();

        for (key, shared) in self.store.snapshot() {
            let session = shared.lock();
            if session.id().is_some_and(|id| id != key) {
                // renewed since the snapshot, swept under its new key next time
                continue;
            }
            let checksum = session.checksum();

            let outcome = if session.id().is_none() {
                // destroyed: drop the stored copy, never write it again
                let removed = self.backend.remove(&key).map(|_| stats.deleted += 1);
                self.store.remove_if_same(&key, &shared);
                self.ledger.forget(&key);
                removed
            } else if self.ledger.is_changed(&key, &checksum) {
                self.backend.persist(&key, &session).map(|_| {
                    self.ledger.record(&key, checksum);
                    stats.written += 1;
                })
            } else if self.inactivity_timeout > 0
                && session.inactivity(now) > self.inactivity_timeout
            {
                self.backend.persist(&key, &session).map(|_| {
                    self.store.remove_if_same(&key, &shared);
                    self.ledger.forget(&key);
                    stats.evicted += 1;
                })
            } else {
                Ok(())
            };

            if let Err(e) = outcome {
                stats.failed += 1;
                warn!(session = %key, "persistence failed: {e}");
            }
        }

        if stats != PersistStats::default() {
            debug!(?stats, "persistence sweep");
        }
        stats
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::SessionSettings;
    use crate::session::entity::SessionOptions;

    fn started(id: &str) -> Session {
        let mut session = Session::empty();
        session.initialize(SessionOptions::default().with_id(id), &SessionSettings::default());
        session.start();
        session
    }

    /// File backend that refuses to write or delete one ID
    pub(crate) struct FailingFor {
        pub(crate) inner: FileBackend,
        pub(crate) id: &'static str,
    }

    impl FailingFor {
        fn check(&self, id: &str) -> EngineResult<()> {
            if id == self.id {
                return Err(std::io::Error::new(ErrorKind::PermissionDenied, "read-only").into());
            }
            Ok(())
        }
    }

    impl SessionBackend for FailingFor {
        fn persist(&self, id: &str, session: &Session) -> EngineResult<()> {
            self.check(id)?;
            self.inner.persist(id, session)
        }

        fn load(&self, id: &str) -> EngineResult<Option<Session>> {
            self.inner.load(id)
        }

        fn remove(&self, id: &str) -> EngineResult<()> {
            self.check(id)?;
            self.inner.remove(id)
        }

        fn exists(&self, id: &str) -> bool {
            self.inner.exists(id)
        }

        fn modified_since(&self, since: SystemTime) -> EngineResult<Vec<String>> {
            self.inner.modified_since(since)
        }

        fn modified_before(&self, before: SystemTime) -> EngineResult<Vec<String>> {
            self.inner.modified_before(before)
        }
    }

    fn setup(dir: &Path, timeout: i64) -> (Arc<SessionStore>, Arc<ChecksumLedger>, PersistenceManager) {
        let store = Arc::new(SessionStore::new());
        let ledger = Arc::new(ChecksumLedger::new());
        let backend = Arc::new(FileBackend::new(dir, "sess_").unwrap());
        let manager = PersistenceManager::new(store.clone(), ledger.clone(), backend, timeout);
        (store, ledger, manager)
    }

    #[test]
    fn test_dirty_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ledger, manager) = setup(dir.path(), 1_800);
        let shared = store.insert_owned("abc", started("abc"));

        assert_eq!(manager.tick().written, 1);
        assert!(dir.path().join("sess_abc").is_file());
        assert!(ledger.get("abc").is_some());

        assert_eq!(manager.tick().written, 0);

        shared.lock().set("k", &"v").unwrap();
        assert_eq!(manager.tick().written, 1);
        assert_eq!(manager.tick().written, 0);
    }

    #[test]
    fn test_destroyed_session_file_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ledger, manager) = setup(dir.path(), 1_800);
        let shared = store.insert_owned("abc", started("abc"));
        shared.lock().set("k", &1).unwrap();
        manager.tick();
        assert!(dir.path().join("sess_abc").is_file());

        shared.lock().destroy();
        let stats = manager.tick();

        assert_eq!(stats.deleted, 1);
        assert!(!dir.path().join("sess_abc").exists());
        assert!(store.is_empty());
        assert!(ledger.is_empty());
        assert_eq!(manager.tick(), PersistStats::default());
    }

    #[test]
    fn test_idle_session_is_evicted_but_kept_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ledger, manager) = setup(dir.path(), 60);
        let shared = store.insert_owned("abc", started("abc"));
        manager.tick();

        shared.lock().set_last_activity(now() - 61);
        let stats = manager.tick();

        assert_eq!(stats.evicted, 1);
        assert!(store.is_empty());
        assert!(ledger.is_empty());
        assert!(dir.path().join("sess_abc").is_file());

        // stored copy keeps the idle time, so it is not resumed as fresh
        let reloaded = FileBackend::new(dir.path(), "sess_").unwrap().load("abc").unwrap().unwrap();
        assert!(reloaded.inactivity(now()) > 60);
    }

    #[test]
    fn test_restore_loads_recent_files_and_seeds_ledger() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (store, _, manager) = setup(dir.path(), 1_800);
            let shared = store.insert_owned("abc", started("abc"));
            shared.lock().set("user", &"ada").unwrap();
            manager.tick();
        }

        let (store, ledger, manager) = setup(dir.path(), 1_800);
        assert_eq!(manager.restore().unwrap(), 1);
        assert!(ledger.get("abc").is_some());
        let restored = store.get("abc").unwrap();
        assert_eq!(restored.lock().get::<String>("user").unwrap().as_deref(), Some("ada"));

        assert_eq!(manager.tick().written, 0);
    }

    #[test]
    fn test_restore_skips_expired_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), "sess_").unwrap();
        let mut stale = started("stale");
        stale.set_last_activity(now() - 1_800 - 10);
        backend.persist("stale", &stale).unwrap();
        backend.persist("fresh", &started("fresh")).unwrap();

        let (store, ledger, manager) = setup(dir.path(), 1_800);
        assert_eq!(manager.restore().unwrap(), 1);
        assert!(store.contains("fresh"));
        assert!(!store.contains("stale"));
        assert!(ledger.get("stale").is_none());
        assert!(backend.exists("stale"));
    }

    #[test]
    fn test_sweep_skips_session_renewed_after_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ledger, manager) = setup(dir.path(), 1_800);
        let shared = store.insert_owned("old", started("old"));

        // ID changed but the entry is not yet moved
        shared.lock().set_id("new".to_string());
        assert_eq!(manager.tick(), PersistStats::default());
        assert!(!dir.path().join("sess_old").exists());
        assert!(ledger.get("old").is_none());

        store.remove_if_same("old", &shared);
        store.insert("new", shared.clone());
        assert_eq!(manager.tick().written, 1);
        assert!(dir.path().join("sess_new").is_file());
        assert!(!dir.path().join("sess_old").exists());
    }

    #[test]
    fn test_failed_write_does_not_stop_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new());
        let ledger = Arc::new(ChecksumLedger::new());
        let backend = Arc::new(FailingFor {
            inner: FileBackend::new(dir.path(), "sess_").unwrap(),
            id: "bad",
        });
        let manager = PersistenceManager::new(store.clone(), ledger.clone(), backend, 1_800);

        for id in ["bad", "good1", "good2"] {
            store.insert_owned(id, started(id));
        }

        let stats = manager.tick();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.written, 2);
        assert!(dir.path().join("sess_good1").is_file());
        assert!(dir.path().join("sess_good2").is_file());
        assert!(!dir.path().join("sess_bad").exists());
        assert!(ledger.get("bad").is_none());

        // retried on the next sweep
        let stats = manager.tick();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.written, 0);
        assert!(store.contains("bad"));
    }

    #[test]
    fn test_unpersist() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), "sess_").unwrap();
        backend.persist("abc", &started("abc")).unwrap();

        let (store, _, manager) = setup(dir.path(), 1_800);
        manager.unpersist("abc").unwrap();
        assert!(store.contains("abc"));

        manager.unpersist("missing").unwrap();
        assert!(!store.contains("missing"));
    }

    #[test]
    fn test_unpersist_corrupt_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sess_bad"), "{ not json").unwrap();

        let (store, _, manager) = setup(dir.path(), 1_800);
        assert!(matches!(
            manager.unpersist("bad"),
            Err(EngineError::SessionDataNotReadable(_))
        ));
        assert!(!store.contains("bad"));
    }

    #[test]
    fn test_backend_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("README"), "hello").unwrap();
        let backend = FileBackend::new(dir.path(), "sess_").unwrap();
        backend.persist("abc", &started("abc")).unwrap();

        let ids = backend.modified_since(UNIX_EPOCH).unwrap();
        assert_eq!(ids, vec!["abc".to_string()]);
        backend.remove("abc").unwrap();
        backend.remove("abc").unwrap();
        assert!(!backend.exists("abc"));
    }

    #[test]
    fn test_dotted_prefix_keeps_files_apart() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), "sess.").unwrap();
        let mut abc = started("abc");
        abc.set("n", &1).unwrap();
        backend.persist("abc", &abc).unwrap();
        backend.persist("def", &started("def")).unwrap();
        // leftover from an interrupted write
        fs::write(dir.path().join("sess.abc.tmp"), "partial").unwrap();

        let mut ids = backend.modified_since(UNIX_EPOCH).unwrap();
        ids.sort();
        assert_eq!(ids, vec!["abc".to_string(), "def".to_string()]);

        let loaded = backend.load("abc").unwrap().unwrap();
        assert_eq!(loaded.get::<i32>("n").unwrap(), Some(1));
        assert_eq!(backend.load("def").unwrap().unwrap().id(), Some("def"));
    }

    #[cfg(unix)]
    #[test]
    fn test_listing_skips_files_that_vanish() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), "sess_").unwrap();
        backend.persist("abc", &started("abc")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("gone"), dir.path().join("sess_gone")).unwrap();

        assert_eq!(backend.modified_since(UNIX_EPOCH).unwrap(), vec!["abc".to_string()]);
        let later = SystemTime::now() + Duration::from_secs(60);
        assert_eq!(backend.modified_before(later).unwrap(), vec!["abc".to_string()]);
    }
}
