//! Session lifecycle: entity, store, pool, persistence and collection

pub mod entity;
pub mod gc;
pub mod manager;
pub mod persistence;
pub mod pool;
pub mod store;

pub use entity::{Session, SessionOptions, SharedSession};
pub use gc::GarbageCollector;
pub use manager::SessionManager;
pub use persistence::{FileBackend, PersistStats, PersistenceManager, SessionBackend};
pub use pool::SessionPool;
pub use store::{ChecksumLedger, SessionStore};
