//! Pre-allocated session objects
//!
//! A bounded queue of empty sessions with a single filler thread. Consumers
//! pop; when the queue drops below the low-water mark they nudge the filler,
//! which tops the queue back up to capacity.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::entity::Session;

pub struct SessionPool {
    ready: Receiver<Session>,
    refill: Mutex<Option<Sender<()>>>,
    capacity: usize,
    low_water: usize,
    filler: Mutex<Option<JoinHandle<()>>>,
}

impl SessionPool {
    /// Create the pool and start its filler; the queue is filled before returning
    pub fn new(capacity: usize, low_water: usize) -> std::io::Result<Arc<Self>> {
        let capacity = capacity.max(1);
        let (ready_tx, ready_rx) = bounded::<Session>(capacity);
        let (refill_tx, refill_rx) = bounded::<()>(1);

        fill(&ready_tx);

        let filler = thread::Builder::new()
            .name("session-pool-filler".to_string())
            .spawn(move || {
                // exits once the refill sender is dropped
                while refill_rx.recv().is_ok() {
                    let added = fill(&ready_tx);
                    debug!(added, "session pool refilled");
                }
            })?;

        info!(capacity, low_water, "session pool ready");

        Ok(Arc::new(Self {
            ready: ready_rx,
            refill: Mutex::new(Some(refill_tx)),
            capacity,
            low_water: low_water.min(capacity),
            filler: Mutex::new(Some(filler)),
        }))
    }

    /// Take an empty session, allocating on the spot if the pool ran dry
    pub fn acquire(&self) -> Session {
        let session = self.ready.try_recv().unwrap_or_else(|_| {
            debug!("session pool exhausted, allocating inline");
            Session::empty()
        });

        if self.ready.len() < self.low_water.max(1) {
            if let Some(refill) = self.refill.lock().as_ref() {
                // a full signal slot means a refill is already pending
                let _ = refill.try_send(());
            }
        }
        session
    }

    pub fn available(&self) -> usize {
        self.ready.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop the filler; later acquisitions drain the queue, then allocate inline
    pub fn shutdown(&self) {
        drop(self.refill.lock().take());
        if let Some(handle) = self.filler.lock().take() {
            if handle.join().is_err() {
                warn!("session pool filler panicked");
            }
        }
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn fill(tx: &Sender<Session>) -> usize {
    let mut added = 0;
    loop {
        match tx.try_send(Session::empty()) {
            Ok(()) => added += 1,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => return added,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
