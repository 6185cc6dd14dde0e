//! Request handler manager
//!
//! Sleeps until a worker reports it needs replacing, then scans every pool
//! and swaps flagged workers for fresh ones.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::worker::WorkerPool;

#[derive(Debug, Default)]
struct SignalState {
    pending: bool,
    stopped: bool,
}

/// Wake-up channel from workers to the manager
#[derive(Debug, Clone, Default)]
pub struct RestartSignal {
    inner: Arc<(Mutex<SignalState>, Condvar)>,
}

impl RestartSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the manager to scan for flagged workers
    pub fn notify(&self) {
        let (state, cond) = &*self.inner;
        state.lock().pending = true;
        cond.notify_one();
    }

    fn stop(&self) {
        let (state, cond) = &*self.inner;
        state.lock().stopped = true;
        cond.notify_all();
    }

    /// Block until notified; `false` once stopped
    fn wait(&self) -> bool {
        let (state, cond) = &*self.inner;
        let mut state = state.lock();
        while !state.pending && !state.stopped {
            cond.wait(&mut state);
        }
        if state.stopped {
            return false;
        }
        state.pending = false;
        true
    }
}

/// Keeps every worker pool at its target size
pub struct RequestHandlerManager {
    signal: RestartSignal,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl RequestHandlerManager {
    pub fn spawn(signal: RestartSignal, pools: Vec<Arc<WorkerPool>>) -> std::io::Result<Self> {
        let waiter = signal.clone();
        let join = thread::Builder::new()
            .name("request-handler-manager".to_string())
            .spawn(move || {
                info!(pools = pools.len(), "request handler manager started");
                while waiter.wait() {
                    let replaced: usize = pools.iter().map(|pool| pool.replace_flagged()).sum();
                    debug!(replaced, "worker scan finished");
                    if pools.iter().any(|pool| pool.has_flagged()) {
                        // spawn failures leave the flag set; try again on the next wake-up
                        error!("some workers could not be replaced");
                    }
                }
                info!("request handler manager stopped");
            })?;

        Ok(Self {
            signal,
            join: Mutex::new(Some(join)),
        })
    }

    pub fn signal(&self) -> &RestartSignal {
        &self.signal
    }

    pub fn shutdown(&self) {
        self.signal.stop();
        if let Some(join) = self.join.lock().take() {
            if join.join().is_err() {
                error!("request handler manager panicked");
            }
        }
    }
}

impl Drop for RequestHandlerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// TESTS
// ============================================================================
