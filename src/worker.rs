//! Per-application worker pool
//!
//! Each worker is a long-lived thread bound to one application. The caller
//! picks a free worker, hands it the request/response pair over the worker's
//! own channel and blocks until the worker sends the pair back. When every
//! worker is busy the caller waits on the pool's condition variable; requests
//! are never queued behind a busy worker.

use std::collections::HashSet;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, SendError, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, info_span, warn};

use crate::application::Application;
use crate::error::{status, EngineError, EngineResult};
use crate::http::{Request, Response};
use crate::supervisor::RestartSignal;

static NEXT_WORKER_ID: AtomicUsize = AtomicUsize::new(1);

struct Job {
    request: Request,
    response: Response,
    reply: Sender<(Request, Response)>,
}

/// Counters shared between a worker thread and its handle
#[derive(Debug, Default)]
struct WorkerState {
    restart: AtomicBool,
    served: AtomicU64,
}

/// Caller side of one worker thread
pub struct WorkerHandle {
    id: usize,
    jobs: Sender<Job>,
    state: Arc<WorkerState>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    fn spawn(app: Arc<Application>, signal: RestartSignal, max_requests: u64) -> io::Result<Arc<Self>> {
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        let (jobs, rx) = crossbeam_channel::unbounded();
        let state = Arc::new(WorkerState::default());

        let thread_state = Arc::clone(&state);
        let join = thread::Builder::new()
            .name(format!("worker-{}-{}", app.name(), id))
            .spawn(move || run_worker(id, app, rx, thread_state, signal, max_requests))?;

        Ok(Arc::new(Self {
            id,
            jobs,
            state,
            join: Mutex::new(Some(join)),
        }))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn needs_restart(&self) -> bool {
        self.state.restart.load(Ordering::Acquire)
    }

    pub fn flag_restart(&self) {
        self.state.restart.store(true, Ordering::Release);
    }

    /// Requests answered by this worker
    pub fn served(&self) -> u64 {
        self.state.served.load(Ordering::Relaxed)
    }
}

/// Close the handles' job channels, then wait for their threads
fn retire(app: &str, workers: Vec<Arc<WorkerHandle>>) {
    let joins: Vec<_> = workers.iter().filter_map(|w| w.join.lock().take()).collect();
    drop(workers);
    for join in joins {
        if join.join().is_err() {
            error!(app, "worker thread panicked outside the pipeline");
        }
    }
}

fn run_worker(
    id: usize,
    app: Arc<Application>,
    jobs: Receiver<Job>,
    state: Arc<WorkerState>,
    signal: RestartSignal,
    max_requests: u64,
) {
    let span = info_span!("worker", app = %app.name(), worker_id = id);
    let _enter = span.enter();
    debug!("worker started");

    while let Ok(Job {
        mut request,
        mut response,
        reply,
    }) = jobs.recv()
    {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            handle(&app, &mut request, &mut response)
        }));
        if outcome.is_err() {
            error!(uri = %request.uri, "request handler panicked, worker will be replaced");
            response = Response::new()
                .with_status(status::INTERNAL_ERROR)
                .with_body("Internal server error: request handler panicked");
            state.restart.store(true, Ordering::Release);
        }

        request.session = None;
        response.mark_dispatched();

        let served = state.served.fetch_add(1, Ordering::Relaxed) + 1;
        if max_requests > 0 && served >= max_requests {
            debug!(served, "request limit reached, worker will be replaced");
            state.restart.store(true, Ordering::Release);
        }

        // flag before replying so the caller never hands this worker more work
        let retiring = state.restart.load(Ordering::Acquire);
        if reply.send((request, response)).is_err() {
            warn!("caller went away before the response was returned");
        }
        if retiring {
            signal.notify();
            break;
        }
    }

    debug!("worker stopped");
}

/// Bind the request and run the pipeline, turning errors into response content
fn handle(app: &Application, request: &mut Request, response: &mut Response) {
    app.bind_request(request);
    if let Err(e) = app.pipeline().run(app, request, response) {
        let code = if e.is_routing() {
            e.status_code()
        } else {
            status::INTERNAL_ERROR
        };
        if code == status::INTERNAL_ERROR {
            error!(uri = %request.uri, "request failed: {e}");
        } else {
            debug!(uri = %request.uri, code, "request not routed: {e}");
        }
        response.status = code;
        response.write(&e.to_string());
    }
}

/// Fixed-size set of workers serving one application
pub struct WorkerPool {
    app: Arc<Application>,
    size: usize,
    max_requests: u64,
    backoff: Duration,
    signal: RestartSignal,
    workers: RwLock<Vec<Arc<WorkerHandle>>>,
    busy: Mutex<HashSet<usize>>,
    freed: Condvar,
    closed: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        app: Arc<Application>,
        size: usize,
        max_requests: u64,
        backoff: Duration,
        signal: RestartSignal,
    ) -> EngineResult<Arc<Self>> {
        if size == 0 {
            return Err(EngineError::Config("worker pool size must be positive".into()));
        }

        let workers = (0..size)
            .map(|_| WorkerHandle::spawn(Arc::clone(&app), signal.clone(), max_requests))
            .collect::<io::Result<Vec<_>>>()?;

        info!(app = %app.name(), size, max_requests, "worker pool started");

        Ok(Arc::new(Self {
            app,
            size,
            max_requests,
            backoff,
            signal,
            workers: RwLock::new(workers),
            busy: Mutex::new(HashSet::new()),
            freed: Condvar::new(),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn app(&self) -> &Arc<Application> {
        &self.app
    }

    /// Target number of workers
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn busy_count(&self) -> usize {
        self.busy.lock().len()
    }

    /// Requests answered by the current workers
    pub fn served(&self) -> u64 {
        self.workers.read().iter().map(|w| w.served()).sum()
    }

    pub fn worker_ids(&self) -> Vec<usize> {
        self.workers.read().iter().map(|w| w.id()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Hand the pair to a free worker and wait for it to come back
    ///
    /// Blocks while every worker is busy.
    pub fn dispatch(&self, request: Request, response: Response) -> EngineResult<(Request, Response)> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let mut job = Job {
            request,
            response,
            reply: reply_tx,
        };

        loop {
            let worker = self.acquire()?;
            debug!(app = %self.app.name(), worker_id = worker.id, "request handed to worker");

            match worker.jobs.send(job) {
                Ok(()) => {
                    let reply = reply_rx.recv();
                    if reply.is_err() {
                        worker.flag_restart();
                    }
                    self.release(&worker);
                    return reply.map_err(|_| {
                        self.signal.notify();
                        EngineError::Internal(format!(
                            "worker {} stopped without answering",
                            worker.id
                        ))
                    });
                }
                Err(SendError(returned)) => {
                    warn!(worker_id = worker.id, "worker is gone, retrying on another one");
                    worker.flag_restart();
                    self.release(&worker);
                    self.signal.notify();
                    job = returned;
                }
            }
        }
    }

    fn acquire(&self) -> EngineResult<Arc<WorkerHandle>> {
        let mut busy = self.busy.lock();
        loop {
            if self.is_closed() {
                return Err(EngineError::ServiceUnavailable(format!(
                    "worker pool of {} is shut down",
                    self.app.name()
                )));
            }

            let free = self
                .workers
                .read()
                .iter()
                .find(|w| !w.needs_restart() && !busy.contains(&w.id))
                .cloned();
            if let Some(worker) = free {
                busy.insert(worker.id);
                return Ok(worker);
            }

            self.freed.wait_for(&mut busy, self.backoff);
        }
    }

    fn release(&self, worker: &WorkerHandle) {
        self.busy.lock().remove(&worker.id);
        self.freed.notify_one();
    }

    pub fn has_flagged(&self) -> bool {
        self.workers.read().iter().any(|w| w.needs_restart())
    }

    /// Swap every worker flagged for restart with a fresh one
    pub fn replace_flagged(&self) -> usize {
        let mut retired = Vec::new();
        {
            let mut workers = self.workers.write();
            if self.is_closed() {
                return 0;
            }
            for slot in workers.iter_mut() {
                if !slot.needs_restart() {
                    continue;
                }
                match WorkerHandle::spawn(Arc::clone(&self.app), self.signal.clone(), self.max_requests) {
                    Ok(fresh) => {
                        info!(
                            app = %self.app.name(),
                            old = slot.id,
                            new = fresh.id,
                            served = slot.served(),
                            "worker replaced"
                        );
                        retired.push(std::mem::replace(slot, fresh));
                    }
                    Err(e) => error!(app = %self.app.name(), worker_id = slot.id, "worker respawn failed: {e}"),
                }
            }
        }

        let replaced = retired.len();
        retire(self.app.name(), retired);
        if replaced > 0 {
            let _busy = self.busy.lock();
            self.freed.notify_all();
        }
        replaced
    }

    /// Stop accepting requests and join every worker
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _busy = self.busy.lock();
            self.freed.notify_all();
        }

        let workers = std::mem::take(&mut *self.workers.write());
        retire(self.app.name(), workers);
        info!(app = %self.app.name(), "worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// TESTS
// ============================================================================
