//! Named background threads ticking at a fixed interval
//!
//! The sleep between ticks is a receive with timeout on a stop channel, so a
//! stop request (or dropping the handle) ends the loop without waiting out
//! the interval.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, error};

/// Handle to a running loop; dropping it stops the loop
#[derive(Debug)]
pub struct BackgroundLoop {
    name: String,
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl BackgroundLoop {
    /// Spawn `tick` every `interval` on a thread called `name`
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread_name = name.to_string();

        let join = thread::Builder::new().name(name.to_string()).spawn(move || {
            debug!(name = %thread_name, "background loop started");
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let outcome =
                            std::panic::catch_unwind(std::panic::AssertUnwindSafe(&mut tick));
                        if outcome.is_err() {
                            error!(name = %thread_name, "background tick panicked, continuing");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!(name = %thread_name, "background loop stopped");
        })?;

        Ok(Self {
            name: name.to_string(),
            stop: Some(stop_tx),
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the loop and wait for the current tick to finish
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!(name = %self.name, "background loop thread panicked");
            }
        }
    }
}

impl Drop for BackgroundLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_loop_ticks_and_stops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = BackgroundLoop::spawn("test-loop", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(100));
        handle.stop();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen > 0);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_loop_survives_panicking_tick() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = BackgroundLoop::spawn("panicky", Duration::from_millis(5), move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first tick fails");
            }
        })
        .unwrap();

        thread::sleep(Duration::from_millis(100));
        drop(handle);
        assert!(ticks.load(Ordering::SeqCst) > 1);
    }
}
