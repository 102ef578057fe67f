// SPDX-License-Identifier: GPL-3.0-only
//! Thread lifecycle management for pipeline worker loops
//!
//! Completion workers and simulated pipelines each run one of these loops.
//! The closure performs a single bounded-wait iteration so the stop signal is
//! observed promptly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Action returned by the loop body to control loop behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Run another iteration
    Continue,
    /// Exit the loop
    Stop,
}

/// Handle to a worker loop running on its own thread
///
/// # Example
///
/// ```ignore
/// let mut worker = WorkerLoop::start("completion-0", move || {
///     match rx.recv_timeout(POLL) {
///         Ok(message) => {
///             handler.handle(message);
///             LoopAction::Continue
///         }
///         Err(RecvTimeoutError::Timeout) => LoopAction::Continue,
///         Err(RecvTimeoutError::Disconnected) => LoopAction::Stop,
///     }
/// });
///
/// worker.stop();
/// ```
pub struct WorkerLoop {
    thread_handle: Option<JoinHandle<()>>,
    stop_signal: Arc<AtomicBool>,
    name: String,
}

impl WorkerLoop {
    /// Spawn a thread that calls `loop_fn` until it returns
    /// [`LoopAction::Stop`] or [`WorkerLoop::stop`] is called.
    pub fn start<F>(name: &str, mut loop_fn: F) -> Self
    where
        F: FnMut() -> LoopAction + Send + 'static,
    {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop_signal_clone = Arc::clone(&stop_signal);
        let name_clone = name.to_string();

        info!(name = %name, "Starting worker loop");

        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(name = %name_clone, "Worker loop thread started");

                loop {
                    if stop_signal_clone.load(Ordering::SeqCst) {
                        debug!(name = %name_clone, "Stop signal received");
                        break;
                    }

                    if loop_fn() == LoopAction::Stop {
                        debug!(name = %name_clone, "Loop requested stop");
                        break;
                    }
                }

                info!(name = %name_clone, "Worker loop thread exiting");
            });

        let thread_handle = match thread_handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(name = %name, error = %e, "Failed to spawn worker thread");
                None
            }
        };

        Self {
            thread_handle,
            stop_signal,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the loop is still running
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Signal the loop to stop without waiting
    pub fn request_stop(&self) {
        debug!(name = %self.name, "Requesting worker loop stop");
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Stop the loop and wait for the thread to finish
    pub fn stop(&mut self) {
        self.request_stop();
        self.join();
    }

    /// Wait for the thread to finish without sending the stop signal
    pub fn join(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            if handle.thread().id() == thread::current().id() {
                // Dropped from inside its own loop body
                return;
            }
            if let Err(e) = handle.join() {
                warn!(name = %self.name, "Worker loop thread panicked: {:?}", e);
            } else {
                debug!(name = %self.name, "Worker loop thread finished");
            }
        }
    }
}

impl Drop for WorkerLoop {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            debug!(name = %self.name, "WorkerLoop dropped, stopping loop");
            self.stop();
        }
    }
}
