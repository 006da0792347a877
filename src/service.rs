//! Coordinator service loop.
//!
//! Runs the coordinator on a dedicated worker thread: drains the event
//! channel, dispatches each event in arrival order, and sweeps for
//! overdue instances at a fixed cadence. Instances waiting on external
//! completions hold no thread; suspension is just the absence of work
//! until the next signal arrives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::pipeline::{PipelineCoordinator, PipelineEvent};

/// Channel poll granularity; bounds both sweep jitter and shutdown delay.
const RECV_TIMEOUT_MS: u64 = 250;

/// Handle for the running coordinator service.
///
/// Supports graceful shutdown via `shutdown()` or automatic cleanup on
/// `Drop`: queued events are drained by the worker before it exits.
pub struct ServiceHandle {
    sender: Sender<PipelineEvent>,
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ServiceHandle {
    /// A sender feeding the worker's event queue. Clone freely; every
    /// intake source gets one.
    pub fn sender(&self) -> Sender<PipelineEvent> {
        self.sender.clone()
    }

    /// Request graceful shutdown. The event being handled completes, but
    /// nothing further is dispatched.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

/// Start the coordinator on its worker thread.
pub fn start(coordinator: PipelineCoordinator, sweep_interval: Duration) -> ServiceHandle {
    let (sender, receiver) = mpsc::channel();
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    let handle = std::thread::spawn(move || {
        tracing::info!(
            sweep_secs = sweep_interval.as_secs(),
            "Coordinator service started"
        );
        worker_loop(&coordinator, &receiver, &flag, sweep_interval);
    });

    ServiceHandle {
        sender,
        shutdown,
        handle: Some(handle),
    }
}

fn worker_loop(
    coordinator: &PipelineCoordinator,
    receiver: &Receiver<PipelineEvent>,
    shutdown: &AtomicBool,
    sweep_interval: Duration,
) {
    let mut last_sweep = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        match receiver.recv_timeout(Duration::from_millis(RECV_TIMEOUT_MS)) {
            Ok(event) => {
                // Infrastructure errors are logged, never fatal to the
                // loop; instance-level failures are already recorded in
                // state by the coordinator itself.
                if let Err(e) = coordinator.handle_event(event) {
                    tracing::error!(error = %e, "Event handling failed");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if last_sweep.elapsed() >= sweep_interval {
            match coordinator.expire_overdue(Utc::now()) {
                Ok(0) => {}
                Ok(n) => tracing::warn!(expired = n, "Deadline sweep forced overdue instances to failed"),
                Err(e) => tracing::error!(error = %e, "Deadline sweep failed"),
            }
            last_sweep = Instant::now();
        }
    }

    tracing::info!("Coordinator service shutting down");
}
