//! Store-notification intake.
//!
//! Bridges the object store to the coordinator: scans the notification
//! prefixes and turns newly created objects into pipeline events, the way
//! bucket notifications feed the upstream deployment. Emission is
//! at-least-once by design; a restart rescans everything it has already
//! emitted, and the coordinator's stage guards absorb the duplicates.
//!
//! Watched prefixes:
//! - `inbox/<blueprintId>/<name>` — document arrivals
//! - `extraction-complete/<executionId>.json` — extraction completions
//! - `review-output/<executionId>/<loopId>/corrections.json` — reviewer output

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::time::Duration;

use crate::models::Correction;
use crate::pipeline::PipelineEvent;
use crate::store::{self, layout, ObjectStore, StoreError};

/// Sleep granularity for shutdown responsiveness.
const SLEEP_GRANULARITY_MS: u64 = 250;

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("coordinator channel closed")]
    ChannelClosed,
}

/// Scans the store and emits events for objects it has not seen yet.
pub struct StoreWatcher {
    store: Box<dyn ObjectStore>,
    sender: Sender<PipelineEvent>,
    seen: HashSet<String>,
}

impl StoreWatcher {
    pub fn new(store: Box<dyn ObjectStore>, sender: Sender<PipelineEvent>) -> Self {
        Self {
            store,
            sender,
            seen: HashSet::new(),
        }
    }

    /// One scan pass over all watched prefixes. Returns the number of
    /// events emitted.
    pub fn scan(&mut self) -> Result<usize, IntakeError> {
        let mut emitted = 0;

        for key in self.store.list_prefix(layout::INBOX_PREFIX)? {
            if self.seen.contains(&key) {
                continue;
            }
            self.seen.insert(key.clone());
            match layout::parse_inbox_key(&key) {
                Some((blueprint_id, name)) => {
                    self.emit(PipelineEvent::DocumentArrived {
                        blueprint_id,
                        name,
                        source_uri: key.clone(),
                    })?;
                    emitted += 1;
                }
                None => tracing::warn!(%key, "Unrecognized inbox object, ignoring"),
            }
        }

        for key in self.store.list_prefix(layout::EXTRACTION_COMPLETE_PREFIX)? {
            if self.seen.contains(&key) {
                continue;
            }
            self.seen.insert(key.clone());
            match layout::parse_extraction_complete_key(&key) {
                Some(execution_id) => {
                    self.emit(PipelineEvent::ExtractionCompleted { execution_id })?;
                    emitted += 1;
                }
                None => tracing::warn!(%key, "Unrecognized completion marker, ignoring"),
            }
        }

        for key in self.store.list_prefix(layout::REVIEW_OUTPUT_PREFIX)? {
            if self.seen.contains(&key) {
                continue;
            }
            let Some((execution_id, review_loop_id)) = layout::parse_corrections_key(&key) else {
                // Review output folders can hold other artifacts; only
                // corrections files trigger aggregation.
                self.seen.insert(key);
                continue;
            };
            self.seen.insert(key.clone());
            match store::get_json::<Vec<Correction>>(self.store.as_ref(), &key) {
                Ok(corrections) => {
                    self.emit(PipelineEvent::ReviewCompleted {
                        execution_id,
                        review_loop_id,
                        corrections,
                    })?;
                    emitted += 1;
                }
                // A malformed blob never heals; keep it marked seen so the
                // scan does not spin on it.
                Err(e) => tracing::warn!(%key, error = %e, "Unreadable corrections object, ignoring"),
            }
        }

        Ok(emitted)
    }

    fn emit(&self, event: PipelineEvent) -> Result<(), IntakeError> {
        tracing::debug!(?event, "Store notification");
        self.sender.send(event).map_err(|_| IntakeError::ChannelClosed)
    }

    /// Scan in a loop until shutdown is requested or the coordinator goes
    /// away.
    pub fn run(mut self, shutdown: &AtomicBool, poll_interval: Duration) {
        tracing::info!(poll_secs = poll_interval.as_secs(), "Store watcher started");
        while !shutdown.load(Ordering::Relaxed) {
            match self.scan() {
                Ok(_) => {}
                Err(IntakeError::ChannelClosed) => {
                    tracing::info!("Coordinator gone, store watcher stopping");
                    return;
                }
                Err(e) => tracing::warn!(error = %e, "Store scan failed, will retry"),
            }

            // Sleep in small increments for responsive shutdown
            let mut slept = Duration::ZERO;
            while slept < poll_interval && !shutdown.load(Ordering::Relaxed) {
                let step = Duration::from_millis(SLEEP_GRANULARITY_MS).min(poll_interval - slept);
                std::thread::sleep(step);
                slept += step;
            }
        }
        tracing::info!("Store watcher shutting down");
    }
}
