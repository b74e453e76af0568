//! Dispatch pool: a fixed number of tasks draining the backlog.
//!
//! Each item is computed on a blocking thread under a hard deadline, checked
//! with the validator, and handed to the connection as a [`WorkResponse`].
//! Cancellation is cooperative: a `work_cancel` drops the queued item and
//! raises the flag of any computation already running for that hash.
//! A repeated request for a hash that is queued or running only refreshes the
//! request id the result is reported under.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use bpow_types::{WorkHash, WorkItem, WorkResponse};
use bpow_utils::ShutdownController;
use bpow_work::{validate_work, WorkError, WorkThresholds};

use crate::engine::WorkEngine;
use crate::queue::{Queued, RandomAccessQueue};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessorSettings {
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub compute_timeout: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            queue_capacity: 100,
            compute_timeout: Duration::from_secs(10),
        }
    }
}

/// A computation in progress.
struct Running {
    cancel: Arc<AtomicBool>,
    /// Latest id the broker asked for this hash under.
    request_id: String,
}

pub struct WorkProcessor {
    queue: RandomAccessQueue<WorkItem>,
    notify: Notify,
    in_flight: Mutex<HashMap<WorkHash, Running>>,
    engine: Arc<dyn WorkEngine>,
    thresholds: WorkThresholds,
    settings: ProcessorSettings,
    results: mpsc::Sender<WorkResponse>,
}

impl WorkProcessor {
    pub fn new(
        engine: Arc<dyn WorkEngine>,
        settings: ProcessorSettings,
        results: mpsc::Sender<WorkResponse>,
    ) -> Self {
        Self::with_queue(
            engine,
            settings,
            results,
            RandomAccessQueue::new(settings.queue_capacity),
        )
    }

    pub fn with_queue(
        engine: Arc<dyn WorkEngine>,
        settings: ProcessorSettings,
        results: mpsc::Sender<WorkResponse>,
        queue: RandomAccessQueue<WorkItem>,
    ) -> Self {
        Self {
            queue,
            notify: Notify::new(),
            in_flight: Mutex::new(HashMap::new()),
            engine,
            thresholds: WorkThresholds::new(),
            settings,
            results,
        }
    }

    /// Queue `item`. A hash that is already queued or running takes the new
    /// request id instead; anything else is dropped when the backlog is full.
    pub fn submit(&self, item: WorkItem) -> bool {
        let hash = item.hash;
        if let Some(running) = self.in_flight().get_mut(&hash) {
            debug!(%hash, request_id = %item.request_id, "work already running, refreshing request id");
            running.request_id = item.request_id;
            return true;
        }
        match self.queue.upsert(item) {
            Queued::Added => {
                self.notify.notify_one();
                true
            }
            Queued::Replaced => {
                debug!(%hash, "work already queued, refreshing request id");
                true
            }
            Queued::Refused => {
                warn!(%hash, "backlog full, dropping request");
                false
            }
        }
    }

    /// Forget queued work for `hash` and stop any running computation.
    pub fn cancel(&self, hash: &WorkHash) {
        if self.queue.delete(hash) {
            debug!(%hash, "dropped queued work");
        }
        if let Some(running) = self.in_flight().get(hash) {
            running.cancel.store(true, Ordering::Relaxed);
            debug!(%hash, "cancelled running work");
        }
    }

    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    pub fn running(&self) -> usize {
        self.in_flight().len()
    }

    /// Start the consumer tasks. They exit when `shutdown` fires.
    pub fn spawn(self: &Arc<Self>, shutdown: &ShutdownController) -> Vec<JoinHandle<()>> {
        (0..self.settings.concurrency.max(1))
            .map(|slot| {
                let processor = Arc::clone(self);
                let shutdown = shutdown.subscribe();
                tokio::spawn(async move { processor.consume(slot, shutdown).await })
            })
            .collect()
    }

    async fn consume(&self, slot: usize, mut shutdown: broadcast::Receiver<()>) {
        loop {
            while let Some(item) = self.queue.pop_random() {
                self.process(item).await;
            }
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(slot, "work consumer stopped");
                    return;
                }
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Compute, verify and report one item.
    pub async fn process(&self, item: WorkItem) {
        let threshold = self.thresholds.threshold_for(item.difficulty_multiplier);
        let cancel = Arc::new(AtomicBool::new(false));
        self.in_flight().insert(
            item.hash,
            Running {
                cancel: cancel.clone(),
                request_id: item.request_id.clone(),
            },
        );

        let started = Instant::now();
        let engine = self.engine.clone();
        let hash = item.hash;
        let flag = cancel.clone();
        let job = tokio::task::spawn_blocking(move || engine.generate(&hash, threshold, &flag));
        let outcome = timeout(self.settings.compute_timeout, job).await;

        let finished = {
            let mut in_flight = self.in_flight();
            let ours = in_flight
                .get(&hash)
                .is_some_and(|running| Arc::ptr_eq(&running.cancel, &cancel));
            if ours {
                in_flight.remove(&hash)
            } else {
                None
            }
        };
        let request_id = finished.map_or(item.request_id, |running| running.request_id);

        let nonce = match outcome {
            Ok(Ok(Ok(nonce))) => nonce,
            Ok(Ok(Err(WorkError::Cancelled))) => {
                debug!(%hash, "work cancelled");
                return;
            }
            Ok(Ok(Err(e))) => {
                warn!(%hash, error = %e, "engine failed");
                return;
            }
            Ok(Err(e)) => {
                error!(%hash, error = %e, "compute task panicked");
                return;
            }
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                warn!(
                    %hash,
                    limit_secs = self.settings.compute_timeout.as_secs(),
                    "work took too long, giving up"
                );
                return;
            }
        };

        if let Err(e) = validate_work(&hash, nonce, threshold) {
            error!(%hash, error = %e, "engine produced invalid work");
            return;
        }

        info!(
            %hash,
            multiplier = item.difficulty_multiplier,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "work generated"
        );
        let response = WorkResponse {
            request_id,
            hash: hash.to_hex(),
            result: nonce.to_hex(),
        };
        if self.results.send(response).await.is_err() {
            warn!(%hash, "result channel closed");
        }
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<WorkHash, Running>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
