//! Dispatch: turn one work request into a nonce, or a timeout.
//!
//! The request first goes to a single round-robin bucket with a short wait.
//! If nobody answers, it is re-issued under a fresh request id to every
//! bucket with a long wait. Either way the caller only ever blocks on its
//! own delivery channel.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn, Instrument};

use bpow_types::{ServerMessage, WorkHash, WorkItem};
use bpow_work::{clamp_multiplier, is_work_valid};

use crate::hub::{BroadcastTarget, HubHandle};
use crate::metrics::BrokerMetrics;
use crate::pending::{DeliveryReceiver, PendingRegistry, PendingRequest};
use crate::store::{WorkCache, WorkStore};
use crate::tracing_spans::dispatch_span;
use crate::BrokerError;

/// A request for work on `hash`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchRequest {
    /// 64 hex characters.
    pub hash: String,
    /// Clamped into `[1, 128]` before use.
    pub difficulty_multiplier: i64,
    /// Identity of the requester, used for crediting.
    pub requester: String,
    pub block_award: bool,
    pub precache: bool,
}

impl DispatchRequest {
    pub fn new(hash: impl Into<String>, difficulty_multiplier: i64, requester: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            difficulty_multiplier,
            requester: requester.into(),
            block_award: true,
            precache: false,
        }
    }
}

/// Fresh correlation id: 32 random bytes, hex-encoded.
pub fn new_request_id() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

#[derive(Clone)]
pub struct Dispatcher {
    hub: HubHandle,
    pending: Arc<PendingRegistry>,
    cache: Arc<dyn WorkCache>,
    store: Arc<dyn WorkStore>,
    metrics: Arc<BrokerMetrics>,
    short_timeout: Duration,
    long_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        hub: HubHandle,
        pending: Arc<PendingRegistry>,
        cache: Arc<dyn WorkCache>,
        store: Arc<dyn WorkStore>,
        metrics: Arc<BrokerMetrics>,
        short_timeout: Duration,
        long_timeout: Duration,
    ) -> Self {
        Self {
            hub,
            pending,
            cache,
            store,
            metrics,
            short_timeout,
            long_timeout,
        }
    }

    /// Obtain valid work for the request.
    ///
    /// Fails with [`BrokerError::InvalidHash`] before anything is broadcast,
    /// or [`BrokerError::Timeout`] once both tiers expire.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<String, BrokerError> {
        let hash = WorkHash::from_hex(&request.hash)
            .map_err(|e| BrokerError::InvalidHash(e.to_string()))?;
        let multiplier = clamp_multiplier(request.difficulty_multiplier);

        if let Some(work) = self.known_work(&hash, multiplier) {
            self.metrics.cache_hits.inc();
            debug!(%hash, multiplier, "served from cache");
            return Ok(work);
        }

        let span = dispatch_span(&hash.to_hex(), multiplier, request.precache);
        self.broadcast_and_wait(hash, multiplier, &request)
            .instrument(span)
            .await
    }

    /// Warm the cache for `hash` in the background.
    pub fn precache(
        &self,
        hash: impl Into<String>,
        difficulty_multiplier: i64,
        requester: impl Into<String>,
    ) -> JoinHandle<()> {
        let mut request = DispatchRequest::new(hash, difficulty_multiplier, requester);
        request.precache = true;
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.dispatch(request).await {
                debug!(error = %e, "precache request failed");
            }
        })
    }

    async fn broadcast_and_wait(
        &self,
        hash: WorkHash,
        multiplier: u32,
        request: &DispatchRequest,
    ) -> Result<String, BrokerError> {
        self.metrics.dispatches.inc();
        let started = Instant::now();

        let (request_id, rx) = self.open(hash, multiplier, request);
        let message = work_message(&request_id, hash, multiplier, request.precache)?;
        let bucket = match self.hub.broadcast_next(message).await {
            Ok(bucket) => bucket,
            Err(e) => {
                self.pending.delete(&request_id);
                return Err(e);
            }
        };
        debug!(%bucket, %request_id, "broadcast to bucket");

        if let Some(work) = self.wait(&request_id, rx, self.short_timeout).await {
            self.observe(started);
            return Ok(work);
        }

        self.metrics.escalations.inc();
        warn!(%hash, "no answer from bucket, sending to every worker");

        let (request_id, rx) = self.open(hash, multiplier, request);
        let message = work_message(&request_id, hash, multiplier, request.precache)?;
        if let Err(e) = self.hub.broadcast(BroadcastTarget::All, message).await {
            self.pending.delete(&request_id);
            return Err(e);
        }

        if let Some(work) = self.wait(&request_id, rx, self.long_timeout).await {
            self.observe(started);
            return Ok(work);
        }

        self.metrics.timeouts.inc();
        info!(%hash, "work request timed out");
        Err(BrokerError::Timeout {
            hash: hash.to_hex(),
        })
    }

    fn open(
        &self,
        hash: WorkHash,
        multiplier: u32,
        request: &DispatchRequest,
    ) -> (String, DeliveryReceiver) {
        loop {
            let request_id = new_request_id();
            let (entry, rx) = PendingRequest::new(
                request_id.clone(),
                hash,
                multiplier,
                request.requester.clone(),
                request.block_award,
                request.precache,
            );
            if self.pending.put(entry) {
                return (request_id, rx);
            }
        }
    }

    /// Wait for delivery, then tear the entry down either way.
    async fn wait(
        &self,
        request_id: &str,
        mut rx: DeliveryReceiver,
        limit: Duration,
    ) -> Option<String> {
        let delivered = timeout(limit, rx.recv()).await.ok().flatten();
        self.pending.delete(request_id);
        // A delivery can land between the timer firing and the delete.
        delivered.or_else(|| rx.try_recv().ok())
    }

    /// Cached or stored work that still meets `multiplier`.
    fn known_work(&self, hash: &WorkHash, multiplier: u32) -> Option<String> {
        let hex = hash.to_hex();
        if let Some(work) = self.cache.get(hash) {
            if is_work_valid(&hex, multiplier, &work) {
                return Some(work);
            }
        }
        match self.store.get(hash) {
            Ok(Some(record)) if is_work_valid(&hex, multiplier, &record.result) => {
                Some(record.result)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(%hash, error = %e, "work store lookup failed");
                None
            }
        }
    }

    fn observe(&self, started: Instant) {
        self.metrics
            .dispatch_latency_ms
            .observe(started.elapsed().as_secs_f64() * 1_000.0);
    }
}

fn work_message(
    request_id: &str,
    hash: WorkHash,
    multiplier: u32,
    precache: bool,
) -> Result<String, BrokerError> {
    Ok(ServerMessage::WorkGenerate(WorkItem {
        request_id: request_id.to_string(),
        hash,
        difficulty_multiplier: multiplier,
        precache,
    })
    .to_json()?)
}
