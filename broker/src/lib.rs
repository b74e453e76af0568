//! BoomPoW work broker.
//!
//! Workers hold long-lived WebSocket connections and are spread over three
//! buckets. A [`Dispatcher::dispatch`] call broadcasts the request to one
//! bucket, escalates to every bucket if nobody answers in time, validates
//! whatever comes back, and cancels redundant work across the pool once a
//! valid answer arrives. Accepted work feeds the credit pipeline.

pub mod admission;
pub mod buckets;
pub mod config;
pub mod connection;
pub mod credit;
pub mod dispatch;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod pending;
pub mod server;
pub mod store;
pub mod tracing_spans;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use bpow_utils::ShutdownController;

pub use admission::{Admission, AdmissionError, Authenticator, Denylist, PenaltyBox, StaticTokens};
pub use buckets::{Bucket, BucketCounts, ConnectionHandle};
pub use config::{BrokerConfig, TokenEntry};
pub use credit::{CreditEvent, CreditPipeline};
pub use dispatch::{DispatchRequest, Dispatcher};
pub use error::BrokerError;
pub use hub::{BroadcastTarget, Hub, HubContext, HubHandle};
pub use metrics::BrokerMetrics;
pub use pending::{PendingRegistry, PendingRequest};
pub use store::{MemoryCache, MemoryWorkStore, WorkCache, WorkRecord, WorkStore};

/// External collaborators the broker is wired to.
pub struct BrokerDeps {
    pub authenticator: Arc<dyn Authenticator>,
    pub cache: Arc<dyn WorkCache>,
    pub store: Arc<dyn WorkStore>,
}

impl BrokerDeps {
    /// In-memory stores and the config's static tokens.
    pub fn in_memory(config: &BrokerConfig) -> Self {
        Self {
            authenticator: Arc::new(StaticTokens::from_entries(&config.tokens)),
            cache: Arc::new(MemoryCache::new(config.cache_ttl())),
            store: Arc::new(MemoryWorkStore::new()),
        }
    }
}

/// A running broker: hub and credit pipeline tasks plus the handles to
/// drive them.
pub struct Broker {
    pub hub: HubHandle,
    pub dispatcher: Dispatcher,
    pub pending: Arc<PendingRegistry>,
    pub metrics: Arc<BrokerMetrics>,
    pub penalties: Arc<PenaltyBox>,
    state: server::AppState,
    tasks: Vec<JoinHandle<()>>,
}

impl Broker {
    /// Spawn the hub, the credit pipeline and the housekeeping tick. All
    /// stop on `shutdown`.
    pub fn start(
        config: &BrokerConfig,
        deps: BrokerDeps,
        shutdown: &ShutdownController,
    ) -> Result<Self, BrokerError> {
        let metrics = Arc::new(BrokerMetrics::new()?);
        let pending = Arc::new(PendingRegistry::new());
        let penalties = Arc::new(PenaltyBox::new(
            config.max_invalid_results,
            config.invalid_ban(),
        ));
        let denylist = Denylist::parse(&config.denied_ranges)
            .map_err(|e| BrokerError::Config(e.to_string()))?;

        let (credit_tx, credit_rx) = mpsc::channel(config.credit_queue_size.max(1));
        let (hub, handle) = Hub::new(
            config,
            HubContext {
                pending: pending.clone(),
                cache: deps.cache.clone(),
                penalties: penalties.clone(),
                metrics: metrics.clone(),
                credits: credit_tx,
            },
        );
        let credit = CreditPipeline::new(
            deps.store.clone(),
            deps.cache.clone(),
            handle.clone(),
            config.prize_pool,
        );

        let tasks = vec![
            tokio::spawn(hub.run(shutdown.subscribe())),
            tokio::spawn(credit.run(credit_rx, shutdown.subscribe())),
            tokio::spawn(housekeeping(
                deps.cache.clone(),
                penalties.clone(),
                config.cache_ttl().max(Duration::from_secs(1)),
                shutdown.subscribe(),
            )),
        ];

        let dispatcher = Dispatcher::new(
            handle.clone(),
            pending.clone(),
            deps.cache,
            deps.store,
            metrics.clone(),
            config.short_timeout(),
            config.long_timeout(),
        );
        let admission = Arc::new(Admission::new(
            deps.authenticator,
            denylist,
            penalties.clone(),
            config.trust_proxy_headers,
        ));
        let state = server::AppState::new(
            handle.clone(),
            dispatcher.clone(),
            admission,
            metrics.clone(),
            connection::ConnectionSettings::from(config),
            config.enable_metrics,
        );

        Ok(Self {
            hub: handle,
            dispatcher,
            pending,
            metrics,
            penalties,
            state,
            tasks,
        })
    }

    pub fn router(&self) -> Router {
        server::router(self.state.clone())
    }

    /// Serve HTTP until shutdown, then wait for the background tasks.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: &ShutdownController,
    ) -> Result<(), BrokerError> {
        let result = server::serve(listener, self.router(), shutdown.subscribe()).await;
        if result.is_err() {
            shutdown.shutdown();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        result
    }
}

/// Periodically drop expired cache entries, decayed strikes and served bans.
pub async fn housekeeping(
    cache: Arc<dyn WorkCache>,
    penalties: Arc<PenaltyBox>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                info!("housekeeping task shutting down");
                break;
            }
            _ = interval.tick() => {
                let expired = cache.purge();
                penalties.purge();
                if expired > 0 {
                    debug!(expired, "purged cached results");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpow_types::WorkHash;

    #[tokio::test(start_paused = true)]
    async fn housekeeping_frees_expired_entries_nobody_reads() {
        let ttl = Duration::from_secs(300);
        let cache = Arc::new(MemoryCache::new(ttl));
        let penalties = Arc::new(PenaltyBox::new(5, Duration::from_secs(60)));
        for i in 0..1000u32 {
            let mut bytes = [0u8; 32];
            bytes[..4].copy_from_slice(&i.to_be_bytes());
            cache.put(WorkHash::new(bytes), "000000000048f5b9".into());
        }
        penalties.strike("9.9.9.9");

        let (stop, rx) = broadcast::channel(1);
        let task = tokio::spawn(housekeeping(cache.clone(), penalties.clone(), ttl, rx));

        tokio::time::sleep(ttl * 2 + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(cache.len(), 0);
        assert_eq!(penalties.tracked(), 0);

        stop.send(()).unwrap();
        task.await.unwrap();
    }
}
