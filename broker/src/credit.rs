//! Credit pipeline: records accepted work and tells workers their share.
//!
//! Runs as one task fed by a bounded queue so the hub never waits on storage.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn, Instrument};

use bpow_types::{AwardNotice, ServerMessage, WorkHash};

use crate::hub::HubHandle;
use crate::store::{WorkCache, WorkRecord, WorkStore};
use crate::tracing_spans::credit_span;
use crate::BrokerError;

/// "A worker answered correctly."
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreditEvent {
    pub provider: String,
    pub requester: String,
    pub hash: WorkHash,
    pub result: String,
    pub difficulty_multiplier: u32,
    pub block_award: bool,
    pub precache: bool,
}

/// Share of the pool owed to a worker.
///
/// Returns `(percent_of_pool, estimated_award)`; an empty pool yields zeros.
pub fn award_share(provider_sum: u64, total_sum: u64, prize_pool: f64) -> (f64, f64) {
    if total_sum == 0 {
        return (0.0, 0.0);
    }
    let percent = provider_sum as f64 / total_sum as f64 * 100.0;
    (percent, prize_pool * percent / 100.0)
}

pub struct CreditPipeline {
    store: Arc<dyn WorkStore>,
    cache: Arc<dyn WorkCache>,
    hub: HubHandle,
    prize_pool: f64,
}

impl CreditPipeline {
    pub fn new(
        store: Arc<dyn WorkStore>,
        cache: Arc<dyn WorkCache>,
        hub: HubHandle,
        prize_pool: f64,
    ) -> Self {
        Self {
            store,
            cache,
            hub,
            prize_pool,
        }
    }

    /// Consume events until the queue closes or shutdown fires.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<CreditEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("credit pipeline started");
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let span = credit_span(&event.hash.to_hex(), &event.provider);
                    if let Err(e) = self.process(event).instrument(span).await {
                        warn!(error = %e, "failed to credit work");
                    }
                }
                _ = shutdown.recv() => {
                    info!("credit pipeline shutting down");
                    break;
                }
            }
        }
    }

    /// Record one event, cache the result and notify the provider.
    pub async fn process(&self, event: CreditEvent) -> Result<AwardNotice, BrokerError> {
        self.store.upsert(WorkRecord {
            hash: event.hash,
            result: event.result.clone(),
            difficulty_multiplier: event.difficulty_multiplier,
            provided_by: event.provider.clone(),
            requested_by: event.requester.clone(),
            block_award: event.block_award,
            precache: event.precache,
            awarded: false,
        })?;
        self.cache.put(event.hash, event.result);

        let total = self.store.unpaid_sum()?;
        let mine = self.store.unpaid_sum_for(&event.provider)?;
        let (percent_of_pool, estimated_award) = award_share(mine, total, self.prize_pool);
        let notice = AwardNotice {
            hash: event.hash,
            percent_of_pool,
            estimated_award,
        };
        debug!(percent_of_pool, estimated_award, "work credited");

        let message = ServerMessage::BlockAwarded(notice.clone()).to_json()?;
        self.hub.notify(&event.provider, message).await?;
        Ok(notice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_is_proportional() {
        let (percent, award) = award_share(250, 1_000, 10_000.0);
        assert_eq!(percent, 25.0);
        assert_eq!(award, 2_500.0);
    }

    #[test]
    fn empty_pool_has_no_share() {
        assert_eq!(award_share(0, 0, 10_000.0), (0.0, 0.0));
    }

    #[test]
    fn sole_worker_gets_everything() {
        let (percent, award) = award_share(100, 100, 500.0);
        assert_eq!(percent, 100.0);
        assert_eq!(award, 500.0);
    }
}
