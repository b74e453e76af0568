//! The hub: single owner of every live worker connection.
//!
//! One task runs [`Hub::run`]; everything else talks to it through a
//! [`HubHandle`]. Inbound responses are validated here, resolved through the
//! correlation registry, followed by a pool-wide `work_cancel` and a credit
//! event. Outbound sends never block: a worker whose queue is full is dropped.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use bpow_types::{ServerMessage, WorkHash, WorkResponse};
use bpow_work::is_work_valid;

use crate::admission::PenaltyBox;
use crate::buckets::{Bucket, BucketCounts, BucketSet, ConnectionHandle};
use crate::config::BrokerConfig;
use crate::credit::CreditEvent;
use crate::metrics::BrokerMetrics;
use crate::pending::PendingRegistry;
use crate::store::WorkCache;
use crate::BrokerError;

/// Where a broadcast goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BroadcastTarget {
    Bucket(Bucket),
    All,
}

/// Messages accepted by the hub loop.
#[derive(Debug)]
pub enum HubCommand {
    /// Replies `false` and drops the handle when its address already has a
    /// live connection.
    Register {
        handle: ConnectionHandle,
        reply: oneshot::Sender<bool>,
    },
    Unregister {
        id: u64,
    },
    /// A text frame read from a worker connection.
    Inbound {
        id: u64,
        addr: String,
        identity: String,
        payload: String,
    },
    Broadcast {
        target: BroadcastTarget,
        message: String,
    },
    /// Broadcast to the round-robin bucket and report which one was used.
    BroadcastNext {
        message: String,
        reply: oneshot::Sender<Bucket>,
    },
    /// Send to every connection owned by `identity`.
    Notify {
        identity: String,
        message: String,
    },
    Contains {
        addr: String,
        reply: oneshot::Sender<bool>,
    },
    Counts {
        reply: oneshot::Sender<BucketCounts>,
    },
}

/// Shared services the hub needs.
pub struct HubContext {
    pub pending: Arc<PendingRegistry>,
    pub cache: Arc<dyn WorkCache>,
    pub penalties: Arc<PenaltyBox>,
    pub metrics: Arc<BrokerMetrics>,
    pub credits: mpsc::Sender<CreditEvent>,
}

pub struct Hub {
    buckets: BucketSet,
    no_credit: HashSet<String>,
    ctx: HubContext,
    rx: mpsc::Receiver<HubCommand>,
}

impl Hub {
    pub fn new(config: &BrokerConfig, ctx: HubContext) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(config.hub_queue_size.max(1));
        let hub = Self {
            buckets: BucketSet::new(config.bucket_memory),
            no_credit: config.no_credit_requesters.iter().cloned().collect(),
            ctx,
            rx,
        };
        (hub, HubHandle { tx })
    }

    /// Process commands until every handle is dropped or shutdown fires.
    ///
    /// Dropping the hub drops every outbound sender, which closes the
    /// connections.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("hub started");
        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = shutdown.recv() => {
                    info!(connections = self.buckets.len(), "hub shutting down");
                    break;
                }
            }
        }
    }

    fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register { handle, reply } => {
                let _ = reply.send(self.register(handle));
            }
            HubCommand::Unregister { id } => self.drop_connection(id),
            HubCommand::Inbound {
                id,
                addr,
                identity,
                payload,
            } => self.handle_inbound(id, &addr, &identity, &payload),
            HubCommand::Broadcast { target, message } => self.send(target, &message),
            HubCommand::BroadcastNext { message, reply } => {
                let bucket = self.buckets.next_bucket();
                self.send(BroadcastTarget::Bucket(bucket), &message);
                let _ = reply.send(bucket);
            }
            HubCommand::Notify { identity, message } => {
                let dead = self.buckets.send_to_identity(&identity, &message);
                self.reap(dead);
            }
            HubCommand::Contains { addr, reply } => {
                let _ = reply.send(self.buckets.contains_addr(&addr));
            }
            HubCommand::Counts { reply } => {
                let _ = reply.send(self.buckets.counts());
            }
        }
    }

    /// The hub is the final word on one connection per address; admission
    /// only checks ahead of the upgrade.
    fn register(&mut self, handle: ConnectionHandle) -> bool {
        let (id, addr) = (handle.id, handle.addr.clone());
        if self.buckets.contains_addr(&addr) {
            warn!(id, %addr, "address already connected, refusing worker");
            return false;
        }
        let bucket = self.buckets.insert(handle);
        info!(id, %addr, %bucket, total = self.buckets.len(), "worker registered");
        self.update_gauges();
        true
    }

    fn handle_inbound(&mut self, id: u64, addr: &str, identity: &str, payload: &str) {
        let response = match WorkResponse::from_json(payload) {
            Ok(response) => response,
            Err(e) => {
                warn!(id, %addr, error = %e, "unparseable message from worker");
                return;
            }
        };

        let Some(entry) = self.ctx.pending.get(&response.request_id) else {
            self.ctx.metrics.unmatched_responses.inc();
            debug!(
                request_id = %response.request_id,
                hash = %response.hash,
                "response for a request that is no longer pending"
            );
            return;
        };

        let hash = entry.hash.to_hex();
        if !is_work_valid(&hash, entry.difficulty_multiplier, &response.result) {
            self.ctx.metrics.invalid_results.inc();
            warn!(
                %hash,
                %addr,
                %identity,
                result = %response.result,
                multiplier = entry.difficulty_multiplier,
                "invalid work received"
            );
            if self.ctx.penalties.strike(addr) {
                self.ctx.metrics.banned_addresses.inc();
                warn!(%addr, %identity, "too many invalid results, disconnecting");
                for id in self.buckets.ids_for_addr(addr) {
                    self.drop_connection(id);
                }
            }
            return;
        }

        // Claim the entry first so a second valid answer is never credited.
        if !entry.try_deliver(response.result.clone()) {
            debug!(%hash, request_id = %entry.request_id, "request already resolved");
            return;
        }
        self.ctx.metrics.valid_results.inc();
        self.ctx.pending.delete(&entry.request_id);
        debug!(%hash, %identity, "work accepted");

        self.cancel(entry.hash);

        if self.no_credit.contains(&entry.requester) {
            self.ctx.cache.put(entry.hash, response.result);
            return;
        }
        let event = CreditEvent {
            provider: identity.to_string(),
            requester: entry.requester.clone(),
            hash: entry.hash,
            result: response.result,
            difficulty_multiplier: entry.difficulty_multiplier,
            block_award: entry.block_award,
            precache: entry.precache,
        };
        match self.ctx.credits.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.ctx.metrics.dropped_credits.inc();
                warn!(hash = %event.hash, provider = %event.provider, "credit queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(hash = %event.hash, "credit pipeline stopped, dropping event");
            }
        }
    }

    fn cancel(&mut self, hash: WorkHash) {
        match (ServerMessage::WorkCancel { hash }).to_json() {
            Ok(message) => self.send(BroadcastTarget::All, &message),
            Err(e) => error!(error = %e, "failed to serialize work_cancel"),
        }
    }

    fn send(&mut self, target: BroadcastTarget, message: &str) {
        let dead = match target {
            BroadcastTarget::Bucket(bucket) => self.buckets.broadcast(bucket, message),
            BroadcastTarget::All => self.buckets.broadcast_all(message),
        };
        self.reap(dead);
    }

    fn reap(&mut self, dead: Vec<u64>) {
        for id in dead {
            self.ctx.metrics.dead_peers.inc();
            warn!(id, "outbound queue full or closed, dropping worker");
            self.drop_connection(id);
        }
    }

    fn drop_connection(&mut self, id: u64) {
        if let Some((bucket, handle)) = self.buckets.remove(id) {
            info!(id, addr = %handle.addr, %bucket, total = self.buckets.len(), "worker removed");
            self.update_gauges();
        }
    }

    fn update_gauges(&self) {
        self.ctx.metrics.set_bucket_counts(self.buckets.counts());
    }
}

/// Cloneable sender side of the hub.
#[derive(Clone, Debug)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    async fn command(&self, cmd: HubCommand) -> Result<(), BrokerError> {
        self.tx.send(cmd).await.map_err(|_| BrokerError::HubClosed)
    }

    /// `Ok(false)` means the address already holds a connection; the
    /// handle has been dropped.
    pub async fn register(&self, handle: ConnectionHandle) -> Result<bool, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.command(HubCommand::Register { handle, reply }).await?;
        rx.await.map_err(|_| BrokerError::HubClosed)
    }

    pub async fn unregister(&self, id: u64) -> Result<(), BrokerError> {
        self.command(HubCommand::Unregister { id }).await
    }

    pub async fn inbound(
        &self,
        id: u64,
        addr: &str,
        identity: &str,
        payload: String,
    ) -> Result<(), BrokerError> {
        self.command(HubCommand::Inbound {
            id,
            addr: addr.to_string(),
            identity: identity.to_string(),
            payload,
        })
        .await
    }

    pub async fn broadcast(
        &self,
        target: BroadcastTarget,
        message: String,
    ) -> Result<(), BrokerError> {
        self.command(HubCommand::Broadcast { target, message }).await
    }

    pub async fn broadcast_next(&self, message: String) -> Result<Bucket, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.command(HubCommand::BroadcastNext { message, reply })
            .await?;
        rx.await.map_err(|_| BrokerError::HubClosed)
    }

    pub async fn notify(&self, identity: &str, message: String) -> Result<(), BrokerError> {
        self.command(HubCommand::Notify {
            identity: identity.to_string(),
            message,
        })
        .await
    }

    pub async fn contains(&self, addr: &str) -> Result<bool, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.command(HubCommand::Contains {
            addr: addr.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| BrokerError::HubClosed)
    }

    pub async fn counts(&self) -> Result<BucketCounts, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.command(HubCommand::Counts { reply }).await?;
        rx.await.map_err(|_| BrokerError::HubClosed)
    }
}
