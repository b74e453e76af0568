//! Correlation registry: request id → waiting dispatch call.
//!
//! Every broadcast work request gets an entry here before it leaves the
//! broker. The hub looks entries up by the `request_id` a worker echoes back,
//! validates the work against the entry's hash and multiplier, and hands the
//! result to the waiting caller through [`PendingRequest::try_deliver`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use bpow_types::WorkHash;

/// Receiving half held by the dispatch call.
pub type DeliveryReceiver = mpsc::Receiver<String>;

/// One outstanding broadcast.
///
/// Cloning shares the delivery slot: whichever clone delivers first wins.
#[derive(Clone, Debug)]
pub struct PendingRequest {
    pub request_id: String,
    pub hash: WorkHash,
    pub difficulty_multiplier: u32,
    /// Identity of whoever asked for the work.
    pub requester: String,
    /// Whether answering this request counts towards payouts.
    pub block_award: bool,
    pub precache: bool,
    resolved: Arc<AtomicBool>,
    tx: mpsc::Sender<String>,
}

impl PendingRequest {
    pub fn new(
        request_id: String,
        hash: WorkHash,
        difficulty_multiplier: u32,
        requester: String,
        block_award: bool,
        precache: bool,
    ) -> (Self, DeliveryReceiver) {
        let (tx, rx) = mpsc::channel(1);
        let entry = Self {
            request_id,
            hash,
            difficulty_multiplier,
            requester,
            block_award,
            precache,
            resolved: Arc::new(AtomicBool::new(false)),
            tx,
        };
        (entry, rx)
    }

    /// Hand `result` to the waiting caller.
    ///
    /// Returns `true` for exactly one call per entry. Later calls, and calls
    /// after the entry was closed, return `false` and drop the result.
    pub fn try_deliver(&self, result: String) -> bool {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.tx.try_send(result).is_ok()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Refuse any further delivery.
    pub fn close(&self) {
        self.resolved.store(true, Ordering::Release);
    }
}

/// Synchronized map of outstanding requests, keyed by request id.
#[derive(Debug, Default)]
pub struct PendingRegistry {
    entries: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `entry`; a request id that is already present is left alone.
    ///
    /// Returns whether the entry was inserted.
    pub fn put(&self, entry: PendingRequest) -> bool {
        let mut entries = self.lock();
        if entries.contains_key(&entry.request_id) {
            return false;
        }
        entries.insert(entry.request_id.clone(), entry);
        true
    }

    pub fn get(&self, request_id: &str) -> Option<PendingRequest> {
        self.lock().get(request_id).cloned()
    }

    /// Remove the entry and close its delivery slot.
    pub fn delete(&self, request_id: &str) -> Option<PendingRequest> {
        let removed = self.lock().remove(request_id);
        if let Some(entry) = &removed {
            entry.close();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> (PendingRequest, DeliveryReceiver) {
        PendingRequest::new(
            id.to_string(),
            WorkHash::new([1; 32]),
            1,
            "service@example.com".to_string(),
            true,
            false,
        )
    }

    #[test]
    fn put_is_idempotent_per_id() {
        let registry = PendingRegistry::new();
        let (first, _rx1) = entry("r1");
        let (mut second, _rx2) = entry("r1");
        second.difficulty_multiplier = 64;

        assert!(registry.put(first));
        assert!(!registry.put(second));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("r1").unwrap().difficulty_multiplier, 1);
    }

    #[test]
    fn get_and_delete() {
        let registry = PendingRegistry::new();
        let (e, _rx) = entry("r1");
        registry.put(e);
        assert!(registry.get("missing").is_none());
        assert!(registry.delete("r1").is_some());
        assert!(registry.get("r1").is_none());
        assert!(registry.is_empty());
        assert!(registry.delete("r1").is_none());
    }

    #[tokio::test]
    async fn first_delivery_wins() {
        let registry = PendingRegistry::new();
        let (e, mut rx) = entry("r1");
        registry.put(e);

        let a = registry.get("r1").unwrap();
        let b = registry.get("r1").unwrap();
        assert!(a.try_deliver("first".into()));
        assert!(!b.try_deliver("second".into()));
        assert!(!a.try_deliver("third".into()));

        assert_eq!(rx.recv().await.as_deref(), Some("first"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn delivery_after_delete_is_refused() {
        let registry = PendingRegistry::new();
        let (e, _rx) = entry("r1");
        registry.put(e);
        let held = registry.get("r1").unwrap();
        registry.delete("r1");
        assert!(held.is_resolved());
        assert!(!held.try_deliver("late".into()));
    }

    #[test]
    fn delivery_to_dropped_waiter_returns_false() {
        let (e, rx) = entry("r1");
        drop(rx);
        assert!(!e.try_deliver("nobody listening".into()));
        assert!(e.is_resolved());
    }

    #[test]
    fn concurrent_deliveries_resolve_once() {
        let (e, mut rx) = entry("r1");
        let winners: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let e = e.clone();
                    s.spawn(move || e.try_deliver(format!("result-{i}")) as usize)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
