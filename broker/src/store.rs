//! Result cache and work-record persistence boundaries.
//!
//! The broker only talks to the [`WorkCache`] and [`WorkStore`] traits; the
//! in-memory implementations here back tests and single-node deployments.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use bpow_types::WorkHash;

use crate::BrokerError;

/// Short-lived `hash → result` lookup. A miss only means "ask the pool".
pub trait WorkCache: Send + Sync {
    fn get(&self, hash: &WorkHash) -> Option<String>;
    fn put(&self, hash: WorkHash, result: String);

    /// Drop expired entries and return how many went. Stores that expire
    /// entries on their own keep the default.
    fn purge(&self) -> usize {
        0
    }
}

/// TTL cache held in process memory.
pub struct MemoryCache {
    ttl: Duration,
    entries: Mutex<HashMap<WorkHash, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WorkCache for MemoryCache {
    fn get(&self, hash: &WorkHash) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(hash) {
            Some((result, expires)) if *expires > Instant::now() => Some(result.clone()),
            Some(_) => {
                entries.remove(hash);
                None
            }
            None => None,
        }
    }

    fn put(&self, hash: WorkHash, result: String) {
        let expires = Instant::now() + self.ttl;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash, (result, expires));
    }

    fn purge(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, (_, expires)| *expires > now);
        before - entries.len()
    }
}

/// A credited piece of work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkRecord {
    pub hash: WorkHash,
    pub result: String,
    pub difficulty_multiplier: u32,
    pub provided_by: String,
    pub requested_by: String,
    pub block_award: bool,
    pub precache: bool,
    /// Already included in a payout.
    pub awarded: bool,
}

impl WorkRecord {
    /// Payout weight of this record.
    pub fn weight(&self) -> u64 {
        u64::from(self.difficulty_multiplier) * 100
    }

    fn is_unpaid(&self) -> bool {
        self.block_award && !self.awarded
    }
}

/// Unpaid work owed to one provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnpaidSummary {
    pub provider: String,
    pub unpaid_count: u64,
    pub weighted_sum: u64,
}

/// Persistence of work records and the sums payouts are computed from.
pub trait WorkStore: Send + Sync {
    /// Insert, or replace the record for the same hash (resetting `awarded`).
    fn upsert(&self, record: WorkRecord) -> Result<(), BrokerError>;

    fn get(&self, hash: &WorkHash) -> Result<Option<WorkRecord>, BrokerError>;

    /// Weighted unpaid sum for one provider.
    fn unpaid_sum_for(&self, provider: &str) -> Result<u64, BrokerError>;

    /// Weighted unpaid sum over every provider.
    fn unpaid_sum(&self) -> Result<u64, BrokerError>;

    fn unpaid_by_provider(&self) -> Result<Vec<UnpaidSummary>, BrokerError>;

    /// Return what is owed and mark every record paid.
    fn mark_all_paid(&self) -> Result<Vec<UnpaidSummary>, BrokerError>;
}

/// Work records held in process memory.
#[derive(Default)]
pub struct MemoryWorkStore {
    records: Mutex<HashMap<WorkHash, WorkRecord>>,
}

impl MemoryWorkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<WorkHash, WorkRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WorkStore for MemoryWorkStore {
    fn upsert(&self, mut record: WorkRecord) -> Result<(), BrokerError> {
        record.awarded = false;
        self.lock().insert(record.hash, record);
        Ok(())
    }

    fn get(&self, hash: &WorkHash) -> Result<Option<WorkRecord>, BrokerError> {
        Ok(self.lock().get(hash).cloned())
    }

    fn unpaid_sum_for(&self, provider: &str) -> Result<u64, BrokerError> {
        Ok(self
            .lock()
            .values()
            .filter(|r| r.is_unpaid() && r.provided_by == provider)
            .map(WorkRecord::weight)
            .sum())
    }

    fn unpaid_sum(&self) -> Result<u64, BrokerError> {
        Ok(self
            .lock()
            .values()
            .filter(|r| r.is_unpaid())
            .map(WorkRecord::weight)
            .sum())
    }

    fn unpaid_by_provider(&self) -> Result<Vec<UnpaidSummary>, BrokerError> {
        let records = self.lock();
        let mut by_provider: HashMap<&str, UnpaidSummary> = HashMap::new();
        for record in records.values().filter(|r| r.is_unpaid()) {
            let summary = by_provider
                .entry(record.provided_by.as_str())
                .or_insert_with(|| UnpaidSummary {
                    provider: record.provided_by.clone(),
                    unpaid_count: 0,
                    weighted_sum: 0,
                });
            summary.unpaid_count += 1;
            summary.weighted_sum += record.weight();
        }
        let mut summaries: Vec<_> = by_provider.into_values().collect();
        summaries.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(summaries)
    }

    fn mark_all_paid(&self) -> Result<Vec<UnpaidSummary>, BrokerError> {
        let owed = self.unpaid_by_provider()?;
        for record in self.lock().values_mut() {
            record.awarded = true;
        }
        Ok(owed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(hash: u8, provider: &str, multiplier: u32) -> WorkRecord {
        WorkRecord {
            hash: WorkHash::new([hash; 32]),
            result: "000000000048f5b9".into(),
            difficulty_multiplier: multiplier,
            provided_by: provider.into(),
            requested_by: "service@example.com".into(),
            block_award: true,
            precache: false,
            awarded: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cache_entries_expire() {
        let cache = MemoryCache::new(Duration::from_secs(300));
        let hash = WorkHash::new([3; 32]);
        cache.put(hash, "abc".into());
        assert_eq!(cache.get(&hash).as_deref(), Some("abc"));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(cache.get(&hash).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired() {
        let cache = MemoryCache::new(Duration::from_secs(10));
        cache.put(WorkHash::new([1; 32]), "old".into());
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.put(WorkHash::new([2; 32]), "new".into());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.purge(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn unpaid_sums_are_weighted() {
        let store = MemoryWorkStore::new();
        store.upsert(record(1, "alice", 1)).unwrap();
        store.upsert(record(2, "alice", 64)).unwrap();
        store.upsert(record(3, "bob", 1)).unwrap();

        assert_eq!(store.unpaid_sum_for("alice").unwrap(), 6_500);
        assert_eq!(store.unpaid_sum_for("bob").unwrap(), 100);
        assert_eq!(store.unpaid_sum().unwrap(), 6_600);
        assert_eq!(store.unpaid_sum_for("carol").unwrap(), 0);
    }

    #[test]
    fn upsert_replaces_record_for_same_hash() {
        let store = MemoryWorkStore::new();
        store.upsert(record(1, "alice", 1)).unwrap();
        store.upsert(record(1, "bob", 8)).unwrap();
        assert_eq!(store.len(), 1);
        let stored = store.get(&WorkHash::new([1; 32])).unwrap().unwrap();
        assert_eq!(stored.provided_by, "bob");
        assert_eq!(store.unpaid_sum().unwrap(), 800);
    }

    #[test]
    fn records_without_award_are_not_owed() {
        let store = MemoryWorkStore::new();
        let mut r = record(1, "alice", 4);
        r.block_award = false;
        store.upsert(r).unwrap();
        assert_eq!(store.unpaid_sum().unwrap(), 0);
        assert!(store.get(&WorkHash::new([1; 32])).unwrap().is_some());
    }

    #[test]
    fn mark_all_paid_resets_sums() {
        let store = MemoryWorkStore::new();
        store.upsert(record(1, "alice", 2)).unwrap();
        store.upsert(record(2, "bob", 1)).unwrap();

        let owed = store.mark_all_paid().unwrap();
        assert_eq!(
            owed,
            vec![
                UnpaidSummary {
                    provider: "alice".into(),
                    unpaid_count: 1,
                    weighted_sum: 200
                },
                UnpaidSummary {
                    provider: "bob".into(),
                    unpaid_count: 1,
                    weighted_sum: 100
                },
            ]
        );
        assert_eq!(store.unpaid_sum().unwrap(), 0);
        assert!(store.unpaid_by_provider().unwrap().is_empty());
    }
}
