//! Bounded backlog with uniformly random removal.
//!
//! Several workers drain the same broadcast, so taking items in arrival order
//! would have every worker racing on the same hash. Popping at random spreads
//! a backlog across the pool.

use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use bpow_types::{WorkHash, WorkItem};

/// Identity of a backlog entry; at most one entry per key is held.
pub trait QueueKey {
    type Key: PartialEq;

    fn queue_key(&self) -> Self::Key;
}

impl QueueKey for WorkItem {
    type Key = WorkHash;

    fn queue_key(&self) -> WorkHash {
        self.hash
    }
}

impl QueueKey for String {
    type Key = String;

    fn queue_key(&self) -> String {
        self.clone()
    }
}

/// Outcome of [`RandomAccessQueue::upsert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Queued {
    Added,
    /// An entry with the same key was overwritten in place.
    Replaced,
    /// The queue is full.
    Refused,
}

struct Inner<T> {
    items: Vec<T>,
    rng: StdRng,
}

pub struct RandomAccessQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
}

impl<T: QueueKey> RandomAccessQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self::with_rng(capacity, StdRng::from_entropy())
    }

    /// A queue whose removal order is reproducible.
    pub fn with_seed(capacity: usize, seed: u64) -> Self {
        Self::with_rng(capacity, StdRng::seed_from_u64(seed))
    }

    fn with_rng(capacity: usize, rng: StdRng) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: Vec::with_capacity(capacity.min(1024)),
                rng,
            }),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `item`. Refused when the key is already queued or the queue
    /// is full.
    pub fn put(&self, item: T) -> bool {
        let mut inner = self.lock();
        if inner.items.len() >= self.capacity {
            return false;
        }
        let key = item.queue_key();
        if inner.items.iter().any(|queued| queued.queue_key() == key) {
            return false;
        }
        inner.items.push(item);
        true
    }

    /// Insert `item`, overwriting a queued entry with the same key. A
    /// replacement succeeds even when the queue is full.
    pub fn upsert(&self, item: T) -> Queued {
        let mut inner = self.lock();
        let key = item.queue_key();
        if let Some(queued) = inner.items.iter_mut().find(|queued| queued.queue_key() == key) {
            *queued = item;
            return Queued::Replaced;
        }
        if inner.items.len() >= self.capacity {
            return Queued::Refused;
        }
        inner.items.push(item);
        Queued::Added
    }

    /// Remove and return a uniformly chosen item.
    pub fn pop_random(&self) -> Option<T> {
        let mut inner = self.lock();
        if inner.items.is_empty() {
            return None;
        }
        let index = {
            let len = inner.items.len();
            inner.rng.gen_range(0..len)
        };
        Some(inner.items.swap_remove(index))
    }

    pub fn get(&self, key: &T::Key) -> Option<T>
    where
        T: Clone,
    {
        self.lock()
            .items
            .iter()
            .find(|item| &item.queue_key() == key)
            .cloned()
    }

    /// Remove the entry for `key`. Returns whether one was present.
    pub fn delete(&self, key: &T::Key) -> bool {
        let mut inner = self.lock();
        match inner.items.iter().position(|item| &item.queue_key() == key) {
            Some(index) => {
                inner.items.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> RandomAccessQueue<String> {
        let queue = RandomAccessQueue::new(100);
        for value in values {
            assert!(queue.put(value.to_string()));
        }
        queue
    }

    #[test]
    fn duplicates_are_refused() {
        let queue = strings(&["1", "2", "3"]);
        assert!(!queue.put("1".to_string()));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn capacity_is_enforced() {
        let queue = RandomAccessQueue::new(2);
        assert!(queue.put("a".to_string()));
        assert!(queue.put("b".to_string()));
        assert!(!queue.put("c".to_string()));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.capacity(), 2);
    }

    #[test]
    fn upsert_overwrites_the_queued_entry() {
        let queue = RandomAccessQueue::new(1);
        let first = WorkItem {
            request_id: "first".into(),
            hash: WorkHash::ZERO,
            difficulty_multiplier: 1,
            precache: false,
        };
        let escalated = WorkItem {
            request_id: "escalated".into(),
            ..first.clone()
        };
        let other = WorkItem {
            hash: WorkHash::new([1; 32]),
            ..first.clone()
        };

        assert_eq!(queue.upsert(first), Queued::Added);
        assert_eq!(queue.upsert(escalated), Queued::Replaced);
        assert_eq!(queue.upsert(other), Queued::Refused);
        assert_eq!(queue.len(), 1);
        assert_eq!(
            queue.get(&WorkHash::ZERO).map(|item| item.request_id).as_deref(),
            Some("escalated")
        );
    }

    #[test]
    fn get_and_delete() {
        let queue = strings(&["1", "2", "3"]);
        assert_eq!(queue.get(&"2".to_string()).as_deref(), Some("2"));
        assert!(queue.delete(&"2".to_string()));
        assert!(!queue.delete(&"2".to_string()));
        assert!(queue.get(&"2".to_string()).is_none());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn pop_empties_the_queue() {
        let queue = strings(&["1", "2", "3"]);
        let mut popped: Vec<String> = std::iter::from_fn(|| queue.pop_random()).collect();
        popped.sort();
        assert_eq!(popped, vec!["1", "2", "3"]);
        assert!(queue.is_empty());
        assert!(queue.pop_random().is_none());
    }

    #[test]
    fn seeded_pop_is_reproducible() {
        let queue = RandomAccessQueue::with_seed(100, 42);
        for value in ["1", "2", "3"] {
            queue.put(value.to_string());
        }
        let expected_index = StdRng::seed_from_u64(42).gen_range(0..3);
        let expected = ["1", "2", "3"][expected_index];
        assert_eq!(queue.pop_random().as_deref(), Some(expected));
    }

    #[test]
    fn work_items_are_keyed_by_hash() {
        let queue = RandomAccessQueue::new(10);
        let item = WorkItem {
            request_id: "a".into(),
            hash: WorkHash::ZERO,
            difficulty_multiplier: 1,
            precache: false,
        };
        assert!(queue.put(item.clone()));
        let escalated = WorkItem {
            request_id: "b".into(),
            ..item
        };
        assert!(!queue.put(escalated));
        assert_eq!(queue.get(&WorkHash::ZERO).unwrap().request_id, "a");
    }
}
