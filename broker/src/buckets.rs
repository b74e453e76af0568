//! Live worker connections, partitioned into three load-balancing buckets.
//!
//! Only the hub task touches a [`BucketSet`], so nothing here is locked.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

/// One of the three disjoint partitions of the worker pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Bucket {
    A,
    B,
    C,
}

impl Bucket {
    pub const ALL: [Bucket; 3] = [Bucket::A, Bucket::B, Bucket::C];

    /// Round-robin successor: A → B → C → A.
    pub fn next(self) -> Bucket {
        match self {
            Bucket::A => Bucket::B,
            Bucket::B => Bucket::C,
            Bucket::C => Bucket::A,
        }
    }

    fn index(self) -> usize {
        match self {
            Bucket::A => 0,
            Bucket::B => 1,
            Bucket::C => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Bucket::A => "a",
            Bucket::B => "b",
            Bucket::C => "c",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hub-side view of a connection: where to push outbound frames.
///
/// The hub holds the only sender; dropping it closes the connection's
/// writer, which then sends a close frame.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: u64,
    pub addr: String,
    pub identity: String,
    pub tx: mpsc::Sender<String>,
}

impl ConnectionHandle {
    pub fn new(
        id: u64,
        addr: impl Into<String>,
        identity: impl Into<String>,
        tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            id,
            addr: addr.into(),
            identity: identity.into(),
            tx,
        }
    }
}

/// Connected workers per bucket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BucketCounts {
    pub a: usize,
    pub b: usize,
    pub c: usize,
}

impl BucketCounts {
    pub fn total(&self) -> usize {
        self.a + self.b + self.c
    }
}

/// Three buckets plus the round-robin cursor and remembered assignments.
pub struct BucketSet {
    buckets: [HashMap<u64, ConnectionHandle>; 3],
    assignments: HashMap<String, Bucket>,
    assignment_order: VecDeque<String>,
    memory: usize,
    cursor: Bucket,
}

impl BucketSet {
    /// `memory` bounds how many address → bucket assignments are kept for
    /// reconnecting workers.
    pub fn new(memory: usize) -> Self {
        Self {
            buckets: Default::default(),
            assignments: HashMap::new(),
            assignment_order: VecDeque::new(),
            memory,
            cursor: Bucket::A,
        }
    }

    /// Add a connection and return the bucket it joined.
    ///
    /// An address rejoins its remembered bucket; anything else goes to the
    /// smallest bucket, ties broken A, then B, then C.
    pub fn insert(&mut self, handle: ConnectionHandle) -> Bucket {
        let bucket = match self.assignments.get(&handle.addr) {
            Some(bucket) => *bucket,
            None => {
                let bucket = self.smallest();
                self.remember(handle.addr.clone(), bucket);
                bucket
            }
        };
        self.buckets[bucket.index()].insert(handle.id, handle);
        bucket
    }

    pub fn remove(&mut self, id: u64) -> Option<(Bucket, ConnectionHandle)> {
        Bucket::ALL.into_iter().find_map(|bucket| {
            self.buckets[bucket.index()]
                .remove(&id)
                .map(|handle| (bucket, handle))
        })
    }

    pub fn contains_addr(&self, addr: &str) -> bool {
        self.iter().any(|handle| handle.addr == addr)
    }

    /// Ids of every live connection from `addr`.
    pub fn ids_for_addr(&self, addr: &str) -> Vec<u64> {
        self.iter()
            .filter(|handle| handle.addr == addr)
            .map(|handle| handle.id)
            .collect()
    }

    pub fn counts(&self) -> BucketCounts {
        BucketCounts {
            a: self.buckets[0].len(),
            b: self.buckets[1].len(),
            c: self.buckets[2].len(),
        }
    }

    pub fn len(&self) -> usize {
        self.counts().total()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bucket for the next normal dispatch; advances the cursor.
    pub fn next_bucket(&mut self) -> Bucket {
        let bucket = self.cursor;
        self.cursor = bucket.next();
        bucket
    }

    /// Push `message` to every connection in `bucket`.
    ///
    /// Returns ids whose queue was full or closed; the caller removes them.
    pub fn broadcast(&self, bucket: Bucket, message: &str) -> Vec<u64> {
        send_all(self.buckets[bucket.index()].values(), message)
    }

    pub fn broadcast_all(&self, message: &str) -> Vec<u64> {
        send_all(self.iter(), message)
    }

    /// Push `message` to every connection owned by `identity`.
    pub fn send_to_identity(&self, identity: &str, message: &str) -> Vec<u64> {
        send_all(self.iter().filter(|h| h.identity == identity), message)
    }

    fn iter(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.buckets.iter().flat_map(|bucket| bucket.values())
    }

    fn smallest(&self) -> Bucket {
        let mut best = Bucket::A;
        for bucket in [Bucket::B, Bucket::C] {
            if self.buckets[bucket.index()].len() < self.buckets[best.index()].len() {
                best = bucket;
            }
        }
        best
    }

    fn remember(&mut self, addr: String, bucket: Bucket) {
        if self.memory == 0 {
            return;
        }
        while self.assignment_order.len() >= self.memory {
            match self.assignment_order.pop_front() {
                Some(oldest) => {
                    self.assignments.remove(&oldest);
                }
                None => break,
            }
        }
        self.assignment_order.push_back(addr.clone());
        self.assignments.insert(addr, bucket);
    }
}

fn send_all<'a>(handles: impl Iterator<Item = &'a ConnectionHandle>, message: &str) -> Vec<u64> {
    let mut dead = Vec::new();
    for handle in handles {
        match handle.tx.try_send(message.to_string()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => dead.push(handle.id),
        }
    }
    dead
}
