//! Bounded LRU cache of policy check results
//!
//! Entries expire `valid_for` after insertion and the least recently used
//! entry is evicted once the cache holds [`MAX_NUM_ENTRY`] results.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Maximum number of cached results
pub const MAX_NUM_ENTRY: usize = 1000;

/// Request attributes sent to the policy server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckPayload {
    pub source_principal: String,
    pub destination_workload: String,
    pub request_method: String,
    pub request_url_path: String,
}

impl CheckPayload {
    /// Cache key for this payload.
    ///
    /// Fields are length prefixed so `("ab", "c")` and `("a", "bc")` differ,
    /// and the hash is stable across processes.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Sha256::new();
        for field in [
            &self.source_principal,
            &self.destination_workload,
            &self.request_method,
            &self.request_url_path,
        ] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix)
    }
}

/// Cached policy result
#[derive(Clone, Copy, Debug)]
pub struct CacheEntry {
    /// Whether the policy allowed the request
    pub allowed: bool,
    pub inserted_at: Instant,
}

#[derive(Debug)]
struct Node {
    hash: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly linked recency list stored in a slab; the head is the most
/// recently used entry.
#[derive(Debug, Default)]
struct RecencyList {
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl RecencyList {
    fn push_front(&mut self, hash: u64) -> usize {
        let node = Node {
            hash,
            prev: None,
            next: self.head,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        match self.head {
            Some(old) => self.nodes[old].prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
        self.len += 1;
        idx
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        self.free.push(idx);
        self.len -= 1;
    }

    fn pop_back(&mut self) -> Option<u64> {
        let idx = self.tail?;
        let hash = self.nodes[idx].hash;
        self.unlink(idx);
        Some(hash)
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// LRU + TTL cache of allow/deny results keyed by payload fingerprint
///
/// Not internally synchronized; callers share it behind a lock.
#[derive(Debug)]
pub struct ResultCache {
    valid_for: Duration,
    capacity: usize,
    entries: HashMap<u64, CacheEntry>,
    recent: RecencyList,
    positions: HashMap<u64, usize>,
}

impl ResultCache {
    /// Create a cache holding up to [`MAX_NUM_ENTRY`] results.
    /// `valid_for` of zero disables caching.
    pub fn new(valid_for: Duration) -> Self {
        Self::with_capacity(valid_for, MAX_NUM_ENTRY)
    }

    pub fn with_capacity(valid_for: Duration, capacity: usize) -> Self {
        Self {
            valid_for,
            capacity: capacity.max(1),
            entries: HashMap::new(),
            recent: RecencyList::default(),
            positions: HashMap::new(),
        }
    }

    /// Look up a result. A fresh hit is promoted to most recently used; an
    /// expired entry is removed and reported as a miss.
    pub fn check(&mut self, hash: u64, now: Instant) -> Option<bool> {
        let entry = *self.entries.get(&hash)?;
        // A validity too long to represent never expires.
        let fresh = entry
            .inserted_at
            .checked_add(self.valid_for)
            .map_or(true, |expires_at| expires_at > now);
        if fresh {
            self.touch(hash);
            return Some(entry.allowed);
        }
        self.remove(hash);
        None
    }

    /// Store a result, evicting the least recently used entry when full.
    pub fn add(&mut self, hash: u64, allowed: bool, now: Instant) {
        if self.valid_for.is_zero() {
            return;
        }
        self.touch(hash);
        self.entries.insert(
            hash,
            CacheEntry {
                allowed,
                inserted_at: now,
            },
        );
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.entries.contains_key(&hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self, hash: u64) {
        if let Some(idx) = self.positions.remove(&hash) {
            self.recent.unlink(idx);
        } else if self.recent.len() >= self.capacity {
            if let Some(evicted) = self.recent.pop_back() {
                self.entries.remove(&evicted);
                self.positions.remove(&evicted);
            }
        }
        let idx = self.recent.push_front(hash);
        self.positions.insert(hash, idx);
    }

    fn remove(&mut self, hash: u64) {
        self.entries.remove(&hash);
        if let Some(idx) = self.positions.remove(&hash) {
            self.recent.unlink(idx);
        }
    }
}
