//! Bounded least-recently-used decision cache.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::decision::Decision;

#[derive(Debug)]
struct CacheEntry {
    decision: Arc<Decision>,
    last_access: u64,
}

#[derive(Debug, Default)]
struct LruState {
    entries: HashMap<String, CacheEntry>,
    /// Logical clock value → key, oldest first.
    order: BTreeMap<u64, String>,
    clock: u64,
}

impl LruState {
    fn touch(&mut self, key: &str) -> Option<Arc<Decision>> {
        self.clock += 1;
        let clock = self.clock;
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.last_access);
        entry.last_access = clock;
        self.order.insert(clock, key.to_string());
        Some(Arc::clone(&entry.decision))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
}

/// Maps cache keys to shared decisions. Only capacity pressure evicts.
///
/// A single mutex guards both the map and the recency order, so concurrent
/// `get`/`put` calls are linearizable per key. Readers receive an `Arc`, so
/// evicting an entry never invalidates a decision already handed out.
#[derive(Debug)]
pub struct DecisionCache {
    capacity: usize,
    state: Mutex<LruState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl DecisionCache {
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(LruState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Looks up a key and marks it most recently used.
    pub fn get(&self, key: &str) -> Option<Arc<Decision>> {
        let found = self.lock().touch(key);
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Inserts or replaces a decision, evicting the least recently used
    /// entry when a new key arrives at a full cache.
    pub fn put(&self, key: impl Into<String>, decision: Arc<Decision>) {
        if self.capacity == 0 {
            return;
        }
        let key = key.into();
        let mut state = self.lock();

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.decision = decision;
            state.touch(&key);
            return;
        }

        if state.entries.len() >= self.capacity {
            if let Some((_, oldest)) = state.order.pop_first() {
                state.entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %oldest, "evicted cached decision");
            }
        }

        state.clock += 1;
        let clock = state.clock;
        state.order.insert(clock, key.clone());
        state.entries.insert(
            key,
            CacheEntry {
                decision,
                last_access: clock,
            },
        );
    }

    /// Presence check that leaves recency untouched.
    pub fn contains(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            len: self.len(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
