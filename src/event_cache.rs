//! Idempotency gate for outbound sends
//!
//! Remembers every `tempGuid` accepted since the last purge. Entries are never
//! aged out individually: the whole set is cleared on a fixed interval, and a
//! key is only removed early when its dispatch fails outright.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Default)]
struct Entries {
    order: VecDeque<String>,
    keys: HashSet<String>,
}

/// Bounded FIFO set of client idempotency keys
pub struct EventCache {
    entries: Mutex<Entries>,
    capacity: usize,
}

impl EventCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        // No code path panics while holding the lock, but recover rather than propagate poison.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().keys.contains(key)
    }

    /// Unconditional insert. Prefer `try_add` on the request path.
    pub fn add(&self, key: &str) {
        let mut entries = self.lock();
        Self::insert_locked(&mut entries, key, self.capacity);
    }

    /// Check and insert under one lock. Returns false if the key was already present.
    pub fn try_add(&self, key: &str) -> bool {
        let mut entries = self.lock();
        if entries.keys.contains(key) {
            return false;
        }
        Self::insert_locked(&mut entries, key, self.capacity);
        true
    }

    pub fn remove(&self, key: &str) {
        let mut entries = self.lock();
        if entries.keys.remove(key) {
            entries.order.retain(|k| k != key);
        }
    }

    pub fn purge(&self) {
        let mut entries = self.lock();
        let count = entries.keys.len();
        entries.keys.clear();
        entries.order.clear();
        debug!(count, "purged event cache");
    }

    pub fn len(&self) -> usize {
        self.lock().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert_locked(entries: &mut Entries, key: &str, capacity: usize) {
        if !entries.keys.insert(key.to_string()) {
            return;
        }
        entries.order.push_back(key.to_string());
        while entries.order.len() > capacity {
            if let Some(oldest) = entries.order.pop_front() {
                entries.keys.remove(&oldest);
            }
        }
    }
}

/// Purge the cache on a fixed wall-clock interval, independent of entry age
pub fn spawn_purge_task(cache: Arc<EventCache>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let count = cache.len();
            cache.purge();
            info!(count, "event cache purge");
        }
    })
}
