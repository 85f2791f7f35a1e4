//! Concurrent key → instance map.
//!
//! Only lookup and insertion go through the map lock, which is never held across an
//! await point. Each instance carries its own async lock, so commands on distinct keys
//! proceed fully in parallel.

use crate::core::{Result, StateKey};
use crate::entity::EntityInstance;
use lru::LruCache;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tracing::{Level, event};

/// A cached instance behind its per-key lock.
pub type SharedInstance = Arc<AsyncMutex<EntityInstance>>;

type Slot = Arc<OnceCell<SharedInstance>>;

struct CacheEntry {
    slot: Slot,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(slot: Slot, ttl: Option<Duration>, now: Instant) -> Self {
        Self {
            slot,
            ttl,
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    fn touch(&mut self, now: Instant) {
        self.expires_at = self.ttl.map(|ttl| now + ttl);
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Nobody outside the cache holds the instance or its lock.
    fn is_idle(&self) -> bool {
        match self.slot.get() {
            None => Arc::strong_count(&self.slot) == 1,
            Some(shared) => {
                Arc::strong_count(&self.slot) == 1
                    && Arc::strong_count(shared) == 1
                    && shared.try_lock().is_ok()
            }
        }
    }
}

/// An entry removed by [`StateCache::sweep_expired`].
pub struct EvictedEntry {
    pub key: StateKey,
    pub instance: SharedInstance,
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: Option<usize>,
}

pub struct StateCache {
    entries: Mutex<LruCache<StateKey, CacheEntry>>,
    capacity: Option<usize>,
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new(None)
    }
}

impl StateCache {
    /// `capacity` bounds the entry count; the sweep evicts least-recently-used idle entries past it.
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            capacity,
        }
    }

    fn map(&self) -> MutexGuard<'_, LruCache<StateKey, CacheEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the live instance for `key`, creating it with `init` when absent or expired.
    ///
    /// Concurrent callers for the same key share one `init` invocation. A failed `init`
    /// leaves no entry behind, so the next caller retries.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &StateKey,
        ttl: Option<Duration>,
        init: F,
    ) -> Result<SharedInstance>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<EntityInstance>>,
    {
        let slot = {
            let mut map = self.map();
            let now = Instant::now();
            let stale = map
                .peek(key)
                .is_some_and(|entry| entry.is_expired(now) && entry.is_idle());
            if stale {
                map.pop(key);
                event!(Level::DEBUG, key = %key, "expired cache entry dropped on access");
            }

            match map.get_mut(key) {
                Some(entry) => {
                    entry.touch(now);
                    entry.slot.clone()
                }
                None => {
                    let slot: Slot = Arc::new(OnceCell::new());
                    map.put(key.clone(), CacheEntry::new(slot.clone(), ttl, now));
                    slot
                }
            }
        };

        let created = slot
            .get_or_try_init(|| async {
                let instance = init().await?;
                Ok::<_, crate::core::StateError>(Arc::new(AsyncMutex::new(instance)))
            })
            .await;

        match created {
            Ok(shared) => Ok(shared.clone()),
            Err(err) => {
                let mut map = self.map();
                let orphaned = map
                    .peek(key)
                    .is_some_and(|entry| Arc::ptr_eq(&entry.slot, &slot) && !entry.slot.initialized());
                if orphaned {
                    map.pop(key);
                }
                Err(err)
            }
        }
    }

    /// Returns the instance if cached and not expired, refreshing its expiry.
    pub fn get(&self, key: &StateKey) -> Option<SharedInstance> {
        let mut map = self.map();
        let now = Instant::now();
        let entry = map.get_mut(key)?;
        if entry.is_expired(now) && entry.is_idle() {
            return None;
        }
        entry.touch(now);
        entry.slot.get().cloned()
    }

    pub fn contains(&self, key: &StateKey) -> bool {
        let map = self.map();
        let now = Instant::now();
        map.peek(key)
            .is_some_and(|entry| entry.slot.initialized() && !(entry.is_expired(now) && entry.is_idle()))
    }

    /// Replaces the entry's contents and refreshes its expiry.
    ///
    /// An already-cached instance is overwritten in place, so holders of the old handle
    /// observe the new values.
    pub async fn put(&self, key: StateKey, instance: EntityInstance, ttl: Option<Duration>) {
        let existing = {
            let mut map = self.map();
            let now = Instant::now();
            match map.get_mut(&key) {
                Some(entry) => {
                    entry.ttl = ttl;
                    entry.touch(now);
                    entry.slot.get().cloned()
                }
                None => None,
            }
        };

        match existing {
            Some(shared) => {
                *shared.lock().await = instance;
            }
            None => {
                let shared = Arc::new(AsyncMutex::new(instance));
                let slot: Slot = Arc::new(OnceCell::new_with(Some(shared)));
                let mut map = self.map();
                map.put(key, CacheEntry::new(slot, ttl, Instant::now()));
            }
        }
    }

    /// Removes an entry immediately, returning the instance it held.
    pub fn evict(&self, key: &StateKey) -> Option<SharedInstance> {
        let entry = self.map().pop(key)?;
        entry.slot.get().cloned()
    }

    /// Removes the entry unless some caller still holds its instance.
    pub fn evict_idle(&self, key: &StateKey) -> bool {
        let mut map = self.map();
        if map.peek(key).is_some_and(CacheEntry::is_idle) {
            map.pop(key);
            true
        } else {
            false
        }
    }

    /// Removes expired entries, then trims least-recently-used ones past the capacity bound.
    ///
    /// Entries currently held by a command are skipped.
    pub fn sweep_expired(&self) -> Vec<EvictedEntry> {
        let mut map = self.map();
        let now = Instant::now();

        let mut doomed: Vec<StateKey> = map
            .iter()
            .filter(|(_, entry)| entry.is_expired(now) && entry.is_idle())
            .map(|(key, _)| key.clone())
            .collect();

        if let Some(capacity) = self.capacity {
            let excess = map.len().saturating_sub(doomed.len()).saturating_sub(capacity);
            if excess > 0 {
                let lru_victims: Vec<StateKey> = map
                    .iter()
                    .rev()
                    .filter(|(key, entry)| entry.is_idle() && !doomed.contains(*key))
                    .take(excess)
                    .map(|(key, _)| key.clone())
                    .collect();
                doomed.extend(lru_victims);
            }
        }

        let evicted: Vec<EvictedEntry> = doomed
            .into_iter()
            .filter_map(|key| {
                let entry = map.pop(&key)?;
                let instance = entry.slot.get().cloned()?;
                Some(EvictedEntry { key, instance })
            })
            .collect();

        if !evicted.is_empty() {
            event!(Level::DEBUG, evicted = evicted.len(), remaining = map.len(), "cache sweep");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    pub fn keys(&self) -> Vec<StateKey> {
        self.map().iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
        }
    }
}
