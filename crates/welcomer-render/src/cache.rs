//! Idle-evicting resource cache
//!
//! Backgrounds, avatars and font faces are expensive to produce (file decode,
//! network fetch, font parsing) and cheap to keep around for a while. Each is
//! held in a [`TtlCache`], which stamps every entry with its last access and
//! drops entries that have been idle for longer than the cache's TTL when the
//! janitor calls [`TtlCache::sweep`].
//!
//! Payloads are immutable `Arc`s. A sweep only removes map slots, so a request
//! still holding a payload it fetched earlier keeps using it unaffected.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

struct CacheEntry<V> {
    value: Arc<V>,
    /// Nanoseconds since the cache epoch
    last_access: AtomicU64,
}

impl<V> CacheEntry<V> {
    fn touch(&self, at: u64) {
        // fetch_max keeps a late-arriving older stamp from moving the entry backwards
        self.last_access.fetch_max(at, Ordering::Relaxed);
    }
}

/// Result of a single [`TtlCache::sweep`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub removed: usize,
    pub remaining: usize,
}

/// Map from key to shared payload with per-entry idle expiry
pub struct TtlCache<K, V> {
    name: &'static str,
    ttl: Duration,
    epoch: Instant,
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            ttl,
            epoch: Instant::now(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    fn stamp(&self, at: Instant) -> u64 {
        u64::try_from(at.saturating_duration_since(self.epoch).as_nanos()).unwrap_or(u64::MAX)
    }

    /// Look up `key`, refreshing its last access on a hit.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let now = self.stamp(Instant::now());
        let entries = self.entries.read();
        entries.get(key).map(|entry| {
            entry.touch(now);
            Arc::clone(&entry.value)
        })
    }

    /// Insert `value`, replacing any existing entry for `key`.
    pub fn insert(&self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        let now = self.stamp(Instant::now());
        let entry = CacheEntry {
            value: Arc::clone(&value),
            last_access: AtomicU64::new(now),
        };
        self.entries.write().insert(key, entry);
        value
    }

    /// Return the cached value for `key` or run `load` and cache its result.
    ///
    /// No lock is held while `load` runs. Concurrent misses on the same key
    /// each run their own load and the last one to finish owns the slot.
    pub async fn get_or_load<F, Fut, E>(&self, key: K, load: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        trace!("{} cache miss", self.name);
        let value = load().await?;
        Ok(self.insert(key, value))
    }

    /// Synchronous counterpart of [`get_or_load`](Self::get_or_load).
    pub fn get_or_try_insert_with<F, E>(&self, key: K, load: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        trace!("{} cache miss", self.name);
        let value = load()?;
        Ok(self.insert(key, value))
    }

    /// Remove every entry idle for longer than the TTL as of `now`.
    ///
    /// Runs under the exclusive lock, so an entry inserted or touched
    /// concurrently is either seen with its fresh stamp or not seen at all.
    pub fn sweep(&self, now: Instant) -> SweepOutcome {
        let now = self.stamp(now);
        let ttl = u64::try_from(self.ttl.as_nanos()).unwrap_or(u64::MAX);

        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| {
            let idle = now.saturating_sub(entry.last_access.load(Ordering::Relaxed));
            idle <= ttl
        });

        SweepOutcome {
            removed: before - entries.len(),
            remaining: entries.len(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.read().contains_key(key)
    }
}
