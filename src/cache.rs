//! Time-bounded cache for price and pair metadata
//!
//! Entries are valid while `now - inserted_at < ttl`. There is no eviction
//! thread: staleness is resolved lazily on the next read.
//!
//! `get_or_refresh` never makes a reader wait on someone else's refresh.
//! If a refresh for a key is already in flight, callers get the stale value
//! (when one exists) until the refresh lands. A failed refresh also falls
//! back to the stale value.
//!
//! Created: 2026-10-03

use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub inserted_at: Instant,
}

impl<T> CacheEntry<T> {
    pub fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) < ttl
    }
}

pub struct TtlCache<K, V> {
    entries: DashMap<K, CacheEntry<V>>,
    /// Keys with a refresh currently in flight
    refreshing: DashMap<K, ()>,
    ttl: Duration,
}

/// Clears the in-flight marker even if the refreshing future is dropped.
struct RefreshGuard<'a, K: Eq + Hash> {
    refreshing: &'a DashMap<K, ()>,
    key: K,
}

impl<K: Eq + Hash> Drop for RefreshGuard<'_, K> {
    fn drop(&mut self) {
        self.refreshing.remove(&self.key);
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            refreshing: DashMap::new(),
            ttl,
        }
    }

    /// Value only if still within TTL
    pub fn get_fresh(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| e.is_fresh(self.ttl, now))
            .map(|e| e.value.clone())
    }

    /// Value regardless of age
    pub fn get_any(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|e| e.value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serve a fresh value, or refresh it with `fetch`.
    ///
    /// - fresh hit: returned, `fetch` not called
    /// - stale hit while another refresh is in flight: stale value returned
    /// - otherwise `fetch` runs; on success the entry is replaced, on failure
    ///   the stale value is returned if there is one, else the error
    pub async fn get_or_refresh<F, Fut, E>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let now = Instant::now();
        let stale = match self.entries.get(&key) {
            Some(entry) if entry.is_fresh(self.ttl, now) => return Ok(entry.value.clone()),
            Some(entry) => Some(entry.value.clone()),
            None => None,
        };

        let already_refreshing = self.refreshing.insert(key.clone(), ()).is_some();
        if already_refreshing {
            if let Some(value) = stale {
                return Ok(value);
            }
        }
        let _guard = (!already_refreshing).then(|| RefreshGuard {
            refreshing: &self.refreshing,
            key: key.clone(),
        });

        match fetch().await {
            Ok(value) => {
                self.insert(key, value.clone());
                Ok(value)
            }
            Err(e) => match stale {
                Some(value) => Ok(value),
                None => Err(e),
            },
        }
    }
}
