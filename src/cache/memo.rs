//! Short-lived memoization for expensive derived views

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Caches results per key for a fixed time-to-live
pub struct Memoized<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K, V> Memoized<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the memoized value for `key`, computing it when absent or expired.
    ///
    /// Errors are not memoized. The lock is not held while computing, so two
    /// callers racing on an expired key may both compute; the last one wins.
    pub fn get_or_compute<E>(
        &self,
        key: &K,
        compute: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        self.get_or_compute_at(key, Instant::now(), compute)
    }

    fn get_or_compute_at<E>(
        &self,
        key: &K,
        now: Instant,
        compute: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Ok(entries) = self.entries.lock()
            && let Some((stored_at, value)) = entries.get(key)
            && now.saturating_duration_since(*stored_at) < self.ttl
        {
            return Ok(value.clone());
        }

        let value = compute()?;
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.clone(), (now, value.clone()));
        }
        Ok(value)
    }

    /// Forget every memoized value, used after store mutations
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}
