//! Single-flight ensure guard
//!
//! Concurrent callers for the same key share one in-flight execution.
//! Successes are remembered; failures are not, so the next caller retries.

use moka::future::Cache;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

/// Remembers which keys have been ensured
pub struct EnsureGuard<K> {
    ensured: Cache<K, ()>,
}

impl<K> EnsureGuard<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    /// Guard remembering up to `capacity` keys
    pub fn new(capacity: u64) -> Self {
        let ensured = Cache::builder().max_capacity(capacity).build();
        Self { ensured }
    }

    /// Run `init` for `key` unless it already succeeded. Callers arriving
    /// while `init` runs wait for that execution and share its result.
    pub async fn ensure<F, E>(&self, key: K, init: F) -> Result<(), Arc<E>>
    where
        F: Future<Output = Result<(), E>>,
        E: Send + Sync + 'static,
    {
        self.ensured.try_get_with(key, init).await
    }

    /// Whether `key` is known to be ensured
    pub fn is_ensured(&self, key: &K) -> bool {
        self.ensured.contains_key(key)
    }

    /// Forget `key`, forcing the next `ensure` to run again
    pub async fn forget(&self, key: &K) {
        self.ensured.invalidate(key).await;
    }
}
