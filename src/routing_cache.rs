//! Memoized key -> shard-name routing.
//!
//! Entries are derived data: the resolver stays authoritative and a miss or a
//! stale hit only costs one extra resolution. Keys are qualified with the
//! topology generation so entries written under an older shard count are
//! never consulted.

use crate::backend::CacheBackend;
use crate::core::{Result, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, event};

#[derive(Clone)]
pub struct RoutingCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl RoutingCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn entry_key(collection: &str, generation: u64, key: &Value) -> String {
        format!("route:{}:g{}:{}", collection, generation, key.key_string())
    }

    pub async fn lookup(
        &self,
        collection: &str,
        generation: u64,
        key: &Value,
    ) -> Result<Option<String>> {
        self.backend
            .get(&Self::entry_key(collection, generation, key))
            .await
    }

    pub async fn remember(
        &self,
        collection: &str,
        generation: u64,
        key: &Value,
        shard_name: &str,
    ) -> Result<()> {
        self.backend
            .set(
                &Self::entry_key(collection, generation, key),
                shard_name,
                self.ttl,
            )
            .await
    }

    /// Drops the entry for a key so the next lookup goes to the resolver.
    pub async fn invalidate(&self, collection: &str, generation: u64, key: &Value) -> Result<()> {
        event!(Level::TRACE, collection, generation, key = %key, "routing entry invalidated");
        self.backend
            .delete(&Self::entry_key(collection, generation, key))
            .await
    }

    /// Best-effort cache write; a failed memoization never fails the request.
    pub async fn remember_quietly(
        &self,
        collection: &str,
        generation: u64,
        key: &Value,
        shard_name: &str,
    ) {
        if let Err(err) = self.remember(collection, generation, key, shard_name).await {
            event!(Level::WARN, error = %err, collection, "routing cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryCache;

    #[tokio::test]
    async fn entries_are_scoped_by_generation() {
        let cache = RoutingCache::new(Arc::new(InMemoryCache::new()), Duration::from_secs(60));
        let key = Value::from("user-7");

        cache.remember("users", 1, &key, "users_shard_2").await.unwrap();
        assert_eq!(
            cache.lookup("users", 1, &key).await.unwrap().as_deref(),
            Some("users_shard_2")
        );
        assert_eq!(cache.lookup("users", 2, &key).await.unwrap(), None);

        cache.invalidate("users", 1, &key).await.unwrap();
        assert_eq!(cache.lookup("users", 1, &key).await.unwrap(), None);
    }

    #[test]
    fn entry_key_uses_key_string() {
        assert_eq!(
            RoutingCache::entry_key("orders", 4, &Value::Integer(42)),
            "route:orders:g4:42"
        );
    }
}
