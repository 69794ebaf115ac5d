pub mod memory;

pub use memory::MemoryCache;

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::common::Result;

/// Future producing a fresh value for [`CacheAdapter::revalidate`].
pub type Producer = BoxFuture<'static, Result<Value>>;

/// Pluggable async key/value store with TTL and revalidate-on-stale
/// semantics.
///
/// Every backend must implement the full contract. Expired entries are
/// evicted lazily by whichever read discovers them, and the backend emits a
/// `cacheExpired` notification at that moment. There is no background sweep.
#[async_trait]
pub trait CacheAdapter: Send + Sync {
    async fn init(&self);
    async fn get(&self, key: &str) -> Option<Value>;
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>);
    async fn has(&self, key: &str) -> bool;
    async fn delete(&self, key: &str) -> bool;
    async fn clear(&self);
    async fn size(&self) -> usize;
    async fn keys(&self) -> Vec<String>;
    async fn values(&self) -> Vec<Value>;
    async fn entries(&self) -> Vec<(String, Value)>;

    /// Returns the cached value for `key` if present and `force` is false;
    /// otherwise invokes `producer`, stores the fresh value and returns it.
    async fn revalidate(&self, key: &str, force: bool, producer: Producer) -> Result<Value>;
}

/// Construction-time cache tuning, part of the manager options.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Disables REST response caching entirely when false.
    pub enabled: bool,
    /// Applied when `set` is called without an explicit TTL.
    pub default_ttl: Option<Duration>,
    /// Always hit the origin on idempotent GETs, refreshing the cache as a
    /// side effect. The fresh value is returned, never the stale one.
    pub revalidate_on_get: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Some(Duration::from_secs(600)),
            revalidate_on_get: false,
        }
    }
}
