use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::{
    common::Result,
    events::{EventEmitter, LunalinkEvent},
};

use super::{CacheAdapter, CacheOptions, Producer};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    /// Absolute expiry; `None` means the entry never expires.
    expires_at: Option<Instant>,
    created_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// The bundled in-process cache backend.
///
/// Entries are checked for expiry on the read path only; the read that finds
/// a stale entry evicts it and emits `cacheExpired`.
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    options: CacheOptions,
    emitter: EventEmitter,
}

impl MemoryCache {
    pub fn new(options: CacheOptions, emitter: EventEmitter) -> Self {
        Self {
            entries: DashMap::new(),
            options,
            emitter,
        }
    }

    /// Removes the entry when expired, emitting `cacheExpired`. Returns the
    /// live value otherwise.
    fn read_live(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => return Some(entry.value.clone()),
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            debug!("cache entry '{}' expired after read", key);
            self.emitter.emit(LunalinkEvent::CacheExpired {
                key: key.to_string(),
            });
        }
        None
    }

    /// Age of a live entry, mostly useful for diagnostics.
    pub fn entry_age(&self, key: &str) -> Option<Duration> {
        let entry = self.entries.get(key)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(entry.created_at.elapsed())
    }
}

#[async_trait]
impl CacheAdapter for MemoryCache {
    async fn init(&self) {
        self.emitter.emit(LunalinkEvent::CacheInitialized);
    }

    async fn get(&self, key: &str) -> Option<Value> {
        self.read_live(key)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let ttl = ttl.or(self.options.default_ttl);
        let now = Instant::now();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: ttl.map(|d| now + d),
                created_at: now,
            },
        );
        self.emitter.emit(LunalinkEvent::CacheSet {
            key: key.to_string(),
        });
    }

    async fn has(&self, key: &str) -> bool {
        self.read_live(key).is_some()
    }

    async fn delete(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.emitter.emit(LunalinkEvent::CacheDelete {
                key: key.to_string(),
            });
        }
        removed
    }

    async fn clear(&self) {
        self.entries.clear();
        self.emitter.emit(LunalinkEvent::CacheClear);
    }

    async fn size(&self) -> usize {
        self.entries.len()
    }

    async fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    async fn values(&self) -> Vec<Value> {
        self.entries.iter().map(|e| e.value().value.clone()).collect()
    }

    async fn entries(&self) -> Vec<(String, Value)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect()
    }

    async fn revalidate(&self, key: &str, force: bool, producer: Producer) -> Result<Value> {
        if !force {
            if let Some(value) = self.read_live(key) {
                return Ok(value);
            }
        }
        let fresh = producer.await?;
        self.set(key, fresh.clone(), None).await;
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    fn cache_with_ttl(ttl_ms: u64) -> (MemoryCache, tokio::sync::mpsc::UnboundedReceiver<LunalinkEvent>) {
        let (emitter, rx) = EventEmitter::channel();
        let cache = MemoryCache::new(
            CacheOptions {
                enabled: true,
                default_ttl: Some(Duration::from_millis(ttl_ms)),
                revalidate_on_get: false,
            },
            emitter,
        );
        (cache, rx)
    }

    fn counting_producer(counter: Arc<AtomicU32>, value: Value) -> Producer {
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        })
    }

    #[tokio::test]
    async fn set_get_roundtrip() {
        let (cache, _rx) = cache_with_ttl(60_000);
        cache.set("k", serde_json::json!({"a": 1}), None).await;
        assert_eq!(cache.get("k").await, Some(serde_json::json!({"a": 1})));
        assert!(cache.has("k").await);
        assert_eq!(cache.size().await, 1);
    }

    #[tokio::test]
    async fn revalidate_skips_producer_within_ttl() {
        let (cache, _rx) = cache_with_ttl(60_000);
        let calls = Arc::new(AtomicU32::new(0));

        let first = cache
            .revalidate("k", false, counting_producer(calls.clone(), serde_json::json!(1)))
            .await
            .unwrap();
        let second = cache
            .revalidate("k", false, counting_producer(calls.clone(), serde_json::json!(2)))
            .await
            .unwrap();

        assert_eq!(first, serde_json::json!(1));
        assert_eq!(second, serde_json::json!(1), "cached value must win");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn revalidate_forced_always_calls_producer() {
        let (cache, _rx) = cache_with_ttl(60_000);
        let calls = Arc::new(AtomicU32::new(0));

        for expected in [1, 2] {
            let value = cache
                .revalidate(
                    "k",
                    true,
                    counting_producer(calls.clone(), serde_json::json!(expected)),
                )
                .await
                .unwrap();
            assert_eq!(value, serde_json::json!(expected), "fresh value is returned");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expiry_is_lazy_and_emits_notification() {
        let (cache, mut rx) = cache_with_ttl(20);
        cache.set("k", serde_json::json!("v"), None).await;
        // drain the cacheSet event
        assert!(matches!(rx.recv().await, Some(LunalinkEvent::CacheSet { .. })));

        tokio::time::sleep(Duration::from_millis(40)).await;
        // Entry still physically present until a read discovers it.
        assert_eq!(cache.entries.len(), 1);

        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.entries.len(), 0);
        match rx.recv().await {
            Some(LunalinkEvent::CacheExpired { key }) => assert_eq!(key, "k"),
            other => panic!("expected cacheExpired, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn expired_entry_revalidates_producer_exactly_once() {
        let (cache, _rx) = cache_with_ttl(20);
        let calls = Arc::new(AtomicU32::new(0));

        cache
            .revalidate("k", false, counting_producer(calls.clone(), serde_json::json!(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let value = cache
            .revalidate("k", false, counting_producer(calls.clone(), serde_json::json!(2)))
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn delete_and_clear_emit_events() {
        let (cache, mut rx) = cache_with_ttl(60_000);
        cache.set("a", serde_json::json!(1), None).await;
        cache.set("b", serde_json::json!(2), None).await;
        assert!(cache.delete("a").await);
        assert!(!cache.delete("a").await, "second delete is a no-op");
        cache.clear().await;
        assert_eq!(cache.size().await, 0);

        let mut saw_delete = false;
        let mut saw_clear = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                LunalinkEvent::CacheDelete { key } => {
                    assert_eq!(key, "a");
                    saw_delete = true;
                }
                LunalinkEvent::CacheClear => saw_clear = true,
                _ => {}
            }
        }
        assert!(saw_delete && saw_clear);
    }
}
