//! In-process [`RemoteStore`] for tests and single-node setups.
//!
//! Behaves like a well-mannered Redis: honors TTLs, reports remaining
//! lifetime on reads, and can be told to go down or get slow.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::key::InvalidationPattern;
use super::remote::{RemoteStore, StoreError, StoreFuture, StoredValue};

#[derive(Debug)]
struct Slot {
    bytes: Vec<u8>,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
    available: AtomicBool,
    latency_ms: AtomicU64,
    calls: AtomicUsize,
    published: Mutex<Vec<InvalidationPattern>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            calls: AtomicUsize::new(0),
            published: Mutex::new(Vec::new()),
        }
    }

    /// While `false`, every call fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay applied to every call before it does anything.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of calls received, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Patterns passed to `publish_invalidation`, oldest first.
    pub fn published(&self) -> Vec<InvalidationPattern> {
        self.published.lock().clone()
    }

    /// Stores bytes as-is, bypassing encoding.
    pub fn insert_raw(&self, key: &str, bytes: Vec<u8>, ttl: Duration) {
        self.slots.insert(
            key.to_owned(),
            Slot {
                bytes,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Live keys, expired ones excluded.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.slots
            .iter()
            .filter(|slot| slot.expires_at > now)
            .map(|slot| slot.key().clone())
            .collect()
    }

    async fn enter(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store switched off".into()))
        }
    }
}

impl RemoteStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<StoredValue>> {
        Box::pin(async move {
            self.enter().await?;
            let now = Instant::now();
            let found = self.slots.get(key).and_then(|slot| {
                (slot.expires_at > now).then(|| StoredValue {
                    bytes: slot.bytes.clone(),
                    ttl_remaining: Some(slot.expires_at - now),
                })
            });
            if found.is_none() {
                self.slots.remove_if(key, |_, slot| slot.expires_at <= now);
            }
            Ok(found)
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.enter().await?;
            self.insert_raw(key, value, ttl);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.enter().await?;
            let now = Instant::now();
            Ok(self
                .slots
                .remove(key)
                .is_some_and(|(_, slot)| slot.expires_at > now))
        })
    }

    fn delete_matching<'a>(&'a self, pattern: &'a InvalidationPattern) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            self.enter().await?;
            let now = Instant::now();
            let mut removed = 0;
            self.slots.retain(|key, slot| {
                if pattern.matches(key) {
                    if slot.expires_at > now {
                        removed += 1;
                    }
                    false
                } else {
                    true
                }
            });
            Ok(removed)
        })
    }

    fn publish_invalidation<'a>(&'a self, pattern: &'a InvalidationPattern) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.enter().await?;
            self.published.lock().push(pattern.clone());
            Ok(())
        })
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(self.enter())
    }

    fn key_count(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            self.enter().await?;
            Ok(self.keys().len() as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_and_report_remaining_ttl() {
        let store = MemoryStore::new();
        store.set("a", b"1".to_vec(), Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        let found = store.get("a").await.unwrap().unwrap();
        assert_eq!(found.bytes, b"1");
        assert_eq!(found.ttl_remaining, Some(Duration::from_secs(6)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get("a").await.unwrap().is_none());
        assert_eq!(store.key_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_matching_counts_live_matches() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        store.set("ns:GET:/products:", vec![], ttl).await.unwrap();
        store.set("ns:GET:/products/1:", vec![], ttl).await.unwrap();
        store.set("ns:GET:/orders:", vec![], ttl).await.unwrap();

        let removed = store
            .delete_matching(&InvalidationPattern::contains("products"))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.keys(), vec!["ns:GET:/orders:".to_string()]);
    }

    #[tokio::test]
    async fn switched_off_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(store.ping().await, Err(StoreError::Unavailable(_))));
        assert!(store.get("a").await.is_err());
        assert_eq!(store.calls(), 2);
    }
}
