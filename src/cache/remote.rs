//! Shared, out-of-process tier.
//!
//! [`RemoteTier`] wraps a [`RemoteStore`] (Redis in production, see
//! [`RedisStore`](super::redis::RedisStore)) and owns the failure-handling
//! contract of the whole cache: nothing it does can fail a request.
//!
//! - every store call runs under a timeout;
//! - errors, timeouts and undecodable values become misses or no-ops;
//! - after `failure_threshold` consecutive failures the tier is *degraded*:
//!   calls return immediately without touching the network until a backoff
//!   window has passed, then a single call probes the store. Each failed
//!   probe doubles the window up to `backoff_max`; any success heals it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::codec::{self, CachedResponse, CodecError};
use super::key::{CacheKey, InvalidationPattern};
use super::stats::{Counters, TierStats};

/// Errors raised by a [`RemoteStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("failed to create redis pool: {0}")]
    CreatePool(#[from] deadpool_redis::CreatePoolError),

    #[error("invalid redis url: {0}")]
    Url(#[from] url::ParseError),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Why a remote call produced no result. Never leaves this module as an
/// error; it is logged and turned into a miss or a no-op.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote cache call timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote cache is degraded; skipping call")]
    Degraded,

    #[error("remote cache is disabled")]
    Disabled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Boxed future returned by [`RemoteStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Raw bytes read from the store, with the entry's remaining lifetime when
/// the store can report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub bytes: Vec<u8>,
    pub ttl_remaining: Option<Duration>,
}

/// A network key-value store the remote tier can sit on.
///
/// Implementations report failures honestly; [`RemoteTier`] decides what
/// to do about them.
pub trait RemoteStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<StoredValue>>;

    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>, ttl: Duration) -> StoreFuture<'a, ()>;

    /// Returns `true` if the key existed.
    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

    /// Deletes every stored key matching `pattern`; returns how many.
    fn delete_matching<'a>(&'a self, pattern: &'a InvalidationPattern) -> StoreFuture<'a, usize>;

    /// Tells peer instances to drop local copies matching `pattern`.
    fn publish_invalidation<'a>(&'a self, pattern: &'a InvalidationPattern) -> StoreFuture<'a, ()>;

    fn ping(&self) -> StoreFuture<'_, ()>;

    /// Approximate number of keys this cache holds in the store.
    fn key_count(&self) -> StoreFuture<'_, u64>;
}

/// Result of [`RemoteTier::ping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable,
}

/// Failure handling knobs for [`RemoteTier`].
#[derive(Debug, Clone, Copy)]
pub struct RemoteSettings {
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(250),
            failure_threshold: 3,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Health {
    consecutive_failures: u32,
    retry_at: Option<Instant>,
    backoff: Duration,
}

/// Remote cache tier with soft failure semantics.
pub struct RemoteTier {
    store: Option<Arc<dyn RemoteStore>>,
    settings: RemoteSettings,
    health: Mutex<Health>,
    counters: Counters,
}

impl RemoteTier {
    pub fn new(store: Arc<dyn RemoteStore>, settings: RemoteSettings) -> Self {
        Self::build(Some(store), settings)
    }

    /// A tier with no store: every read misses, every write is a no-op.
    pub fn disabled() -> Self {
        Self::build(None, RemoteSettings::default())
    }

    fn build(store: Option<Arc<dyn RemoteStore>>, settings: RemoteSettings) -> Self {
        let settings = RemoteSettings {
            failure_threshold: settings.failure_threshold.max(1),
            ..settings
        };
        Self {
            store,
            health: Mutex::new(Health {
                consecutive_failures: 0,
                retry_at: None,
                backoff: settings.backoff_initial,
            }),
            settings,
            counters: Counters::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// `true` while calls are being short-circuited after repeated failures.
    pub fn is_degraded(&self) -> bool {
        self.health.lock().consecutive_failures >= self.settings.failure_threshold
    }

    /// Fetches and decodes `key`. Any failure is a miss.
    pub async fn get(&self, key: &CacheKey) -> Option<(CachedResponse, Option<Duration>)> {
        let result = self
            .call(|store| store.get(key.as_str()))
            .await
            .and_then(|found| match found {
                Some(stored) => {
                    let value = codec::decode(&stored.bytes)?;
                    Ok(Some((value, stored.ttl_remaining)))
                }
                None => Ok(None),
            });

        match result {
            Ok(Some(found)) => {
                self.counters.hit();
                tracing::debug!(key = %key, "remote cache hit");
                Some(found)
            }
            Ok(None) => {
                self.counters.miss();
                None
            }
            Err(e) => {
                self.counters.miss();
                log_soft_failure("get", key.as_str(), &e);
                None
            }
        }
    }

    /// Encodes and writes `key`. Returns `false` if the write did not happen.
    pub async fn set(&self, key: &CacheKey, value: &CachedResponse, ttl: Duration) -> bool {
        let bytes = match codec::encode(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                log_soft_failure("set", key.as_str(), &RemoteError::Codec(e));
                return false;
            }
        };

        match self.call(|store| store.set(key.as_str(), bytes, ttl)).await {
            Ok(()) => true,
            Err(e) => {
                log_soft_failure("set", key.as_str(), &e);
                false
            }
        }
    }

    /// Deletes `key`. Returns `false` on failure or if it was absent.
    pub async fn delete(&self, key: &CacheKey) -> bool {
        match self.call(|store| store.delete(key.as_str())).await {
            Ok(existed) => existed,
            Err(e) => {
                log_soft_failure("delete", key.as_str(), &e);
                false
            }
        }
    }

    /// Deletes matching keys; `None` if the store could not be asked.
    pub async fn delete_matching(&self, pattern: &InvalidationPattern) -> Option<usize> {
        match self.call(|store| store.delete_matching(pattern)).await {
            Ok(removed) => Some(removed),
            Err(e) => {
                log_soft_failure("delete_matching", pattern.as_str(), &e);
                None
            }
        }
    }

    /// Fans `pattern` out to peers. Returns `false` if it was not sent.
    pub async fn publish_invalidation(&self, pattern: &InvalidationPattern) -> bool {
        match self.call(|store| store.publish_invalidation(pattern)).await {
            Ok(()) => true,
            Err(e) => {
                log_soft_failure("publish", pattern.as_str(), &e);
                false
            }
        }
    }

    /// Checks the store. While degraded and inside the backoff window this
    /// answers `Unreachable` without any network traffic.
    pub async fn ping(&self) -> Reachability {
        match self.call(|store| store.ping()).await {
            Ok(()) => Reachability::Reachable,
            Err(RemoteError::Degraded | RemoteError::Disabled) => Reachability::Unreachable,
            Err(e) => {
                tracing::debug!(error = %e, "remote cache ping failed");
                Reachability::Unreachable
            }
        }
    }

    /// Keys this cache holds in the store; `None` if the store cannot say.
    pub async fn key_count(&self) -> Option<u64> {
        match self.call(|store| store.key_count()).await {
            Ok(count) => Some(count),
            Err(e) => {
                log_soft_failure("key_count", "*", &e);
                None
            }
        }
    }

    /// Hit/miss counters plus the store's key count (`0` if unknown).
    pub async fn stats(&self) -> TierStats {
        let key_count = self.key_count().await.unwrap_or(0);
        self.counters.snapshot(key_count)
    }

    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    /// Pings the store every `interval` so a degraded tier heals without
    /// waiting for request traffic. Stops when `shutdown` fires.
    pub fn spawn_heartbeat(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if !self.is_enabled() {
                            break;
                        }
                        self.ping().await;
                    }
                }
            }
            tracing::debug!("remote cache heartbeat stopped");
        })
    }

    // Runs one store call through the degraded gate and the timeout, and
    // feeds the outcome back into the health state.
    async fn call<'a, T, F>(&'a self, op: F) -> Result<T, RemoteError>
    where
        F: FnOnce(&'a dyn RemoteStore) -> StoreFuture<'a, T>,
    {
        let Some(store) = self.store.as_deref() else {
            return Err(RemoteError::Disabled);
        };
        if !self.admit() {
            return Err(RemoteError::Degraded);
        }

        let outcome = match tokio::time::timeout(self.settings.timeout, op(store)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(RemoteError::Store(e)),
            Err(_) => Err(RemoteError::Timeout(self.settings.timeout)),
        };

        match &outcome {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        outcome
    }

    // Whether a call may go to the network right now. Inside the backoff
    // window it may not; once the window passes, exactly one caller gets
    // through as the probe and the window is pushed out for everyone else.
    fn admit(&self) -> bool {
        let mut health = self.health.lock();
        match health.retry_at {
            Some(at) if Instant::now() < at => false,
            Some(_) => {
                health.retry_at = Some(Instant::now() + health.backoff);
                true
            }
            None => true,
        }
    }

    fn record_success(&self) {
        let mut health = self.health.lock();
        if health.consecutive_failures >= self.settings.failure_threshold {
            tracing::info!("remote cache reachable again; leaving degraded mode");
        }
        health.consecutive_failures = 0;
        health.retry_at = None;
        health.backoff = self.settings.backoff_initial;
    }

    fn record_failure(&self) {
        let mut health = self.health.lock();
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        if health.consecutive_failures < self.settings.failure_threshold {
            return;
        }

        if health.consecutive_failures == self.settings.failure_threshold {
            tracing::warn!(
                failures = health.consecutive_failures,
                retry_in_ms = health.backoff.as_millis() as u64,
                "remote cache degraded; serving from local tier only"
            );
        } else {
            health.backoff = (health.backoff * 2).min(self.settings.backoff_max);
        }
        health.retry_at = Some(Instant::now() + health.backoff);
    }
}

fn log_soft_failure(op: &'static str, subject: &str, error: &RemoteError) {
    match error {
        // Expected while degraded or disabled; logging each call would flood.
        RemoteError::Degraded | RemoteError::Disabled => {
            tracing::trace!(op, subject, "remote cache call skipped");
        }
        _ => tracing::warn!(op, subject, error = %error, "remote cache call failed; continuing without it"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryStore;
    use serde_json::json;

    fn settings() -> RemoteSettings {
        RemoteSettings {
            timeout: Duration::from_millis(50),
            failure_threshold: 2,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(4),
        }
    }

    fn tier() -> (Arc<MemoryStore>, RemoteTier) {
        let store = Arc::new(MemoryStore::new());
        let tier = RemoteTier::new(store.clone(), settings());
        (store, tier)
    }

    #[tokio::test]
    async fn set_get_delete() {
        let (_, tier) = tier();
        let key = CacheKey::from("k");
        let value = CachedResponse::json(json!({"a": [1, 2, 3]}));

        assert!(tier.set(&key, &value, Duration::from_secs(60)).await);
        let (found, ttl) = tier.get(&key).await.unwrap();
        assert_eq!(found, value);
        assert!(ttl.is_some_and(|t| t <= Duration::from_secs(60)));

        assert_eq!(tier.key_count().await, Some(1));
        assert!(tier.delete(&key).await);
        assert!(tier.get(&key).await.is_none());
        assert_eq!(tier.key_count().await, Some(0));
    }

    #[tokio::test]
    async fn outage_turns_into_misses() {
        let (store, tier) = tier();
        store.set_available(false);
        let key = CacheKey::from("k");

        assert!(tier.get(&key).await.is_none());
        assert!(!tier.set(&key, &CachedResponse::json(json!(1)), Duration::from_secs(1)).await);
        assert!(!tier.delete(&key).await);
        assert_eq!(tier.delete_matching(&"k".into()).await, None);
        assert_eq!(tier.ping().await, Reachability::Unreachable);
    }

    #[tokio::test]
    async fn undecodable_values_are_misses() {
        let (store, tier) = tier();
        store.insert_raw("k", b"not json".to_vec(), Duration::from_secs(60));
        assert!(tier.get(&CacheKey::from("k")).await.is_none());
        assert_eq!(tier.stats().await.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out() {
        let (store, tier) = tier();
        store.set_latency(Duration::from_secs(5));
        let started = Instant::now();
        assert!(tier.get(&CacheKey::from("k")).await.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn degrades_after_threshold_and_stops_calling() {
        let (store, tier) = tier();
        store.set_available(false);
        let key = CacheKey::from("k");

        tier.get(&key).await;
        assert!(!tier.is_degraded());
        tier.get(&key).await;
        assert!(tier.is_degraded());

        let calls = store.calls();
        for _ in 0..10 {
            assert!(tier.get(&key).await.is_none());
        }
        assert_eq!(store.calls(), calls, "degraded tier must not hit the store");
        assert_eq!(tier.ping().await, Reachability::Unreachable);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_backoff_window() {
        let (store, tier) = tier();
        store.set_available(false);
        let key = CacheKey::from("k");
        tier.get(&key).await;
        tier.get(&key).await;
        assert!(tier.is_degraded());

        store.set_available(true);
        // Still inside the window: no probe yet.
        assert_eq!(tier.ping().await, Reachability::Unreachable);

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert_eq!(tier.ping().await, Reachability::Reachable);
        assert!(!tier.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probes_double_the_window_up_to_the_cap() {
        let (store, tier) = tier();
        store.set_available(false);
        let key = CacheKey::from("k");
        tier.get(&key).await;
        tier.get(&key).await;

        // 1s window, probe fails -> 2s window.
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(tier.ping().await, Reachability::Unreachable);
        let calls = store.calls();
        tokio::time::advance(Duration::from_millis(1500)).await;
        tier.get(&key).await;
        assert_eq!(store.calls(), calls, "still inside the doubled window");

        tokio::time::advance(Duration::from_millis(600)).await;
        tier.get(&key).await;
        assert_eq!(store.calls(), calls + 1);

        // 4s is the ceiling.
        for _ in 0..3 {
            tokio::time::advance(Duration::from_millis(4001)).await;
            let before = store.calls();
            tier.get(&key).await;
            assert_eq!(store.calls(), before + 1);
        }
    }

    #[tokio::test]
    async fn disabled_tier_is_inert() {
        let tier = RemoteTier::disabled();
        let key = CacheKey::from("k");
        assert!(!tier.is_enabled());
        assert!(tier.get(&key).await.is_none());
        assert!(!tier.set(&key, &CachedResponse::json(json!(null)), Duration::from_secs(1)).await);
        assert_eq!(tier.ping().await, Reachability::Unreachable);
        assert!(!tier.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_heals_without_traffic() {
        let (store, tier) = tier();
        let tier = Arc::new(tier);
        store.set_available(false);
        tier.get(&CacheKey::from("k")).await;
        tier.get(&CacheKey::from("k")).await;
        assert!(tier.is_degraded());
        store.set_available(true);

        let token = CancellationToken::new();
        let handle = Arc::clone(&tier).spawn_heartbeat(Duration::from_millis(500), token.clone());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!tier.is_degraded());

        token.cancel();
        handle.await.unwrap();
    }
}
