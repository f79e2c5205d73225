//! Read-through orchestration across the two tiers.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

use super::codec::CachedResponse;
use super::key::{CacheKey, InvalidationPattern, KeyDeriver};
use super::local::LocalTier;
use super::remote::RemoteTier;
use super::stats::StatsCollector;

/// Which tier answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierHit {
    Local,
    Remote,
}

impl TierHit {
    /// Value of the `X-Cache` header for this hit.
    pub fn marker(self) -> &'static str {
        match self {
            Self::Local => "HIT-LOCAL",
            Self::Remote => "HIT-REMOTE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit { value: CachedResponse, tier: TierHit },
    Miss,
}

/// What an invalidation managed to remove.
///
/// `remote_removed` is `None` when the remote tier is disabled or could not
/// be reached; its entries then live until their TTL runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub local_removed: usize,
    pub remote_removed: Option<usize>,
}

/// Local tier first, then remote, then the caller's origin.
pub struct CacheCoordinator {
    local: Arc<LocalTier>,
    remote: Arc<RemoteTier>,
    deriver: KeyDeriver,
    stats: StatsCollector,
    backfill_ttl: Duration,
}

impl CacheCoordinator {
    /// `backfill_ttl` applies to local copies of remote entries whose
    /// remaining lifetime the store could not report.
    pub fn new(
        local: Arc<LocalTier>,
        remote: Arc<RemoteTier>,
        deriver: KeyDeriver,
        backfill_ttl: Duration,
    ) -> Self {
        let stats = StatsCollector::new(Arc::clone(&local), Arc::clone(&remote));
        Self {
            local,
            remote,
            deriver,
            stats,
            backfill_ttl,
        }
    }

    pub fn deriver(&self) -> &KeyDeriver {
        &self.deriver
    }

    pub fn local(&self) -> &Arc<LocalTier> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<RemoteTier> {
        &self.remote
    }

    pub fn stats(&self) -> &StatsCollector {
        &self.stats
    }

    pub async fn lookup(&self, key: &CacheKey) -> Lookup {
        if let Some(value) = self.local.get(key) {
            tracing::debug!(key = %key, "local cache hit");
            return Lookup::Hit {
                value,
                tier: TierHit::Local,
            };
        }

        match self.remote.get(key).await {
            Some((value, remaining)) => {
                let ttl = remaining.unwrap_or(self.backfill_ttl);
                if !ttl.is_zero() {
                    self.local.set(key.clone(), value.clone(), ttl);
                }
                Lookup::Hit {
                    value,
                    tier: TierHit::Remote,
                }
            }
            None => {
                tracing::debug!(key = %key, "cache miss");
                Lookup::Miss
            }
        }
    }

    /// Writes `value` to the local tier (when `write_local`) and to the
    /// remote tier. A remote failure is logged and otherwise ignored.
    pub async fn store(&self, key: CacheKey, value: CachedResponse, ttl: Duration, write_local: bool) {
        if write_local {
            self.local.set(key.clone(), value.clone(), ttl);
        }
        if self.remote.set(&key, &value, ttl).await {
            tracing::debug!(key = %key, ttl_secs = ttl.as_secs(), "cached response stored");
        }
    }

    /// Like [`store`](Self::store) but only the local write happens before
    /// this returns; the remote write runs on a spawned task.
    pub fn store_detached(
        &self,
        key: CacheKey,
        value: CachedResponse,
        ttl: Duration,
        write_local: bool,
    ) -> JoinHandle<()> {
        if write_local {
            self.local.set(key.clone(), value.clone(), ttl);
        }
        let remote = Arc::clone(&self.remote);
        tokio::spawn(async move {
            if remote.set(&key, &value, ttl).await {
                tracing::debug!(key = %key, ttl_secs = ttl.as_secs(), "cached response stored");
            }
        })
    }

    /// Drops every entry whose key matches `pattern`: locally, in the remote
    /// store, and (via pub/sub) in peer instances' local tiers.
    pub async fn invalidate(&self, pattern: impl Into<InvalidationPattern>) -> InvalidationReport {
        let pattern = pattern.into();
        let local_removed = self.local.remove_matching(&pattern);

        let remote_removed = if self.remote.is_enabled() {
            let removed = self.remote.delete_matching(&pattern).await;
            self.remote.publish_invalidation(&pattern).await;
            removed
        } else {
            None
        };

        let report = InvalidationReport {
            local_removed,
            remote_removed,
        };
        tracing::debug!(
            pattern = %pattern,
            local_removed,
            remote_removed = ?remote_removed,
            "cache invalidated"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Method;
    use crate::cache::memory::MemoryStore;
    use crate::cache::remote::RemoteSettings;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(60);

    struct Fixture {
        store: Arc<MemoryStore>,
        coordinator: CacheCoordinator,
    }

    fn fixture(capacity: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(RemoteTier::new(store.clone(), RemoteSettings::default()));
        let coordinator = CacheCoordinator::new(
            Arc::new(LocalTier::new(capacity)),
            remote,
            KeyDeriver::new("t"),
            Duration::from_secs(30),
        );
        Fixture { store, coordinator }
    }

    fn key(path: &str) -> CacheKey {
        KeyDeriver::new("t")
            .derive(&Method::Get, path, &[] as &[(&str, &str)], None)
            .unwrap()
    }

    fn body(n: i64) -> CachedResponse {
        CachedResponse::json(json!({ "n": n }))
    }

    #[tokio::test]
    async fn miss_then_local_hit() {
        let f = fixture(8);
        let k = key("/a");
        assert_eq!(f.coordinator.lookup(&k).await, Lookup::Miss);

        f.coordinator.store(k.clone(), body(1), TTL, true).await;
        assert_eq!(
            f.coordinator.lookup(&k).await,
            Lookup::Hit {
                value: body(1),
                tier: TierHit::Local
            }
        );
    }

    #[tokio::test]
    async fn local_tier_takes_precedence() {
        let f = fixture(8);
        let k = key("/a");
        f.coordinator.remote().set(&k, &body(2), TTL).await;
        f.coordinator.local().set(k.clone(), body(1), TTL);

        let calls = f.store.calls();
        match f.coordinator.lookup(&k).await {
            Lookup::Hit { value, tier } => {
                assert_eq!(tier, TierHit::Local);
                assert_eq!(value, body(1));
            }
            Lookup::Miss => panic!("expected a hit"),
        }
        assert_eq!(f.store.calls(), calls, "local hit must not touch the remote tier");
    }

    #[tokio::test(start_paused = true)]
    async fn remote_hit_backfills_with_remaining_ttl() {
        let f = fixture(8);
        let k = key("/a");
        f.coordinator.remote().set(&k, &body(7), Duration::from_secs(10)).await;
        tokio::time::advance(Duration::from_secs(4)).await;

        assert!(matches!(
            f.coordinator.lookup(&k).await,
            Lookup::Hit { tier: TierHit::Remote, .. }
        ));
        assert_eq!(f.coordinator.local().get(&k), Some(body(7)));

        // The local copy expires with the remote entry, not 30s later.
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(f.coordinator.local().get(&k), None);
    }

    #[tokio::test]
    async fn write_local_false_skips_local_tier() {
        let f = fixture(8);
        let k = key("/a");
        f.coordinator.store(k.clone(), body(1), TTL, false).await;
        assert!(f.coordinator.local().is_empty());
        assert_eq!(f.store.keys(), vec![k.as_str().to_string()]);
    }

    #[tokio::test]
    async fn remote_outage_is_a_plain_miss() {
        let f = fixture(8);
        f.store.set_available(false);
        let k = key("/a");

        assert_eq!(f.coordinator.lookup(&k).await, Lookup::Miss);
        f.coordinator.store(k.clone(), body(1), TTL, true).await;
        assert!(matches!(
            f.coordinator.lookup(&k).await,
            Lookup::Hit { tier: TierHit::Local, .. }
        ));

        let report = f.coordinator.invalidate("/a").await;
        assert_eq!(report.local_removed, 1);
        assert_eq!(report.remote_removed, None);
    }

    #[tokio::test]
    async fn invalidation_only_touches_matching_keys() {
        let f = fixture(8);
        for path in ["/products", "/products/1", "/orders"] {
            f.coordinator.store(key(path), body(0), TTL, true).await;
        }

        let report = f.coordinator.invalidate("products").await;
        assert_eq!(
            report,
            InvalidationReport {
                local_removed: 2,
                remote_removed: Some(2)
            }
        );
        assert_eq!(f.coordinator.local().keys(), vec![key("/orders")]);
        assert_eq!(f.store.keys(), vec![key("/orders").into_string()]);
        assert_eq!(f.store.published(), vec![InvalidationPattern::contains("products")]);
    }

    #[tokio::test]
    async fn disabled_remote_reports_none() {
        let coordinator = CacheCoordinator::new(
            Arc::new(LocalTier::new(4)),
            Arc::new(RemoteTier::disabled()),
            KeyDeriver::new("t"),
            TTL,
        );
        coordinator.store(key("/a"), body(1), TTL, true).await;
        let report = coordinator.invalidate("/a").await;
        assert_eq!(report.local_removed, 1);
        assert_eq!(report.remote_removed, None);
    }

    #[tokio::test]
    async fn detached_store_writes_local_before_returning() {
        let f = fixture(8);
        let k = key("/a");
        let handle = f.coordinator.store_detached(k.clone(), body(3), TTL, true);
        assert_eq!(f.coordinator.local().get(&k), Some(body(3)));
        handle.await.unwrap();
        assert_eq!(f.store.keys(), vec![k.into_string()]);
    }
}
