//! Two-tier read-through response cache.
//!
//! ```text
//!  request ──► CacheMiddleware ──► CacheCoordinator ──► LocalTier  (in process)
//!                    │                    └───────────► RemoteTier (Redis, shared)
//!                    └── miss ──► origin handler ──► store (local now, remote spawned)
//! ```
//!
//! - [`KeyDeriver`] maps method, path, query and caller to a [`CacheKey`].
//! - [`LocalTier`] is a bounded, TTL-aware concurrent map.
//! - [`RemoteTier`] wraps a [`RemoteStore`] and turns every failure into a
//!   miss or a no-op, backing off while the store is down.
//! - [`CacheCoordinator`] does local → remote → origin lookups, backfill and
//!   pattern invalidation.
//! - [`CacheMiddleware`] plugs the coordinator into a
//!   [`Pipeline`](crate::middleware::Pipeline).
//! - [`StatsCollector`] reports hits and misses per tier.
//!
//! [`Cache`] builds all of it from a [`CacheConfig`] and owns the background
//! tasks.

pub mod codec;
pub mod coordinator;
pub mod key;
pub mod local;
pub mod memory;
pub mod middleware;
pub mod redis;
pub mod remote;
pub mod stats;

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use codec::{CachedResponse, CodecError};
pub use coordinator::{CacheCoordinator, InvalidationReport, Lookup, TierHit};
pub use key::{ANONYMOUS, CacheKey, InvalidationPattern, KeyDeriver, KeyError};
pub use local::LocalTier;
pub use memory::MemoryStore;
pub use middleware::{CacheMiddleware, CachePolicy};
pub use self::redis::RedisStore;
pub use remote::{Reachability, RemoteSettings, RemoteStore, RemoteTier, StoreError};
pub use stats::{CacheStats, StatsCollector, TierStats};

use crate::config::{CacheConfig, ConfigError};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The assembled cache: tiers, coordinator, policy and background tasks.
///
/// Built once at startup and shared by `Arc`:
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tiercache::cache::Cache;
/// use tiercache::config::CacheConfig;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let cache = Arc::new(Cache::connect(&CacheConfig::load(None)?).await?);
/// let middleware = cache.middleware();
/// // ... serve ...
/// cache.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Cache {
    coordinator: Arc<CacheCoordinator>,
    policy: CachePolicy,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Cache {
    /// Builds the cache described by `config`, connecting to Redis when the
    /// remote tier is enabled.
    ///
    /// An unreachable Redis is not an error: the cache starts degraded and
    /// the heartbeat reconnects it later. A malformed URL is.
    pub async fn connect(config: &CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;

        if !config.remote.enabled {
            tracing::info!("remote cache disabled, using local tier only");
            return Ok(Self::with_store(config, None));
        }

        tracing::info!(url = %config.remote.url, "connecting to remote cache");
        let store: Arc<dyn RemoteStore> =
            Arc::new(RedisStore::connect(&config.remote, &config.namespace)?);
        let cache = Self::with_store(config, Some(store));

        match cache.coordinator.remote().ping().await {
            Reachability::Reachable => tracing::info!("connected to remote cache"),
            Reachability::Unreachable => {
                tracing::warn!("remote cache unreachable at startup, continuing with local tier")
            }
        }

        let listener = self::redis::spawn_invalidation_listener(
            &config.remote,
            &config.namespace,
            Arc::clone(cache.coordinator.local()),
            cache.shutdown.child_token(),
        )?;
        cache.tasks.lock().push(listener);

        Ok(cache)
    }

    /// Builds the cache over an arbitrary remote store (`None` for local
    /// only) and starts the sweeper and heartbeat. Must run inside a Tokio
    /// runtime.
    pub fn with_store(config: &CacheConfig, store: Option<Arc<dyn RemoteStore>>) -> Self {
        let local = Arc::new(LocalTier::new(config.local.capacity));
        let remote = Arc::new(match store {
            Some(store) => RemoteTier::new(store, config.remote.settings()),
            None => RemoteTier::disabled(),
        });
        let deriver =
            KeyDeriver::new(config.namespace.clone()).with_max_len(config.policy.max_key_len);
        let policy = CachePolicy::from_config(&config.policy);

        let coordinator = Arc::new(CacheCoordinator::new(
            Arc::clone(&local),
            Arc::clone(&remote),
            deriver,
            std::time::Duration::from_secs(config.policy.default_ttl_secs),
        ));

        let shutdown = CancellationToken::new();
        let mut tasks = vec![local.spawn_sweeper(
            config.local.sweep_interval(),
            shutdown.child_token(),
        )];
        if remote.is_enabled() {
            tasks.push(remote.spawn_heartbeat(
                config.remote.heartbeat_interval(),
                shutdown.child_token(),
            ));
        }

        Self {
            coordinator,
            policy,
            shutdown,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn coordinator(&self) -> &Arc<CacheCoordinator> {
        &self.coordinator
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn stats(&self) -> &StatsCollector {
        self.coordinator.stats()
    }

    /// A middleware layer serving from this cache under its configured policy.
    pub fn middleware(&self) -> CacheMiddleware {
        CacheMiddleware::new(Arc::clone(&self.coordinator), self.policy.clone())
    }

    /// Shorthand for [`CacheCoordinator::invalidate`].
    pub async fn invalidate(&self, pattern: impl Into<InvalidationPattern>) -> InvalidationReport {
        self.coordinator.invalidate(pattern).await
    }

    /// Stops the background tasks and empties the local tier. Remote
    /// entries are left to expire.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "cache background task ended abnormally");
            }
        }
        self.coordinator.local().clear();
        tracing::info!("cache shut down");
    }
}
