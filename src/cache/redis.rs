//! Redis-backed [`RemoteStore`].
//!
//! Every key this cache writes is also added to a per-namespace sorted set
//! scored by its expiry time (unix milliseconds), so pattern invalidation
//! can find its keys without a `SCAN` over the whole keyspace. Members whose
//! score has passed are dropped on every write, count and invalidation, so
//! the index tracks live keys instead of growing with traffic. Invalidation
//! patterns are broadcast on `<namespace>:invalidate` so other instances can
//! drop their local copies.
//!
//! Scores come from this process's clock. Index expiry uses
//! `PEXPIRE ... NX` / `GT` and needs Redis 7 or newer.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use deadpool_redis::{Pool, PoolConfig, Runtime};
use redis::AsyncCommands;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::key::InvalidationPattern;
use super::local::LocalTier;
use super::remote::{RemoteStore, StoreError, StoreFuture, StoredValue};
use crate::config::RemoteConfig;

const LISTENER_BACKOFF_MIN: Duration = Duration::from_secs(1);
const LISTENER_BACKOFF_MAX: Duration = Duration::from_secs(300);

pub struct RedisStore {
    pool: Pool,
    index_key: String,
    channel: String,
}

impl RedisStore {
    /// Builds the connection pool. No connection is opened until first use.
    pub fn connect(config: &RemoteConfig, namespace: &str) -> Result<Self, StoreError> {
        let url = connection_url(config)?;
        let mut pool_config = deadpool_redis::Config::from_url(url);
        let mut limits = PoolConfig::new(config.pool_size);
        let timeout = Some(config.timeout());
        limits.timeouts.wait = timeout;
        limits.timeouts.create = timeout;
        limits.timeouts.recycle = timeout;
        pool_config.pool = Some(limits);
        let pool = pool_config.create_pool(Some(Runtime::Tokio1))?;

        Ok(Self {
            pool,
            index_key: index_key(namespace),
            channel: invalidation_channel(namespace),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl RemoteStore for RedisStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<StoredValue>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            let (bytes, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
                .get(key)
                .pttl(key)
                .query_async(&mut conn)
                .await?;

            Ok(bytes.map(|bytes| StoredValue {
                bytes,
                // -1: no expiry, -2: vanished between the two commands.
                ttl_remaining: u64::try_from(pttl).ok().map(Duration::from_millis),
            }))
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let ttl_ms = ttl.as_millis().max(1) as u64;
            let now = unix_millis();
            let mut conn = self.pool.get().await?;
            let () = redis::pipe()
                .atomic()
                .pset_ex(key, value, ttl_ms)
                .ignore()
                .cmd("ZREMRANGEBYSCORE")
                .arg(&self.index_key)
                .arg("-inf")
                .arg(now)
                .ignore()
                .zadd(&self.index_key, key, now + ttl_ms)
                .ignore()
                .cmd("PEXPIRE")
                .arg(&self.index_key)
                .arg(ttl_ms)
                .arg("NX")
                .ignore()
                .cmd("PEXPIRE")
                .arg(&self.index_key)
                .arg(ttl_ms)
                .arg("GT")
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            let (deleted,): (u64,) = redis::pipe()
                .del(key)
                .zrem(&self.index_key, key)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(deleted > 0)
        })
    }

    fn delete_matching<'a>(&'a self, pattern: &'a InvalidationPattern) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            let (members,): (Vec<String>,) = redis::pipe()
                .cmd("ZREMRANGEBYSCORE")
                .arg(&self.index_key)
                .arg("-inf")
                .arg(unix_millis())
                .ignore()
                .zrange(&self.index_key, 0, -1)
                .query_async(&mut conn)
                .await?;
            let doomed: Vec<String> = members
                .into_iter()
                .filter(|key| pattern.matches(key))
                .collect();
            if doomed.is_empty() {
                return Ok(0);
            }

            let (deleted,): (u64,) = redis::pipe()
                .del(&doomed)
                .zrem(&self.index_key, &doomed)
                .ignore()
                .query_async(&mut conn)
                .await?;
            tracing::debug!(pattern = %pattern, deleted, "redis keys invalidated");
            Ok(deleted as usize)
        })
    }

    fn publish_invalidation<'a>(&'a self, pattern: &'a InvalidationPattern) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let payload = serde_json::to_string(pattern)
                .map_err(|e| StoreError::Unavailable(format!("unencodable pattern: {e}")))?;
            let mut conn = self.pool.get().await?;
            conn.publish::<_, _, ()>(&self.channel, payload).await?;
            tracing::debug!(pattern = %pattern, channel = %self.channel, "published cache invalidation");
            Ok(())
        })
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
    }

    fn key_count(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            let (count,): (u64,) = redis::pipe()
                .cmd("ZREMRANGEBYSCORE")
                .arg(&self.index_key)
                .arg("-inf")
                .arg(unix_millis())
                .ignore()
                .zcard(&self.index_key)
                .query_async(&mut conn)
                .await?;
            Ok(count)
        })
    }
}

/// Subscribes to the namespace's invalidation channel and applies every
/// pattern received to `local`. Reconnects with exponential backoff until
/// `shutdown` fires.
pub fn spawn_invalidation_listener(
    config: &RemoteConfig,
    namespace: &str,
    local: Arc<LocalTier>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, StoreError> {
    let client = redis::Client::open(connection_url(config)?)?;
    let channel = invalidation_channel(namespace);

    Ok(tokio::spawn(async move {
        let mut backoff = LISTENER_BACKOFF_MIN;
        loop {
            let error = tokio::select! {
                _ = shutdown.cancelled() => break,
                error = listen(&client, &channel, &local, &mut backoff) => error,
            };

            tracing::error!(
                error = %error,
                backoff_secs = backoff.as_secs(),
                "cache invalidation listener failed, reconnecting"
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(LISTENER_BACKOFF_MAX);
        }
        tracing::debug!("cache invalidation listener stopped");
    }))
}

// Runs one subscription until it breaks; only ever returns an error.
async fn listen(
    client: &redis::Client,
    channel: &str,
    local: &LocalTier,
    backoff: &mut Duration,
) -> StoreError {
    use futures_util::StreamExt;

    let mut pubsub = match client.get_async_pubsub().await {
        Ok(pubsub) => pubsub,
        Err(e) => return e.into(),
    };
    if let Err(e) = pubsub.subscribe(channel).await {
        return e.into();
    }
    *backoff = LISTENER_BACKOFF_MIN;
    tracing::info!(channel, "subscribed to cache invalidations");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let pattern = msg
            .get_payload::<String>()
            .ok()
            .and_then(|raw| serde_json::from_str::<InvalidationPattern>(&raw).ok());
        match pattern {
            Some(pattern) => {
                let removed = local.remove_matching(&pattern);
                tracing::debug!(pattern = %pattern, removed, "applied remote invalidation");
            }
            None => tracing::warn!(channel, "ignoring malformed invalidation message"),
        }
    }
    StoreError::Unavailable("pub/sub connection closed".into())
}

/// Folds the optional password and database into the configured URL.
pub fn connection_url(config: &RemoteConfig) -> Result<String, StoreError> {
    let mut url = Url::parse(&config.url)?;
    if let (Some(password), None) = (config.password.as_deref(), url.password()) {
        url.set_password(Some(password)).map_err(|()| {
            StoreError::Unavailable(format!("cannot set a password on {}", config.url))
        })?;
    }
    if matches!(url.path(), "" | "/") {
        url.set_path(&format!("/{}", config.database));
    }
    Ok(url.into())
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

fn index_key(namespace: &str) -> String {
    format!("{namespace}:__index")
}

fn invalidation_channel(namespace: &str) -> String {
    format!("{namespace}:invalidate")
}
