//! Request-path integration.

use std::sync::Arc;
use std::time::Duration;

use super::codec::CachedResponse;
use super::coordinator::{CacheCoordinator, Lookup};
use crate::config::PolicyConfig;
use crate::context::{CallerIdentity, Context};
use crate::middleware::{Middleware, Next, ResponseFuture};
use crate::Method;

/// Header carrying the cache outcome on every eligible request.
pub const CACHE_STATUS_HEADER: &str = "X-Cache";

/// Marker for a request the origin had to answer.
pub const MISS: &str = "MISS";

/// Which requests are cached and for how long.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    methods: Vec<Method>,
    default_ttl: Duration,
    // Sorted longest prefix first.
    routes: Vec<(String, Duration)>,
    excluded: Vec<String>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl CachePolicy {
    /// Caches `GET` only, for `default_ttl`.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            methods: vec![Method::Get],
            default_ttl,
            routes: Vec::new(),
            excluded: Vec::new(),
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        let mut policy = Self::new(Duration::from_secs(config.default_ttl_secs))
            .methods(config.methods());
        for route in &config.routes {
            policy = policy.route(route.prefix.clone(), Duration::from_secs(route.ttl_secs));
        }
        for prefix in &config.exclude {
            policy = policy.exclude(prefix.clone());
        }
        policy
    }

    /// Replaces the cacheable method set. Methods with side effects are
    /// dropped.
    #[must_use]
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().filter(Method::is_safe).collect();
        self
    }

    /// Uses `ttl` for paths starting with `prefix`. The longest matching
    /// prefix wins.
    #[must_use]
    pub fn route(mut self, prefix: impl Into<String>, ttl: Duration) -> Self {
        self.routes.push((prefix.into(), ttl));
        self.routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    /// Never caches paths starting with `prefix`, whatever the method.
    #[must_use]
    pub fn exclude(mut self, prefix: impl Into<String>) -> Self {
        self.excluded.push(prefix.into());
        self
    }

    pub fn is_cacheable(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Whether a request is handled by the cache at all.
    pub fn is_eligible(&self, method: &Method, path: &str) -> bool {
        self.is_cacheable(method) && !self.is_excluded(path)
    }

    pub fn ttl_for(&self, path: &str) -> Duration {
        self.routes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map_or(self.default_ttl, |(_, ttl)| *ttl)
    }
}

/// Serves eligible requests from the cache and stores what the origin
/// returns on a miss.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use tiercache::cache::{CacheCoordinator, CacheMiddleware, CachePolicy};
/// # use tiercache::middleware::{LoggerMiddleware, Pipeline};
/// # use tiercache::{Response, StatusCode};
/// # fn demo(coordinator: Arc<CacheCoordinator>) {
/// let pipeline = Pipeline::new()
///     .layer(LoggerMiddleware)
///     .layer(CacheMiddleware::new(coordinator, CachePolicy::default()))
///     .handler(|_ctx| async { Response::new(StatusCode::Ok).body("origin") });
/// # }
/// ```
pub struct CacheMiddleware {
    coordinator: Arc<CacheCoordinator>,
    policy: Arc<CachePolicy>,
}

impl CacheMiddleware {
    pub fn new(coordinator: Arc<CacheCoordinator>, policy: CachePolicy) -> Self {
        Self {
            coordinator,
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }
}

impl Middleware for CacheMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> ResponseFuture {
        let coordinator = Arc::clone(&self.coordinator);
        let policy = Arc::clone(&self.policy);

        Box::pin(async move {
            let request = ctx.request();
            if !policy.is_eligible(request.method(), request.path()) {
                return next.run(ctx).await;
            }

            let key = match coordinator.deriver().derive(
                request.method(),
                request.path(),
                request.query_pairs(),
                ctx.caller().map(CallerIdentity::as_str),
            ) {
                Ok(key) => key,
                Err(e) => {
                    tracing::debug!(path = %request.path(), error = %e, "request not cacheable");
                    return next.run(ctx).await;
                }
            };
            let ttl = policy.ttl_for(request.path());

            if let Lookup::Hit { value, tier } = coordinator.lookup(&key).await {
                match value.to_response() {
                    Ok(mut response) => {
                        response.set_header(CACHE_STATUS_HEADER, tier.marker());
                        return response;
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "unusable cached response, treating as miss");
                    }
                }
            }

            let mut response = next.run(ctx).await;
            match CachedResponse::capture(&response) {
                Some(captured) => {
                    coordinator.store_detached(key, captured, ttl, true);
                }
                None => {
                    tracing::debug!(key = %key, status = response.status().as_u16(), "response not stored");
                }
            }
            response.set_header(CACHE_STATUS_HEADER, MISS);
            response
        })
    }
}
