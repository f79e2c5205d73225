//! Cache configuration.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working local-only cache. Values are layered: defaults, then an optional
//! TOML file, then `CACHE__*` environment variables, e.g.
//!
//! ```text
//! CACHE__REMOTE__ENABLED=true
//! CACHE__REMOTE__URL=redis://cache.internal:6379
//! CACHE__REMOTE__PASSWORD=...
//! CACHE__REMOTE__DATABASE=2
//! CACHE__POLICY__METHODS=GET,HEAD
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

use crate::Method;
use crate::cache::RemoteSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Prefix of every key, remote index and pub/sub channel.
    pub namespace: String,
    pub local: LocalConfig,
    pub remote: RemoteConfig,
    pub policy: PolicyConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "rttp-cache".to_string(),
            local: LocalConfig::default(),
            remote: RemoteConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Maximum number of entries held in process.
    pub capacity: usize,
    pub sweep_interval_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            sweep_interval_secs: 60,
        }
    }
}

impl LocalConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Without this the cache runs local-only.
    pub enabled: bool,
    pub url: String,
    pub password: Option<String>,
    pub database: i64,
    pub pool_size: usize,
    /// Upper bound on every remote call, connection checkout included.
    pub timeout_ms: u64,
    /// Consecutive failures before the tier is considered degraded.
    pub failure_threshold: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://127.0.0.1:6379".to_string(),
            password: None,
            database: 0,
            pool_size: 16,
            timeout_ms: 250,
            failure_threshold: 3,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            heartbeat_interval_secs: 5,
        }
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn settings(&self) -> RemoteSettings {
        RemoteSettings {
            timeout: self.timeout(),
            failure_threshold: self.failure_threshold,
            backoff_initial: Duration::from_millis(self.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

/// A TTL for every path starting with `prefix`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteTtl {
    pub prefix: String,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub methods: Vec<String>,
    pub default_ttl_secs: u64,
    pub max_key_len: usize,
    pub routes: Vec<RouteTtl>,
    /// Path prefixes that always bypass the cache.
    pub exclude: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            methods: vec!["GET".to_string()],
            default_ttl_secs: 300,
            max_key_len: 1024,
            routes: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl PolicyConfig {
    pub fn methods(&self) -> Vec<Method> {
        self.methods
            .iter()
            .map(|m| match m.to_ascii_uppercase().parse::<Method>() {
                Ok(method) => method,
                Err(never) => match never {},
            })
            .collect()
    }
}

impl CacheConfig {
    /// Loads configuration from `path` (if given and present) and the
    /// environment, then validates it.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path.filter(|p| p.exists()) {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix("CACHE")
                .try_parsing(true)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("policy.methods")
                .with_list_parse_key("policy.exclude"),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::invalid("namespace", "must not be empty"));
        }
        if self.local.capacity == 0 {
            return Err(ConfigError::invalid("local.capacity", "must be > 0"));
        }
        if self.local.sweep_interval_secs == 0 {
            return Err(ConfigError::invalid("local.sweep_interval_secs", "must be > 0"));
        }

        let remote = &self.remote;
        if remote.timeout_ms == 0 {
            return Err(ConfigError::invalid("remote.timeout_ms", "must be > 0"));
        }
        if remote.pool_size == 0 {
            return Err(ConfigError::invalid("remote.pool_size", "must be > 0"));
        }
        if remote.failure_threshold == 0 {
            return Err(ConfigError::invalid("remote.failure_threshold", "must be > 0"));
        }
        if remote.backoff_initial_ms == 0 {
            return Err(ConfigError::invalid("remote.backoff_initial_ms", "must be > 0"));
        }
        if remote.backoff_initial_ms > remote.backoff_max_ms {
            return Err(ConfigError::invalid(
                "remote.backoff_initial_ms",
                format!("must be <= remote.backoff_max_ms ({})", remote.backoff_max_ms),
            ));
        }
        if remote.heartbeat_interval_secs == 0 {
            return Err(ConfigError::invalid("remote.heartbeat_interval_secs", "must be > 0"));
        }
        if remote.database < 0 {
            return Err(ConfigError::invalid("remote.database", "must be >= 0"));
        }

        let policy = &self.policy;
        if policy.methods.is_empty() {
            return Err(ConfigError::invalid("policy.methods", "must name at least one method"));
        }
        if let Some(unsafe_method) = policy.methods().into_iter().find(|m| !m.is_safe()) {
            return Err(ConfigError::invalid(
                "policy.methods",
                format!("{unsafe_method} has side effects and cannot be cached"),
            ));
        }
        if policy.default_ttl_secs == 0 {
            return Err(ConfigError::invalid("policy.default_ttl_secs", "must be > 0"));
        }
        if policy.max_key_len == 0 {
            return Err(ConfigError::invalid("policy.max_key_len", "must be > 0"));
        }
        if let Some(route) = policy.routes.iter().find(|r| r.ttl_secs == 0) {
            return Err(ConfigError::invalid(
                "policy.routes",
                format!("ttl_secs for {} must be > 0", route.prefix),
            ));
        }
        Ok(())
    }
}
