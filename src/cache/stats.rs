//! Hit/miss accounting per tier.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::local::LocalTier;
use super::remote::{Reachability, RemoteTier};

/// Point-in-time counters for one tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub key_count: u64,
}

impl TierStats {
    /// Hits over lookups, or `0.0` before the first lookup.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Lock-free counters owned by a tier.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Counters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, key_count: u64) -> TierStats {
        TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            key_count,
        }
    }

    pub(crate) fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// Combined view over both tiers, as served by a stats endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub local: TierStats,
    pub remote: TierStats,
    pub remote_reachable: bool,
    pub remote_degraded: bool,
}

/// Read-only aggregation over the two tiers' counters.
#[derive(Clone)]
pub struct StatsCollector {
    local: Arc<LocalTier>,
    remote: Arc<RemoteTier>,
}

impl StatsCollector {
    pub fn new(local: Arc<LocalTier>, remote: Arc<RemoteTier>) -> Self {
        Self { local, remote }
    }

    /// Local counters only; never touches the network.
    pub fn local(&self) -> TierStats {
        self.local.stats()
    }

    /// Both tiers. The remote key count and reachability come from the
    /// store and fall back to `0` / unreachable when it cannot answer.
    pub async fn snapshot(&self) -> CacheStats {
        let remote = self.remote.stats().await;
        let reachable = self.remote.ping().await == Reachability::Reachable;
        CacheStats {
            local: self.local.stats(),
            remote,
            remote_reachable: reachable,
            remote_degraded: self.remote.is_degraded(),
        }
    }

    /// Zeroes hit/miss counters on both tiers.
    pub fn reset(&self) {
        self.local.reset_stats();
        self.remote.reset_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_ratio_handles_empty_and_mixed() {
        assert_eq!(TierStats::default().hit_ratio(), 0.0);
        let stats = TierStats {
            hits: 3,
            misses: 1,
            key_count: 0,
        };
        assert_eq!(stats.hit_ratio(), 0.75);
    }

    #[test]
    fn counters_snapshot_and_reset() {
        let c = Counters::default();
        c.hit();
        c.hit();
        c.miss();
        assert_eq!(
            c.snapshot(5),
            TierStats {
                hits: 2,
                misses: 1,
                key_count: 5
            }
        );
        c.reset();
        assert_eq!(c.snapshot(0), TierStats::default());
    }
}
