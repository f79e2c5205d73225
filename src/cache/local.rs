//! In-process tier: a bounded, sharded map with per-entry TTLs.
//!
//! Entries live in a [`DashMap`], so concurrent readers only contend on the
//! shard that holds their key. Each insert is stamped with a monotonically
//! increasing sequence number and queued in insertion order; when the tier
//! is over capacity the front of the queue (the oldest insert) is evicted.
//! Queue slots whose entry was since replaced or removed are skipped, and
//! the queue is compacted once it holds twice the capacity.
//!
//! Expiry uses one predicate everywhere, `now - inserted_at >= ttl`: reads
//! drop expired entries lazily and [`LocalTier::spawn_sweeper`] purges them
//! in the background.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::codec::CachedResponse;
use super::key::{CacheKey, InvalidationPattern};
use super::stats::{Counters, TierStats};

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    seq: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }
}

/// Bounded in-process cache tier.
///
/// All methods take `&self` and are safe to call from any number of tasks.
/// Nothing here can fail: unknown keys are simply absent.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tiercache::cache::{CacheKey, LocalTier};
///
/// let tier: LocalTier<&str> = LocalTier::new(2);
/// tier.set(CacheKey::from("a"), "1", Duration::from_secs(60));
/// tier.set(CacheKey::from("b"), "2", Duration::from_secs(60));
/// tier.set(CacheKey::from("c"), "3", Duration::from_secs(60));
///
/// // "a" was inserted first, so it made room for "c".
/// assert_eq!(tier.get(&CacheKey::from("a")), None);
/// assert_eq!(tier.get(&CacheKey::from("c")), Some("3"));
/// ```
#[derive(Debug)]
pub struct LocalTier<V = CachedResponse> {
    entries: DashMap<CacheKey, Entry<V>>,
    // (seq, key) in insertion order; writers hold it for the whole insert.
    order: Mutex<VecDeque<(u64, CacheKey)>>,
    capacity: usize,
    next_seq: AtomicU64,
    counters: Counters,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<V> LocalTier<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a tier holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: DashMap::with_capacity(capacity),
            order: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            next_seq: AtomicU64::new(0),
            counters: Counters::default(),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns a copy of the live value for `key`.
    ///
    /// An expired entry counts as a miss and is removed on the spot.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();

        let found = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
            Some(_) => None,
            None => {
                self.counters.miss();
                return None;
            }
        };

        if found.is_some() {
            self.counters.hit();
            return found;
        }

        // Re-check under the shard lock: a concurrent `set` may have
        // replaced the expired entry with a fresh one.
        if self
            .entries
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some()
        {
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.miss();
        None
    }

    /// Inserts or replaces `key`.
    ///
    /// Replacing a key moves it to the back of the eviction order. If the
    /// insert takes the tier over capacity the oldest entries are evicted.
    pub fn set(&self, key: CacheKey, value: V, ttl: Duration) {
        let mut order = self.order.lock();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            value,
            inserted_at: Instant::now(),
            ttl,
            seq,
        };
        self.entries.insert(key.clone(), entry);
        order.push_back((seq, key));

        while self.entries.len() > self.capacity {
            if !self.evict_oldest(&mut order) {
                break;
            }
        }

        if order.len() > self.capacity * 2 {
            order.retain(|(seq, key)| self.is_current(key, *seq));
        }
    }

    /// Removes `key`. Returns `true` if an entry was present.
    pub fn delete(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Keys of all live (unexpired) entries, in no particular order.
    pub fn keys(&self) -> Vec<CacheKey> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Removes every entry whose key matches `pattern`; returns how many.
    pub fn remove_matching(&self, pattern: &InvalidationPattern) -> usize {
        let mut removed = 0;
        self.entries.retain(|key, _| {
            let matched = pattern.matches(key.as_str());
            if matched {
                removed += 1;
            }
            !matched
        });
        removed
    }

    /// Drops every expired entry; returns how many.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        self.entries.retain(|_, entry| {
            let expired = entry.is_expired(now);
            if expired {
                purged += 1;
            }
            !expired
        });
        self.expirations.fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    pub fn clear(&self) {
        let mut order = self.order.lock();
        self.entries.clear();
        order.clear();
    }

    /// Entry count, including expired entries not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counters plus the number of live entries, matching [`keys`](Self::keys).
    pub fn stats(&self) -> TierStats {
        let now = Instant::now();
        let live = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .count();
        self.counters.snapshot(live as u64)
    }

    pub fn reset_stats(&self) {
        self.counters.reset();
        self.evictions.store(0, Ordering::Relaxed);
        self.expirations.store(0, Ordering::Relaxed);
    }

    /// Entries evicted for capacity since creation (or the last reset).
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Entries dropped because their TTL ran out.
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Purges expired entries every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = self.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, remaining = self.len(), "local cache sweep");
                        }
                    }
                }
            }
            tracing::debug!("local cache sweeper stopped");
        })
    }

    // Evicts the oldest live insert. Returns `false` once the queue is empty.
    fn evict_oldest(&self, order: &mut VecDeque<(u64, CacheKey)>) -> bool {
        while let Some((seq, key)) = order.pop_front() {
            if self
                .entries
                .remove_if(&key, |_, entry| entry.seq == seq)
                .is_some()
            {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %key, "local cache eviction");
                return true;
            }
        }
        false
    }

    fn is_current(&self, key: &CacheKey, seq: u64) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.seq == seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> CacheKey {
        CacheKey::from(s)
    }

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn set_then_get() {
        let tier = LocalTier::new(4);
        tier.set(key("a"), 1u32, MINUTE);
        assert_eq!(tier.get(&key("a")), Some(1));
        assert_eq!(tier.get(&key("missing")), None);
    }

    #[test]
    fn delete_reports_presence() {
        let tier = LocalTier::new(4);
        tier.set(key("a"), 1u32, MINUTE);
        assert!(tier.delete(&key("a")));
        assert!(!tier.delete(&key("a")));
        assert_eq!(tier.get(&key("a")), None);
    }

    #[test]
    fn capacity_evicts_exactly_the_oldest() {
        let n = 5;
        let tier = LocalTier::new(n);
        for i in 0..n {
            tier.set(key(&format!("k{i}")), i, MINUTE);
        }
        tier.set(key("k-new"), 99, MINUTE);

        assert_eq!(tier.len(), n);
        assert_eq!(tier.evictions(), 1);
        assert_eq!(tier.get(&key("k0")), None);
        for i in 1..n {
            assert_eq!(tier.get(&key(&format!("k{i}"))), Some(i));
        }
        assert_eq!(tier.get(&key("k-new")), Some(99));
    }

    #[test]
    fn replacing_a_key_refreshes_its_position() {
        let tier = LocalTier::new(2);
        tier.set(key("a"), 1, MINUTE);
        tier.set(key("b"), 2, MINUTE);
        tier.set(key("a"), 10, MINUTE);
        tier.set(key("c"), 3, MINUTE);

        assert_eq!(tier.get(&key("b")), None);
        assert_eq!(tier.get(&key("a")), Some(10));
        assert_eq!(tier.get(&key("c")), Some(3));
    }

    #[test]
    fn eviction_skips_replaced_and_deleted_entries() {
        let tier = LocalTier::new(3);
        tier.set(key("a"), 1, MINUTE);
        tier.set(key("b"), 2, MINUTE);
        tier.set(key("c"), 3, MINUTE);
        tier.delete(&key("b"));
        tier.set(key("a"), 10, MINUTE);
        tier.set(key("d"), 4, MINUTE);
        tier.set(key("e"), 5, MINUTE);

        assert_eq!(tier.evictions(), 1);
        assert_eq!(tier.get(&key("c")), None);
        assert_eq!(tier.get(&key("a")), Some(10));
        assert_eq!(tier.get(&key("d")), Some(4));
        assert_eq!(tier.get(&key("e")), Some(5));
    }

    #[test]
    fn insertion_queue_stays_bounded_under_rewrites() {
        let tier = LocalTier::new(4);
        for i in 0..1_000 {
            tier.set(key(&format!("k{}", i % 3)), i, MINUTE);
        }
        assert!(tier.order.lock().len() <= 8);
        assert_eq!(tier.len(), 3);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let tier = LocalTier::new(0);
        tier.set(key("a"), 1, MINUTE);
        assert_eq!(tier.capacity(), 1);
        assert_eq!(tier.get(&key("a")), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn entry_lives_until_its_ttl() {
        let tier = LocalTier::new(4);
        let ttl = Duration::from_secs(10);
        let eps = Duration::from_millis(1);
        tier.set(key("a"), "v", ttl);

        tokio::time::advance(ttl - eps).await;
        assert_eq!(tier.get(&key("a")), Some("v"));

        tokio::time::advance(eps * 2).await;
        assert_eq!(tier.get(&key("a")), None);
        assert_eq!(tier.len(), 0);
        assert_eq!(tier.expirations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ttls_are_per_entry() {
        let tier = LocalTier::new(4);
        tier.set(key("short"), 1, Duration::from_secs(1));
        tier.set(key("long"), 2, Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(tier.get(&key("short")), None);
        assert_eq!(tier.get(&key("long")), Some(2));
        assert_eq!(tier.keys(), vec![key("long")]);
    }

    #[tokio::test(start_paused = true)]
    async fn key_count_ignores_unpurged_expired_entries() {
        let tier = LocalTier::new(4);
        tier.set(key("short"), 1, Duration::from_secs(1));
        tier.set(key("long"), 2, Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(tier.len(), 2);
        assert_eq!(tier.stats().key_count, tier.keys().len() as u64);
        assert_eq!(tier.stats().key_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_is_inclusive_at_exactly_ttl() {
        let tier = LocalTier::new(4);
        tier.set(key("a"), 1, Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(tier.get(&key("a")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_and_sweeper_agree_with_reads() {
        let tier = Arc::new(LocalTier::new(8));
        tier.set(key("a"), 1, Duration::from_secs(1));
        tier.set(key("b"), 2, Duration::from_secs(60));

        let token = CancellationToken::new();
        let handle = Arc::clone(&tier).spawn_sweeper(Duration::from_secs(5), token.clone());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.get(&key("b")), Some(2));

        token.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn remove_matching_only_touches_matches() {
        let tier = LocalTier::new(8);
        tier.set(key("ns:GET:/orders:page=1:anonymous"), 1, MINUTE);
        tier.set(key("ns:GET:/orders/7::u1"), 2, MINUTE);
        tier.set(key("ns:GET:/products::anonymous"), 3, MINUTE);

        let removed = tier.remove_matching(&InvalidationPattern::from("orders"));
        assert_eq!(removed, 2);
        assert!(tier.keys().iter().all(|k| !k.as_str().contains("orders")));
        assert_eq!(tier.get(&key("ns:GET:/products::anonymous")), Some(3));
    }

    #[test]
    fn stats_track_hits_misses_and_keys() {
        let tier = LocalTier::new(8);
        tier.set(key("a"), 1, MINUTE);
        tier.get(&key("a"));
        tier.get(&key("a"));
        tier.get(&key("b"));

        let stats = tier.stats();
        assert_eq!((stats.hits, stats.misses, stats.key_count), (2, 1, 1));

        tier.reset_stats();
        assert_eq!(tier.stats().hits, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_stay_within_capacity() {
        let tier = Arc::new(LocalTier::new(64));
        let mut tasks = Vec::new();
        for t in 0..8 {
            let tier = Arc::clone(&tier);
            tasks.push(tokio::spawn(async move {
                for i in 0..200 {
                    let k = key(&format!("t{t}-{i}"));
                    tier.set(k.clone(), i, MINUTE);
                    tier.get(&k);
                    if i % 7 == 0 {
                        tier.delete(&k);
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(tier.len() <= 64);
    }

    #[test]
    fn set_is_visible_to_the_next_get() {
        let tier = LocalTier::new(2);
        for i in 0..100 {
            tier.set(key("a"), i, MINUTE);
            assert_eq!(tier.get(&key("a")), Some(i));
        }
    }
}
