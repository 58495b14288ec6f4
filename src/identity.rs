//! Client identities and the cache that keeps one identity per caller.

use dashmap::DashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};

/// A value identifying one logical caller.
///
/// Identities are created by an [`IdentityCache`] on first sight of a caller
/// key and compared solely by [`unique_identifier`](Self::unique_identifier).
pub trait Identity: Send + Sync + 'static {
    /// Create a fresh identity for `key`.
    fn from_key(key: String) -> Self;

    /// The stable key this identity was created for.
    fn unique_identifier(&self) -> &str;
}

/// Snapshot of a leaky bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketState {
    /// Units currently held in the bucket.
    pub request_count: i64,
    /// When decay was last applied. `None` until the first allowance check.
    pub last_leak: Option<Instant>,
}

/// Identity carrying a leaky bucket.
///
/// The bucket sits behind a per-identity mutex so that decay, check and
/// consumption for one caller are applied as a single step, while different
/// callers never contend with each other.
pub struct LeakyBucketIdentity {
    unique_identifier: String,
    bucket: Mutex<BucketState>,
}

impl LeakyBucketIdentity {
    /// Create an identity with an empty bucket.
    pub fn new(unique_identifier: impl Into<String>) -> Self {
        Self {
            unique_identifier: unique_identifier.into(),
            bucket: Mutex::new(BucketState::default()),
        }
    }

    /// Copy of the current bucket state.
    pub fn snapshot(&self) -> BucketState {
        *self.lock()
    }

    /// Lock the bucket for a read-modify-write sequence.
    pub(crate) fn lock(&self) -> MutexGuard<'_, BucketState> {
        // Bucket state is plain integers; a panic mid-update cannot leave it
        // structurally invalid.
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Identity for LeakyBucketIdentity {
    fn from_key(key: String) -> Self {
        Self::new(key)
    }

    fn unique_identifier(&self) -> &str {
        &self.unique_identifier
    }
}

impl fmt::Debug for LeakyBucketIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeakyBucketIdentity")
            .field("unique_identifier", &self.unique_identifier)
            .field("bucket", &self.snapshot())
            .finish()
    }
}

impl PartialEq for LeakyBucketIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.unique_identifier == other.unique_identifier
    }
}

impl Eq for LeakyBucketIdentity {}

impl Hash for LeakyBucketIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.unique_identifier.hash(state);
    }
}

/// A full cache frees this fraction of its capacity at once, so the scan for
/// the least recently seen entries runs once per batch instead of once per
/// insert.
const EVICTION_BATCH_DIVISOR: usize = 16;

struct CacheEntry<I> {
    identity: Arc<I>,
    /// Nanoseconds since the cache's start instant.
    last_seen: AtomicU64,
}

/// Concurrent map from caller key to identity.
///
/// Lookup-or-insert is atomic per key: concurrent first requests from the same
/// caller converge on a single identity instance.
///
/// Without bounds the cache grows by one entry per distinct key for the life
/// of the process. Long-running services facing untrusted keys should set a
/// [capacity limit](Self::with_capacity_limit) and/or call
/// [`cleanup`](Self::cleanup) periodically.
pub struct IdentityCache<I> {
    entries: DashMap<String, CacheEntry<I>>,
    max_entries: Option<usize>,
    evicting: Mutex<()>,
    clock: Arc<dyn Clock>,
    start_instant: Instant,
}

impl<I: Identity> IdentityCache<I> {
    /// Create an unbounded cache.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an unbounded cache that reads time from `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let start_instant = clock.now();
        Self {
            entries: DashMap::new(),
            max_entries: None,
            evicting: Mutex::new(()),
            clock,
            start_instant,
        }
    }

    /// Bound the cache to `max_entries` identities.
    ///
    /// When full, the least recently seen identities are evicted before a new
    /// caller is inserted. Eviction frees about a sixteenth of the capacity at
    /// once, so the cost of finding victims is spread over the inserts that
    /// follow. An evicted caller starts over with an empty bucket.
    ///
    /// # Panics
    ///
    /// Panics if `max_entries` is 0.
    #[must_use]
    pub fn with_capacity_limit(mut self, max_entries: usize) -> Self {
        assert!(max_entries > 0, "max_entries must be greater than 0");
        self.max_entries = Some(max_entries);
        self
    }

    #[inline]
    fn now_nanos(&self) -> u64 {
        self.clock
            .now()
            .saturating_duration_since(self.start_instant)
            .as_nanos()
            .min(u64::MAX as u128) as u64
    }

    /// Return the identity for `key`, creating it if this is the first sighting.
    pub fn get_or_insert(&self, key: &str) -> Arc<I> {
        let now = self.now_nanos();

        if let Some(entry) = self.entries.get(key) {
            entry.last_seen.store(now, Ordering::Relaxed);
            return Arc::clone(&entry.identity);
        }

        if let Some(max) = self.max_entries {
            if self.entries.len() >= max {
                self.evict_least_recent(max);
            }
        }

        let entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| CacheEntry {
                identity: Arc::new(I::from_key(key.to_owned())),
                last_seen: AtomicU64::new(now),
            });
        entry.last_seen.store(now, Ordering::Relaxed);
        Arc::clone(&entry.identity)
    }

    fn evict_least_recent(&self, max: usize) {
        // One evictor at a time; latecomers usually find room already made.
        let _guard = self.evicting.lock().unwrap_or_else(PoisonError::into_inner);
        let len = self.entries.len();
        if len < max {
            return;
        }

        let batch = (max / EVICTION_BATCH_DIVISOR).max(1) + (len - max);
        let mut candidates: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|entry| (entry.last_seen.load(Ordering::Relaxed), entry.key().clone()))
            .collect();
        let batch = batch.min(candidates.len());
        if batch == 0 {
            return;
        }
        if batch < candidates.len() {
            candidates.select_nth_unstable_by_key(batch - 1, |(last_seen, _)| *last_seen);
        }
        candidates.truncate(batch);

        for (_, key) in &candidates {
            self.entries.remove(key);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(evicted = batch, "evicted least recently seen identities");
    }

    /// Remove identities that have not been seen for at least `max_idle`.
    ///
    /// Pick `max_idle` no shorter than the time a full bucket needs to drain
    /// (see [`LeakyBucketPolicy::drain_time`](crate::LeakyBucketPolicy::drain_time)),
    /// otherwise a throttled caller can reset its bucket by going quiet.
    pub fn cleanup(&self, max_idle: Duration) {
        let now = self.now_nanos();
        let max_idle_nanos = max_idle.as_nanos().min(u64::MAX as u128) as u64;
        let before = self.entries.len();

        self.entries.retain(|_, entry| {
            now.saturating_sub(entry.last_seen.load(Ordering::Relaxed)) < max_idle_nanos
        });

        #[cfg(feature = "tracing")]
        {
            let removed = before.saturating_sub(self.entries.len());
            if removed > 0 {
                tracing::debug!(removed, "removed idle identities");
            }
        }
        #[cfg(not(feature = "tracing"))]
        let _ = before;
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` on the current tokio runtime.
    ///
    /// The task stops on its own once the cache is dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime, or if `interval` is zero.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        max_idle: Duration,
    ) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match cache.upgrade() {
                    Some(cache) => cache.cleanup(max_idle),
                    None => break,
                }
            }
        })
    }

    /// Number of cached identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no identities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<I: Identity> Default for IdentityCache<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> fmt::Debug for IdentityCache<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityCache")
            .field("len", &self.entries.len())
            .field("max_entries", &self.max_entries)
            .finish_non_exhaustive()
    }
}
