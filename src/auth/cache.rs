//! In-process token validation cache.
//!
//! Maps the [`Fingerprint`] of a bearer token to the last validation
//! [`Outcome`] for at most `ttl`.  Entries are removed lazily on read, by a
//! background sweep task owned by the cache, and by capacity eviction.
//!
//! A `ttl` of zero disables the cache: every read misses and writes are
//! dropped.  A `max_size` of zero means unbounded.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::auth::fingerprint::Fingerprint;
use crate::auth::outcome::Outcome;
use crate::metrics::CacheMetrics;

const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// The cache contract the validator depends on.
pub trait TokenCache: Send + Sync {
    /// Return the unexpired outcome cached for `token`, if any.
    fn get(&self, token: &str) -> Option<Outcome>;

    /// Cache `outcome` for `token`, replacing any previous entry.
    fn set(&self, token: &str, outcome: Outcome);

    /// Remove the entry for `token`.  No-op when absent.
    fn delete(&self, token: &str);
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry {
    outcome: Outcome,
    expires_at: Instant,
    /// Insertion order, used to break ties between equal `expires_at`.
    seq: u64,
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<Fingerprint, CacheEntry>,
    next_seq: u64,
}

impl Entries {
    /// Remove the entry closest to expiry.  Among equal expiry times the
    /// earliest inserted entry goes first.
    fn evict_earliest(&mut self) -> Option<Fingerprint> {
        let key = self
            .map
            .iter()
            .min_by_key(|(_, entry)| (entry.expires_at, entry.seq))
            .map(|(key, _)| *key)?;
        self.map.remove(&key);
        Some(key)
    }
}

#[derive(Debug)]
struct Shared {
    entries: RwLock<Entries>,
    metrics: CacheMetrics,
}

impl Shared {
    // A panic while holding the lock cannot leave `Entries` half-updated
    // (every mutation is a single map operation), so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_expired(&self, now: Instant) -> usize {
        let mut entries = self.write();
        let before = entries.map.len();
        entries.map.retain(|_, entry| entry.expires_at > now);
        let removed = before - entries.map.len();
        self.metrics.entries.set(entries.map.len() as i64);
        removed
    }
}

// ---------------------------------------------------------------------------
// ResultCache
// ---------------------------------------------------------------------------

/// Bounded, TTL-based cache of validation outcomes keyed by token fingerprint.
#[derive(Debug)]
pub struct ResultCache {
    ttl: Duration,
    max_size: usize,
    shared: Arc<Shared>,
    stop_tx: watch::Sender<bool>,
}

impl ResultCache {
    /// Create a cache with unregistered metrics.
    ///
    /// # Panics
    ///
    /// When `ttl` is non-zero this spawns the sweep task and must be called
    /// from within a Tokio runtime.
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self::with_metrics(ttl, max_size, CacheMetrics::default())
    }

    /// Create a cache reporting hits, misses, evictions and size to `metrics`.
    pub fn with_metrics(ttl: Duration, max_size: usize, metrics: CacheMetrics) -> Self {
        Self::build(ttl, max_size, metrics, true)
    }

    fn build(ttl: Duration, max_size: usize, metrics: CacheMetrics, sweep: bool) -> Self {
        metrics.entries.set(0);
        let shared = Arc::new(Shared {
            entries: RwLock::new(Entries::default()),
            metrics,
        });
        let (stop_tx, stop_rx) = watch::channel(false);

        if sweep && !ttl.is_zero() {
            let interval = sweep_interval(ttl);
            debug!(?ttl, ?interval, max_size, "starting token cache sweeper");
            tokio::spawn(run_sweeper(Arc::clone(&shared), interval, stop_rx));
        }

        Self {
            ttl,
            max_size,
            shared,
            stop_tx,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Look up the outcome cached for `token`.
    ///
    /// Entries past their expiry are reported as misses even if the sweeper
    /// has not removed them yet.
    pub fn get(&self, token: &str) -> Option<Outcome> {
        let metrics = &self.shared.metrics;
        if self.ttl.is_zero() {
            metrics.misses.inc();
            return None;
        }

        let key = Fingerprint::of(token);
        let now = Instant::now();
        let entries = self.shared.read();

        match entries.map.get(&key) {
            Some(entry) if entry.expires_at > now => {
                metrics.hits.inc();
                trace!(fingerprint = ?key, "token cache hit");
                Some(entry.outcome.clone())
            }
            Some(_) => {
                metrics.misses.inc();
                trace!(fingerprint = ?key, "token cache entry expired");
                None
            }
            None => {
                metrics.misses.inc();
                None
            }
        }
    }

    /// Cache `outcome` for `token` until `now + ttl`.
    ///
    /// Inserting a new key into a full cache first evicts the entry closest
    /// to expiry.  Overwriting an existing key never evicts.
    pub fn set(&self, token: &str, outcome: Outcome) {
        if self.ttl.is_zero() {
            return;
        }

        let key = Fingerprint::of(token);
        let Some(expires_at) = Instant::now().checked_add(self.ttl) else {
            warn!(fingerprint = ?key, ttl = ?self.ttl, "token cache ttl overflows the clock, not caching");
            return;
        };
        let metrics = &self.shared.metrics;
        let mut entries = self.shared.write();

        let exists = entries.map.contains_key(&key);
        if !exists && self.max_size > 0 && entries.map.len() >= self.max_size {
            if let Some(evicted) = entries.evict_earliest() {
                metrics.evictions.inc();
                debug!(fingerprint = ?evicted, max_size = self.max_size, "token cache full, evicted entry closest to expiry");
            }
        }

        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.map.insert(
            key,
            CacheEntry {
                outcome,
                expires_at,
                seq,
            },
        );
        metrics.entries.set(entries.map.len() as i64);
        trace!(fingerprint = ?key, ttl = ?self.ttl, "token cache set");
    }

    /// Remove the entry for `token`, if present.
    pub fn delete(&self, token: &str) {
        let key = Fingerprint::of(token);
        let mut entries = self.shared.write();
        if entries.map.remove(&key).is_some() {
            trace!(fingerprint = ?key, "token cache entry deleted");
        }
        self.shared.metrics.entries.set(entries.map.len() as i64);
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.shared.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal the sweep task to exit.  Safe to call any number of times, and
    /// a no-op for a disabled cache.  Dropping the cache has the same effect.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Whether the sweep task is still alive.
    pub fn is_sweeping(&self) -> bool {
        self.stop_tx.receiver_count() > 0
    }
}

impl TokenCache for ResultCache {
    fn get(&self, token: &str) -> Option<Outcome> {
        ResultCache::get(self, token)
    }

    fn set(&self, token: &str, outcome: Outcome) {
        ResultCache::set(self, token, outcome);
    }

    fn delete(&self, token: &str) {
        ResultCache::delete(self, token);
    }
}

// ---------------------------------------------------------------------------
// Sweeper
// ---------------------------------------------------------------------------

/// `min(ttl / 2, 30s)`, or one second if that rounds down to zero.
pub fn sweep_interval(ttl: Duration) -> Duration {
    let interval = (ttl / 2).min(MAX_SWEEP_INTERVAL);
    if interval.is_zero() {
        MIN_SWEEP_INTERVAL
    } else {
        interval
    }
}

async fn run_sweeper(shared: Arc<Shared>, interval: Duration, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                // Err means the cache itself was dropped.
                if changed.is_err() || *stop_rx.borrow() {
                    debug!("token cache sweeper stopped");
                    return;
                }
            }
            _ = ticker.tick() => {
                let removed = shared.remove_expired(Instant::now());
                if removed > 0 {
                    debug!(removed, "swept expired token cache entries");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
