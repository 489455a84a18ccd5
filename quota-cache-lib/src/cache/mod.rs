//! A keyed cache that runs at most one fetch per key at a time.
//!
//! On a miss the cache stores a pending slot holding a shared future. Every
//! caller that misses while the slot is pending awaits the same future and
//! receives the same outcome. The fetch runs in its own task, so a caller
//! that stops waiting does not cancel it.

mod config;
mod stats;

pub use config::{CacheConfig, TierConfig};
pub use stats::CacheStats;

use std::any::Any;
use std::fmt::{self, Debug};
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::{ErrorKind, Result};
use stats::StatsCounters;

/// Outcome of a fetch function
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched<V> {
    /// The value exists. Cached for the tier TTL.
    Found(V),
    /// The upstream confirmed the value does not exist.
    /// Cached as a tombstone for the tier's negative TTL.
    NotFound,
    /// No usable answer right now. Absent for this call only, not cached.
    Unavailable,
}

impl<V> From<Option<V>> for Fetched<V> {
    fn from(value: Option<V>) -> Self {
        value.map_or(Self::NotFound, Self::Found)
    }
}

type SharedFetch<V> = Shared<BoxFuture<'static, Result<Option<V>>>>;

enum Slot<V> {
    /// A value (`Some`) or a tombstone (`None`)
    Ready {
        value: Option<V>,
        expires_at: Instant,
        last_read: Instant,
    },
    /// A fetch in flight. `id` tells apart fetches for the same key.
    Pending { id: u64, fetch: SharedFetch<V> },
}

impl<V> Slot<V> {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self, Self::Ready { expires_at, .. } if *expires_at <= now)
    }

    fn is_pending(&self, fetch_id: u64) -> bool {
        matches!(self, Self::Pending { id, .. } if *id == fetch_id)
    }
}

enum Lookup<V> {
    Resolved(Option<V>),
    Join(SharedFetch<V>),
    Start {
        id: u64,
        sender: oneshot::Sender<Result<Option<V>>>,
        fetch: SharedFetch<V>,
    },
}

struct Inner<K, V> {
    name: &'static str,
    slots: DashMap<K, Slot<V>>,
    config: TierConfig,
    next_id: AtomicU64,
    stats: StatsCounters,
}

/// One cache tier.
///
/// Cloning is cheap and yields a handle to the same tier.
pub struct CoalescingCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for CoalescingCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Eq + Hash, V> Debug for CoalescingCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescingCache")
            .field("name", &self.inner.name)
            .field("len", &self.inner.slots.len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<K, V> CoalescingCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty tier. `name` only shows up in logs.
    #[must_use]
    pub fn new(name: &'static str, config: TierConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                slots: DashMap::new(),
                config,
                next_id: AtomicU64::new(0),
                stats: StatsCounters::default(),
            }),
        }
    }

    /// Freshness and size settings of this tier
    #[must_use]
    pub fn config(&self) -> &TierConfig {
        &self.inner.config
    }

    /// Return the fresh value for `key` without fetching.
    ///
    /// Tombstones, expired entries and pending fetches all read as `None`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut slot = self.inner.slots.get_mut(key)?;
        match &mut *slot {
            Slot::Ready {
                value,
                expires_at,
                last_read,
            } if *expires_at > now => {
                *last_read = now;
                self.inner.stats.record_hit();
                value.clone()
            }
            _ => None,
        }
    }

    /// Whether `key` holds a fresh explicit "not found"
    #[must_use]
    pub fn is_tombstoned(&self, key: &K) -> bool {
        let now = Instant::now();
        self.inner.slots.get(key).is_some_and(|slot| {
            matches!(&*slot, Slot::Ready { value: None, expires_at, .. } if *expires_at > now)
        })
    }

    /// Return the value for `key`, fetching it if there is no fresh entry.
    ///
    /// Concurrent callers for the same key share a single run of `fetch`
    /// and all receive its outcome. `fetch` runs in a spawned task and
    /// finishes even if every caller stops waiting.
    ///
    /// # Errors
    ///
    /// Returns the error of the shared fetch. Errors are never cached.
    /// A panic inside `fetch` becomes [`ErrorKind::FetchPanicked`].
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Fetched<V>>> + Send + 'static,
    {
        match self.lookup(&key) {
            Lookup::Resolved(value) => Ok(value),
            Lookup::Join(shared) => shared.await,
            Lookup::Start { id, sender, fetch: shared } => {
                self.spawn_fetch(key, id, sender, fetch);
                shared.await
            }
        }
    }

    /// Store a value with the given TTL, replacing any entry for `key`.
    ///
    /// A fetch that is in flight for `key` still resolves its own waiters,
    /// but its result no longer replaces this value.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        self.store(key, Some(value), ttl);
    }

    /// Store an explicit "not found" for `key`
    pub fn set_missing(&self, key: K, ttl: Duration) {
        self.store(key, None, ttl);
    }

    /// Remove the entry for `key`. Returns whether there was one.
    ///
    /// Deleting a pending entry detaches its fetch: the fetch still resolves
    /// its waiters, but its result is not stored.
    pub fn delete(&self, key: &K) -> bool {
        self.inner.slots.remove(key).is_some()
    }

    /// Remove all expired entries. Returns the number of removed entries.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.inner.slots.len();
        self.inner.slots.retain(|_, slot| !slot.is_expired(now));
        let removed = before.saturating_sub(self.inner.slots.len());
        if removed > 0 {
            log::debug!("Swept {removed} expired entries from the {} tier", self.inner.name);
        }
        removed
    }

    /// Number of entries, including expired and pending ones
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    /// Whether the tier holds no entries at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    /// Hit, miss and eviction counters of this tier
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot()
    }

    /// Find a fresh entry or a pending fetch, or install a new pending slot.
    /// The shard lock is released before this returns.
    fn lookup(&self, key: &K) -> Lookup<V> {
        let now = Instant::now();
        let start = match self.inner.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                match occupied.get_mut() {
                    Slot::Ready {
                        value,
                        expires_at,
                        last_read,
                    } if *expires_at > now => {
                        *last_read = now;
                        self.inner.stats.record_hit();
                        return Lookup::Resolved(value.clone());
                    }
                    Slot::Pending { fetch, .. } => {
                        log::debug!("Joining fetch in flight for {key:?} ({} tier)", self.inner.name);
                        self.inner.stats.record_coalesced();
                        return Lookup::Join(fetch.clone());
                    }
                    Slot::Ready { .. } => {}
                }
                let (start, slot) = self.pending();
                occupied.insert(slot);
                start
            }
            Entry::Vacant(vacant) => {
                let (start, slot) = self.pending();
                vacant.insert(slot);
                start
            }
        };
        self.inner.stats.record_miss();
        start
    }

    fn pending(&self) -> (Lookup<V>, Slot<V>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let fetch = async move {
            receiver
                .await
                .unwrap_or_else(|_| Err(ErrorKind::FetchAbandoned))
        }
        .boxed()
        .shared();
        (
            Lookup::Start {
                id,
                sender,
                fetch: fetch.clone(),
            },
            Slot::Pending { id, fetch },
        )
    }

    fn spawn_fetch<F, Fut>(
        &self,
        key: K,
        id: u64,
        sender: oneshot::Sender<Result<Option<V>>>,
        fetch: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Fetched<V>>> + Send + 'static,
    {
        let cache = self.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(async move { fetch().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(ErrorKind::FetchPanicked(panic_message(&*panic))));
            let result = cache.settle(key, id, outcome);
            // Every waiter may have given up already
            let _ = sender.send(result);
        });
    }

    /// Replace the pending slot `id` with the outcome of its fetch
    fn settle(&self, key: K, id: u64, outcome: Result<Fetched<V>>) -> Result<Option<V>> {
        match outcome {
            Ok(Fetched::Found(value)) => {
                self.resolve_pending(key, id, Some(value.clone()), self.inner.config.ttl);
                Ok(Some(value))
            }
            Ok(Fetched::NotFound) => {
                let ttl = self.inner.config.negative_ttl();
                self.resolve_pending(key, id, None, ttl);
                Ok(None)
            }
            Ok(Fetched::Unavailable) => {
                self.inner.slots.remove_if(&key, |_, slot| slot.is_pending(id));
                Ok(None)
            }
            Err(e) => {
                log::debug!("Fetch for {key:?} ({} tier) failed: {e}", self.inner.name);
                self.inner.slots.remove_if(&key, |_, slot| slot.is_pending(id));
                Err(e)
            }
        }
    }

    fn resolve_pending(&self, key: K, id: u64, value: Option<V>, ttl: Duration) {
        {
            let Some(mut slot) = self.inner.slots.get_mut(&key) else {
                log::debug!("Discarding fetch for deleted {key:?} ({} tier)", self.inner.name);
                return;
            };
            if !slot.is_pending(id) {
                log::debug!("Discarding stale fetch for {key:?} ({} tier)", self.inner.name);
                return;
            }
            let now = Instant::now();
            *slot = Slot::Ready {
                value,
                expires_at: now + ttl,
                last_read: now,
            };
        }
        self.enforce_capacity();
    }

    fn store(&self, key: K, value: Option<V>, ttl: Duration) {
        let now = Instant::now();
        self.inner.slots.insert(
            key,
            Slot::Ready {
                value,
                expires_at: now + ttl,
                last_read: now,
            },
        );
        self.enforce_capacity();
    }

    /// Evict expired entries, then the least recently read ones, once the
    /// tier grows past its capacity. Pending slots are never evicted.
    ///
    /// An overflow evicts a batch of about one percent of the capacity, so
    /// the scan over the tier only runs every so many inserts.
    fn enforce_capacity(&self) {
        let Some(capacity) = self.inner.config.capacity else {
            return;
        };
        if self.inner.slots.len() <= capacity {
            return;
        }

        let mut evicted = self.sweep();
        let target = capacity - capacity / 100;
        let excess = self.inner.slots.len().saturating_sub(target);
        if self.inner.slots.len() > capacity && excess > 0 {
            let mut candidates: Vec<(K, Instant)> = self
                .inner
                .slots
                .iter()
                .filter_map(|entry| match entry.value() {
                    Slot::Ready { last_read, .. } => Some((entry.key().clone(), *last_read)),
                    Slot::Pending { .. } => None,
                })
                .collect();
            let excess = excess.min(candidates.len());
            if excess < candidates.len() {
                candidates.select_nth_unstable_by_key(excess, |(_, last_read)| *last_read);
            }

            for (key, read_at) in candidates.into_iter().take(excess) {
                // Skip entries that were read or replaced since the scan
                let removed = self.inner.slots.remove_if(&key, |_, slot| {
                    matches!(slot, Slot::Ready { last_read, .. } if *last_read == read_at)
                });
                if removed.is_some() {
                    log::debug!("Evicted {key:?} from the {} tier", self.inner.name);
                    evicted += 1;
                }
            }
        }
        self.inner.stats.record_evictions(evicted);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
