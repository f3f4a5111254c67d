//! The engine shared by [`Cache`](crate::Cache) and [`ScopedCache`](crate::ScopedCache).
//!
//! The [`CacheCore`] owns a sharded map from keys to [`MapValue`]s. Readers never take a global
//! lock: every state transition is a compare-and-swap of the stored [`Arc`] on a single shard.
//!
//! Recency is tracked lazily. Every access and every removal pushes an event onto a lock-free
//! queue, and whoever manages to claim the [`AccessOrder`] drains that queue and evicts the least
//! recently used entries until the cache is within its capacity. A caller that fails to claim it
//! simply moves on, its event stays queued for the next sweep. Only the claim holder ever touches
//! the [`AccessOrder`].

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::access_order::AccessOrder;
use crate::clock::{self, Clock};
use crate::defer::defer;
use crate::entry::{CacheStats, Complete, EntryStats, Fetched, MapValue};
use crate::latch::{Latch, LatchWriter};
use crate::CacheError;

/// The type-erased lookup function.
pub(crate) type Lookup<K, V, E> = Arc<dyn Fn(K) -> BoxFuture<'static, Result<V, E>> + Send + Sync>;

/// Computes the time-to-live of a lookup outcome. `None` means it never expires.
pub(crate) type TimeToLive<V, E> =
    Arc<dyn Fn(Result<&V, &E>) -> Option<Duration> + Send + Sync>;

/// Called with every successful value that leaves the cache.
pub(crate) type RemovalListener<V> = Arc<dyn Fn(&V) + Send + Sync>;

pub(crate) fn boxed_lookup<K, V, E, F, Fut>(lookup: F) -> Lookup<K, V, E>
where
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
{
    Arc::new(move |key| lookup(key).boxed())
}

/// Everything that configures a [`CacheCore`] apart from its lookup.
pub(crate) struct Settings<V, E> {
    pub name: String,
    pub capacity: usize,
    pub time_to_live: TimeToLive<V, E>,
    pub clock: Arc<dyn Clock>,
    pub on_removal: Option<RemovalListener<V>>,
}

/// A change to the recency of a key, applied by the next sweep.
enum AccessEvent<K> {
    Touched(K),
    Removed(K),
}

/// How an existing entry can be served.
enum Resolution<V, E> {
    /// The entry holds a usable outcome.
    Ready(Result<V, E>),
    /// The entry is being computed.
    Waiting(Latch<V, E>),
    /// The entry had expired and was purged.
    Expired,
}

pub(crate) struct CacheCore<K, V, E> {
    name: String,
    capacity: usize,
    lookup: Lookup<K, V, E>,
    time_to_live: TimeToLive<V, E>,
    clock: Arc<dyn Clock>,
    on_removal: Option<RemovalListener<V>>,

    map: DashMap<K, Arc<MapValue<V, E>>>,
    events: (Sender<AccessEvent<K>>, Receiver<AccessEvent<K>>),
    order: Mutex<AccessOrder<K>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V, E> CacheCore<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(settings: Settings<V, E>, lookup: Lookup<K, V, E>) -> Self {
        let Settings {
            name,
            capacity,
            time_to_live,
            clock,
            on_removal,
        } = settings;

        Self {
            name,
            capacity,
            lookup,
            time_to_live,
            clock,
            on_removal,
            map: DashMap::new(),
            events: crossbeam_channel::unbounded(),
            order: Mutex::new(AccessOrder::with_capacity(capacity.min(4096))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, key: K) -> Result<V, CacheError<E>> {
        self.get_either(key).await.map(Fetched::into_inner)
    }

    pub async fn get_either(&self, key: K) -> Result<Fetched<V>, CacheError<E>> {
        loop {
            let value = match self.load(&key) {
                Some(value) => value,
                None => {
                    let (latch, writer) = Latch::new();
                    let pending = Arc::new(MapValue::Pending(latch));
                    match self.install(&key, &pending) {
                        Some(existing) => existing,
                        None => {
                            self.track_miss();
                            self.track_access(key.clone());
                            return self
                                .lookup_value_of(key, pending, writer)
                                .await
                                .map(Fetched::Computed);
                        }
                    }
                }
            };

            let latch = match self.resolve(&key, &value) {
                Resolution::Ready(result) => {
                    self.track_hit();
                    self.track_access(key);
                    return result.map(Fetched::Cached).map_err(CacheError::Lookup);
                }
                Resolution::Waiting(latch) => {
                    self.track_hit();
                    self.track_access(key);
                    latch
                }
                // The purged entry is retried as a miss.
                Resolution::Expired => continue,
            };

            return latch.wait().await.map(Fetched::Cached);
        }
    }

    pub fn get_option(&self, key: K) -> Result<Option<V>, E> {
        let resolution = self.load(&key).map(|value| self.resolve(&key, &value));
        match resolution {
            Some(Resolution::Ready(result)) => {
                self.track_hit();
                self.track_access(key);
                result.map(Some)
            }
            Some(Resolution::Waiting(_)) => {
                self.track_hit();
                self.track_access(key);
                Ok(None)
            }
            None | Some(Resolution::Expired) => {
                self.track_miss();
                self.track_access(key);
                Ok(None)
            }
        }
    }

    pub fn get_option_complete(&self, key: K) -> Option<V> {
        let Some(value) = self.load(&key) else {
            self.track_miss();
            self.track_access(key);
            return None;
        };

        match &*value {
            MapValue::Complete(_) => match self.resolve(&key, &value) {
                Resolution::Ready(result) => {
                    self.track_hit();
                    self.track_access(key);
                    result.ok()
                }
                _ => {
                    self.track_miss();
                    self.track_access(key);
                    None
                }
            },
            MapValue::Pending(_) | MapValue::Refreshing { .. } => {
                self.track_hit();
                self.track_access(key);
                None
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn entry_stats(&self, key: &K) -> Option<EntryStats> {
        let value = self.load(key)?;
        value.complete().map(|complete| complete.stats)
    }

    pub fn invalidate(&self, key: &K) {
        if let Some((_, removed)) = self.map.remove(key) {
            tracing::trace!(cache = self.name(), "invalidated entry");
            self.track_removal(key.clone());
            self.notify_removed(&removed);
        }
    }

    /// Invalidates the entry for `key` if it holds a value matching `predicate`.
    ///
    /// Failed, pending and refreshing entries are left alone.
    pub fn invalidate_when(&self, key: &K, predicate: impl FnOnce(&V) -> bool) {
        let Some(value) = self.load(key) else {
            return;
        };
        let matches = match &*value {
            MapValue::Complete(complete) => complete.value().is_some_and(predicate),
            _ => false,
        };

        if matches && self.remove_if_current(key, &value) {
            self.track_removal(key.clone());
            self.notify_removed(&value);
        }
    }

    pub fn invalidate_all(&self) {
        let mut removed = Vec::new();
        self.map.retain(|key, value| {
            removed.push((key.clone(), Arc::clone(value)));
            false
        });

        tracing::trace!(cache = self.name(), count = removed.len(), "invalidated all entries");
        for (key, value) in removed {
            self.track_removal(key);
            self.notify_removed(&value);
        }
    }

    pub async fn refresh(&self, key: K) -> Result<(), CacheError<E>> {
        let (latch, writer) = Latch::new();

        let value = match self.load(&key) {
            Some(value) => value,
            None => {
                let pending = Arc::new(MapValue::Pending(latch.clone()));
                match self.install(&key, &pending) {
                    Some(existing) => existing,
                    None => {
                        self.track_miss();
                        self.track_access(key.clone());
                        return self.lookup_value_of(key, pending, writer).await.map(drop);
                    }
                }
            }
        };

        let in_flight = match &*value {
            MapValue::Complete(complete) => {
                if complete.has_expired(self.clock.now_millis()) {
                    self.remove_expired(&key, &value);
                    return self.get(key).await.map(drop);
                }

                let refreshing = Arc::new(MapValue::Refreshing {
                    latch,
                    previous: Arc::clone(complete),
                });
                // Someone else replaced the entry since we looked, which is as good as a refresh.
                if !self.swap(&key, &value, &refreshing) {
                    return Ok(());
                }

                metric!(counter("caches.refresh") += 1, "cache" => self.name());
                tracing::trace!(cache = self.name(), "refreshing entry");
                return self.lookup_value_of(key, refreshing, writer).await.map(drop);
            }
            MapValue::Pending(in_flight) | MapValue::Refreshing { latch: in_flight, .. } => {
                in_flight.clone()
            }
        };

        in_flight.wait().await.map(drop)
    }

    pub fn set(&self, key: K, value: V) {
        let result = Ok(value);
        let complete = self.complete(result);
        if let Some(replaced) = self
            .map
            .insert(key.clone(), Arc::new(MapValue::Complete(complete)))
        {
            self.notify_removed(&replaced);
        }
        self.track_access(key);
    }

    /// The number of successfully loaded, unexpired entries.
    pub fn size(&self) -> usize {
        self.successes(|_, _| ()).len()
    }

    pub fn values(&self) -> Vec<V> {
        self.successes(|_, value| value.clone())
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        self.successes(|key, value| (key.clone(), value.clone()))
    }

    pub fn keys(&self) -> Vec<K> {
        self.successes(|key, _| key.clone())
    }

    pub fn cache_stats(&self) -> CacheStats {
        let now = self.clock.now_millis();
        let size = self
            .map
            .iter()
            .filter(|entry| !entry.value().has_expired(now))
            .count();

        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size,
        }
    }

    fn successes<T>(&self, mut f: impl FnMut(&K, &V) -> T) -> Vec<T> {
        let now = self.clock.now_millis();
        let mut out = Vec::new();
        for entry in self.map.iter() {
            if let MapValue::Complete(complete) = &**entry.value() {
                if let Some(value) = complete.value().filter(|_| !complete.has_expired(now)) {
                    out.push(f(entry.key(), value));
                }
            }
        }
        out
    }

    /// Clones the current value out of the map, so no shard lock outlives this call.
    fn load(&self, key: &K) -> Option<Arc<MapValue<V, E>>> {
        self.map.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Installs `pending` for `key`, unless the key is already present.
    ///
    /// Returns the entry that won instead of ours, if any.
    fn install(&self, key: &K, pending: &Arc<MapValue<V, E>>) -> Option<Arc<MapValue<V, E>>> {
        match self.map.entry(key.clone()) {
            Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(pending));
                tracing::trace!(cache = self.name(), "installed pending entry");
                None
            }
        }
    }

    /// Replaces the entry for `key` with `new`, if it is still `current`.
    fn swap(&self, key: &K, current: &Arc<MapValue<V, E>>, new: &Arc<MapValue<V, E>>) -> bool {
        match self.map.get_mut(key) {
            Some(mut entry) if Arc::ptr_eq(entry.value(), current) => {
                *entry = Arc::clone(new);
                true
            }
            _ => false,
        }
    }

    fn remove_if_current(&self, key: &K, current: &Arc<MapValue<V, E>>) -> bool {
        self.map
            .remove_if(key, |_, value| Arc::ptr_eq(value, current))
            .is_some()
    }

    fn resolve(&self, key: &K, value: &Arc<MapValue<V, E>>) -> Resolution<V, E> {
        let now = self.clock.now_millis();
        match &**value {
            MapValue::Complete(complete) if complete.has_expired(now) => {
                self.remove_expired(key, value);
                Resolution::Expired
            }
            MapValue::Complete(complete) => Resolution::Ready(complete.result.clone()),
            MapValue::Pending(latch) => Resolution::Waiting(latch.clone()),
            MapValue::Refreshing { latch, previous } if previous.has_expired(now) => {
                Resolution::Waiting(latch.clone())
            }
            MapValue::Refreshing { previous, .. } => Resolution::Ready(previous.result.clone()),
        }
    }

    fn remove_expired(&self, key: &K, value: &Arc<MapValue<V, E>>) {
        if self.remove_if_current(key, value) {
            metric!(counter("caches.expired") += 1, "cache" => self.name());
            tracing::trace!(cache = self.name(), "purged expired entry");
            self.notify_removed(value);
        }
    }

    fn complete(&self, result: Result<V, E>) -> Arc<Complete<V, E>> {
        let now = self.clock.now_millis();
        let time_to_live = (self.time_to_live)(result.as_ref());
        Arc::new(Complete {
            result,
            stats: EntryStats {
                loaded_at_millis: now,
            },
            expires_at_millis: clock::expires_at(now, time_to_live),
        })
    }

    /// Runs the lookup for `key` and publishes its outcome.
    ///
    /// `installed` is the entry this call put into the map for the duration of the lookup. If the
    /// returned future is dropped before the lookup finishes, that entry is rolled back and every
    /// waiter on the latch observes [`CacheError::Cancelled`].
    async fn lookup_value_of(
        &self,
        key: K,
        installed: Arc<MapValue<V, E>>,
        writer: LatchWriter<V, E>,
    ) -> Result<V, CacheError<E>> {
        let guard = defer(|| self.abandon(&key, &installed));
        let result = (self.lookup)(key.clone()).await;
        guard.disarm();

        metric!(counter("caches.computation") += 1, "cache" => self.name());

        let complete = self.complete(result.clone());
        if let Some(replaced) = self
            .map
            .insert(key.clone(), Arc::new(MapValue::Complete(complete)))
        {
            self.notify_removed(&replaced);
        }
        // The pending entry may have been evicted or invalidated while the lookup ran.
        self.track_access(key);
        writer.resolve(result.clone());

        result.map_err(CacheError::Lookup)
    }

    /// Rolls back the entry of a cancelled lookup.
    ///
    /// A cancelled refresh puts the previous value back, a cancelled load removes the key.
    fn abandon(&self, key: &K, installed: &Arc<MapValue<V, E>>) {
        metric!(counter("caches.computation.cancelled") += 1, "cache" => self.name());
        tracing::debug!(cache = self.name(), "lookup was cancelled");

        match &**installed {
            MapValue::Refreshing { previous, .. } => {
                let restored = Arc::new(MapValue::Complete(Arc::clone(previous)));
                self.swap(key, installed, &restored);
            }
            _ => {
                self.remove_if_current(key, installed);
            }
        }
    }

    fn notify_removed(&self, value: &MapValue<V, E>) {
        let Some(on_removal) = &self.on_removal else {
            return;
        };
        if let Some(value) = value.complete().and_then(|complete| complete.value()) {
            on_removal(value);
        }
    }

    fn track_hit(&self) {
        metric!(counter("caches.memory.hit") += 1, "cache" => self.name());
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn track_miss(&self) {
        metric!(counter("caches.memory.miss") += 1, "cache" => self.name());
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an access to `key`, and evicts the coldest entries if this call wins the claim.
    fn track_access(&self, key: K) {
        metric!(counter("caches.access") += 1, "cache" => self.name());

        // The receiving side lives as long as `self`.
        let _ = self.events.0.send(AccessEvent::Touched(key));
        self.sweep();
    }

    /// Records that `key` left the map.
    fn track_removal(&self, key: K) {
        let _ = self.events.0.send(AccessEvent::Removed(key));
        self.sweep();
    }

    /// Applies all queued events to the access order and evicts entries beyond the capacity.
    ///
    /// Does nothing if another caller is sweeping already.
    fn sweep(&self) {
        let Some(mut order) = self.order.try_lock() else {
            return;
        };
        let start = Instant::now();

        while let Ok(event) = self.events.1.try_recv() {
            match event {
                AccessEvent::Touched(key) => order.add(key),
                // A key that was installed again has a `Touched` event queued after this one.
                AccessEvent::Removed(key) => {
                    if !self.map.contains_key(&key) {
                        order.remove(&key);
                    }
                }
            }
        }

        let mut evicted = Vec::new();
        while self.map.len() > self.capacity {
            let Some(oldest) = order.remove_oldest() else {
                break;
            };
            if let Some((_, value)) = self.map.remove(&oldest) {
                evicted.push(value);
            }
        }
        let tracked = order.len();
        drop(order);

        metric!(gauge("caches.memory.tracked") = tracked as u64, "cache" => self.name());
        if !evicted.is_empty() {
            metric!(timer("caches.eviction.duration") = start.elapsed(), "cache" => self.name());
            metric!(counter("caches.eviction") += evicted.len() as i64, "cache" => self.name());
            tracing::trace!(cache = self.name(), count = evicted.len(), "evicted entries");
        }
        for value in evicted {
            self.notify_removed(&value);
        }
    }
}
