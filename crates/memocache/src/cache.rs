use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::engine::{self, CacheCore, RemovalListener, Settings, TimeToLive};
use crate::entry::{CacheStats, EntryStats, Fetched};
use crate::{CacheError, ConfigError};

/// Configures and creates a [`Cache`] or a [`ScopedCache`](crate::ScopedCache).
pub struct CacheBuilder<V, E> {
    pub(crate) name: String,
    pub(crate) capacity: usize,
    pub(crate) time_to_live: TimeToLive<V, E>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) on_removal: Option<RemovalListener<V>>,
}

impl<V, E> CacheBuilder<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Starts configuring a cache holding at most `capacity` entries, which never expire.
    pub fn new(capacity: usize) -> Self {
        Self {
            name: "default".into(),
            capacity,
            time_to_live: Arc::new(|_: Result<&V, &E>| None),
            clock: Arc::new(SystemClock),
            on_removal: None,
        }
    }

    /// The name the cache reports its metrics and logs under.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Expires every entry `time_to_live` after it was loaded. `None` disables expiry.
    pub fn time_to_live(mut self, time_to_live: Option<Duration>) -> Self {
        self.time_to_live = Arc::new(move |_: Result<&V, &E>| time_to_live);
        self
    }

    /// Computes the time-to-live of each entry from its lookup outcome.
    ///
    /// This allows failures to be retried sooner than successes are refreshed.
    pub fn time_to_live_fn<F>(mut self, time_to_live: F) -> Self
    where
        F: Fn(Result<&V, &E>) -> Option<Duration> + Send + Sync + 'static,
    {
        self.time_to_live = Arc::new(time_to_live);
        self
    }

    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Registers a callback that is invoked with every successfully loaded value that leaves the
    /// cache, whether through eviction, invalidation, expiry or replacement.
    pub fn removal_listener<F>(mut self, on_removal: F) -> Self
    where
        F: Fn(&V) + Send + Sync + 'static,
    {
        self.on_removal = Some(Arc::new(on_removal));
        self
    }

    /// Creates the cache, computing missing values with `lookup`.
    pub fn build<K, F, Fut>(self, lookup: F) -> Result<Cache<K, V, E>, ConfigError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let settings = self.into_settings()?;
        let core = CacheCore::new(settings, engine::boxed_lookup(lookup));
        Ok(Cache {
            core: Arc::new(core),
        })
    }

    pub(crate) fn into_settings(self) -> Result<Settings<V, E>, ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(Settings {
            name: self.name,
            capacity: self.capacity,
            time_to_live: self.time_to_live,
            clock: self.clock,
            on_removal: self.on_removal,
        })
    }
}

impl<V, E> From<&CacheConfig> for CacheBuilder<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn from(config: &CacheConfig) -> Self {
        Self::new(config.capacity)
            .name(config.name.clone())
            .time_to_live(config.time_to_live)
    }
}

/// A concurrent, memoizing cache of async lookups.
///
/// Values are computed on demand by the lookup function the cache was created with. Concurrent
/// requests for the same missing key share one lookup, and all of them receive its outcome.
/// Failed lookups are cached just like successful ones.
///
/// The cache holds at most `capacity` entries and evicts the least recently used ones beyond
/// that. Entries expire after their time-to-live, measured from the moment they were loaded.
///
/// Cloning a [`Cache`] is cheap and yields another handle to the same entries.
pub struct Cache<K, V, E> {
    core: Arc<CacheCore<K, V, E>>,
}

impl<K, V, E> Cache<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a cache with a fixed time-to-live. `None` means entries never expire.
    pub fn new<F, Fut>(
        capacity: usize,
        time_to_live: Option<Duration>,
        lookup: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        CacheBuilder::new(capacity)
            .time_to_live(time_to_live)
            .build(lookup)
    }

    /// Creates a cache whose time-to-live depends on the outcome of each lookup.
    pub fn with_ttl_fn<F, Fut, T>(
        capacity: usize,
        lookup: F,
        time_to_live: T,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        T: Fn(Result<&V, &E>) -> Option<Duration> + Send + Sync + 'static,
    {
        CacheBuilder::new(capacity)
            .time_to_live_fn(time_to_live)
            .build(lookup)
    }

    pub fn from_config<F, Fut>(config: &CacheConfig, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        CacheBuilder::from(config).build(lookup)
    }

    /// Returns the value for `key`, computing it if necessary.
    ///
    /// If a lookup for `key` is already in flight, this waits for its outcome instead of starting
    /// another one.
    pub async fn get(&self, key: K) -> Result<V, CacheError<E>> {
        self.core.get(key).await
    }

    /// Like [`get`](Self::get), but tells whether the value was computed by this call.
    pub async fn get_either(&self, key: K) -> Result<Fetched<V>, CacheError<E>> {
        self.core.get_either(key).await
    }

    /// Returns the cached value for `key` without ever computing or waiting for it.
    ///
    /// Keys with a lookup in flight read as `None`, unless they are being refreshed and the
    /// previous value is still valid. A cached failure is returned as `Err`.
    pub fn get_option(&self, key: K) -> Result<Option<V>, E> {
        self.core.get_option(key)
    }

    /// Returns the cached value for `key` only if its entry is fully settled.
    ///
    /// Unlike [`get_option`](Self::get_option) this also reads as `None` while a refresh is in
    /// flight, and for cached failures.
    pub fn get_option_complete(&self, key: K) -> Option<V> {
        self.core.get_option_complete(key)
    }

    /// Whether the cache holds an entry for `key`, in any state.
    pub fn contains(&self, key: &K) -> bool {
        self.core.contains(key)
    }

    pub fn entry_stats(&self, key: &K) -> Option<EntryStats> {
        self.core.entry_stats(key)
    }

    pub fn invalidate(&self, key: &K) {
        self.core.invalidate(key)
    }

    /// Invalidates the value for `key` if it was loaded successfully and matches `predicate`.
    pub fn invalidate_when(&self, key: &K, predicate: impl FnOnce(&V) -> bool) {
        self.core.invalidate_when(key, predicate)
    }

    pub fn invalidate_all(&self) {
        self.core.invalidate_all()
    }

    /// Recomputes the value for `key`.
    ///
    /// While the new value is being computed, the previous one keeps being served.
    pub async fn refresh(&self, key: K) -> Result<(), CacheError<E>> {
        self.core.refresh(key).await
    }

    /// Stores `value` for `key`, bypassing the lookup.
    pub fn set(&self, key: K, value: V) {
        self.core.set(key, value)
    }

    pub fn size(&self) -> usize {
        self.core.size()
    }

    pub fn values(&self) -> Vec<V> {
        self.core.values()
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        self.core.entries()
    }

    pub fn keys(&self) -> Vec<K> {
        self.core.keys()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.core.cache_stats()
    }
}

impl<K, V, E> Clone for Cache<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<K, V, E> fmt::Debug for Cache<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.core.name())
            .field("stats", &self.core.cache_stats())
            .finish()
    }
}
