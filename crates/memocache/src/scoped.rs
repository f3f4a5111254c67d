//! A cache of acquired resources.
//!
//! Each value of a [`ScopedCache`] is acquired together with a [`Scope`] holding its finalizers,
//! such as closing a connection. The value stays alive as long as either the cache or any of its
//! borrowers needs it:
//!
//! - The cache owns one share of every entry it holds, and gives it up when the entry is evicted,
//!   invalidated, expires or is replaced by a refresh.
//! - Every successful [`get`](ScopedCache::get) adds a share that is given up when the caller's
//!   scope closes.
//!
//! The resource's finalizers run exactly once, when the last share is given up.

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;

use crate::cache::CacheBuilder;
use crate::config::CacheConfig;
use crate::engine::{CacheCore, Lookup, Settings};
use crate::entry::{CacheStats, EntryStats};
use crate::scope::Scope;
use crate::{CacheError, ConfigError};

/// A cached resource with its owner count.
pub(crate) struct ScopedEntry<V> {
    value: V,
    resource: Scope,
    /// The cache's share plus one per borrower. The resource is finalized when this reaches zero.
    owners: AtomicUsize,
    retired: AtomicBool,
    cache: Arc<str>,
}

impl<V> ScopedEntry<V> {
    fn new(value: V, resource: Scope, cache: Arc<str>) -> Self {
        Self {
            value,
            resource,
            owners: AtomicUsize::new(1),
            retired: AtomicBool::new(false),
            cache,
        }
    }

    /// Adds a borrower, unless the resource is already finalized.
    fn try_acquire(&self) -> bool {
        let mut owners = self.owners.load(Ordering::Acquire);
        loop {
            if owners == 0 {
                return false;
            }
            match self.owners.compare_exchange_weak(
                owners,
                owners + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => owners = current,
            }
        }
    }

    /// Gives up one share, finalizing the resource if it was the last one.
    fn release(&self) -> anyhow::Result<()> {
        if self.owners.fetch_sub(1, Ordering::AcqRel) != 1 {
            return Ok(());
        }

        tracing::trace!(cache = self.cache.as_ref(), "finalizing resource");
        match self.resource.close() {
            Ok(()) => {
                metric!(counter("caches.resource.finalized") += 1, "cache" => self.cache.as_ref());
                Ok(())
            }
            Err(error) => {
                metric!(counter("caches.resource.finalizer_failed") += 1, "cache" => self.cache.as_ref());
                Err(error)
            }
        }
    }

    /// Gives up the cache's share. Only the first call has an effect.
    fn retire(&self) {
        if self.retired.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(error) = self.release() {
            tracing::error!(cache = self.cache.as_ref(), error = %error, "resource finalizer failed");
        }
    }

    #[cfg(test)]
    fn owners(&self) -> usize {
        self.owners.load(Ordering::Acquire)
    }
}

struct ScopedInner<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    core: CacheCore<K, Arc<ScopedEntry<V>>, E>,
}

impl<K, V, E> Drop for ScopedInner<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        // Resources that are still borrowed are finalized by their last borrower.
        self.core.invalidate_all();
    }
}

/// A cache of resources that must be released once nobody uses them anymore.
///
/// The lookup receives a fresh [`Scope`] for every resource it acquires, and registers the
/// resource's finalizers on it. Callers pass their own [`Scope`] to [`get`](Self::get), and the
/// resource is guaranteed to stay alive until that scope is closed, even if the cache drops the
/// entry in the meantime.
///
/// Failed acquisitions are cached like values, and their scope is closed right away.
pub struct ScopedCache<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    inner: Arc<ScopedInner<K, V, E>>,
}

impl<V, E> CacheBuilder<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a scoped cache, acquiring missing resources with `lookup`.
    pub fn build_scoped<K, F, Fut>(self, lookup: F) -> Result<ScopedCache<K, V, E>, ConfigError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        F: Fn(K, Scope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let Settings {
            name,
            capacity,
            time_to_live,
            clock,
            on_removal,
        } = self.into_settings()?;
        let cache: Arc<str> = Arc::from(name.as_str());

        let settings = Settings {
            name,
            capacity,
            time_to_live: Arc::new(move |result: Result<&Arc<ScopedEntry<V>>, &E>| {
                time_to_live(result.map(|entry| &entry.value))
            }),
            clock,
            on_removal: Some(Arc::new(move |entry: &Arc<ScopedEntry<V>>| {
                if let Some(on_removal) = &on_removal {
                    on_removal(&entry.value);
                }
                entry.retire();
            })),
        };

        let lookup: Lookup<K, Arc<ScopedEntry<V>>, E> = Arc::new(move |key| {
            let resource = Scope::new();
            let acquire = lookup(key, resource.clone());
            let cache = Arc::clone(&cache);
            async move {
                match acquire.await {
                    Ok(value) => Ok(Arc::new(ScopedEntry::new(value, resource, cache))),
                    Err(error) => {
                        if let Err(finalizer_error) = resource.close() {
                            metric!(counter("caches.resource.finalizer_failed") += 1, "cache" => cache.as_ref());
                            tracing::error!(
                                cache = cache.as_ref(),
                                error = %finalizer_error,
                                "finalizer of failed acquisition failed"
                            );
                        }
                        Err(error)
                    }
                }
            }
            .boxed()
        });

        Ok(ScopedCache {
            inner: Arc::new(ScopedInner {
                core: CacheCore::new(settings, lookup),
            }),
        })
    }
}

impl<K, V, E> ScopedCache<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a scoped cache with a fixed time-to-live. `None` means entries never expire.
    pub fn new<F, Fut>(
        capacity: usize,
        time_to_live: Option<Duration>,
        lookup: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(K, Scope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        CacheBuilder::new(capacity)
            .time_to_live(time_to_live)
            .build_scoped(lookup)
    }

    pub fn from_config<F, Fut>(config: &CacheConfig, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(K, Scope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        CacheBuilder::from(config).build_scoped(lookup)
    }

    /// Borrows the resource for `key` until `scope` is closed, acquiring it if necessary.
    pub async fn get(&self, key: K, scope: &Scope) -> Result<V, CacheError<E>> {
        loop {
            let entry = self.inner.core.get(key.clone()).await?;
            if let Some(value) = borrow(entry, scope) {
                return Ok(value);
            }
            // The entry was retired and finalized after we looked it up. Its replacement is
            // either in flight already or will be started by the next attempt.
        }
    }

    /// Borrows the resource for `key` if it is available without waiting.
    ///
    /// A cached failure is returned as `Err`.
    pub fn get_option(&self, key: K, scope: &Scope) -> Result<Option<V>, E> {
        let entry = self.inner.core.get_option(key)?;
        Ok(entry.and_then(|entry| borrow(entry, scope)))
    }

    /// Borrows the resource for `key` only if its entry is fully settled.
    pub fn get_option_complete(&self, key: K, scope: &Scope) -> Option<V> {
        let entry = self.inner.core.get_option_complete(key)?;
        borrow(entry, scope)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.core.contains(key)
    }

    pub fn entry_stats(&self, key: &K) -> Option<EntryStats> {
        self.inner.core.entry_stats(key)
    }

    /// Drops the cache's share of the resource for `key`.
    ///
    /// Borrowers keep their resource until their scopes close.
    pub fn invalidate(&self, key: &K) {
        self.inner.core.invalidate(key)
    }

    pub fn invalidate_all(&self) {
        self.inner.core.invalidate_all()
    }

    /// Acquires a new resource for `key`, retiring the current one once the new one is ready.
    ///
    /// Existing borrowers keep the resource they have, later calls to [`get`](Self::get) receive
    /// the new one.
    pub async fn refresh(&self, key: K) -> Result<(), CacheError<E>> {
        self.inner.core.refresh(key).await
    }

    pub fn size(&self) -> usize {
        self.inner.core.size()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.core.cache_stats()
    }
}

/// Registers a borrow of `entry` on `scope`, if the resource is still alive.
fn borrow<V>(entry: Arc<ScopedEntry<V>>, scope: &Scope) -> Option<V>
where
    V: Clone + Send + Sync + 'static,
{
    if !entry.try_acquire() {
        return None;
    }
    let value = entry.value.clone();
    scope.add_finalizer(move || entry.release());
    Some(value)
}

impl<K, V, E> Clone for ScopedCache<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, E> fmt::Debug for ScopedCache<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedCache")
            .field("name", &self.inner.core.name())
            .field("stats", &self.inner.core.cache_stats())
            .finish()
    }
}
