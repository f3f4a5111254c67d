//! The per-key state machine of the cache.
//!
//! Every key in the cache maps to exactly one [`MapValue`]:
//!
//! ```text
//!            miss                 lookup done
//!   (none) ───────► Pending ─────────────────► Complete ◄────┐
//!                                                 │          │ lookup done
//!                                                 │ refresh  │
//!                                                 └────► Refreshing
//! ```
//!
//! Values are stored behind an [`Arc`], and state transitions compare the stored [`Arc`] by
//! identity. A transition only happens if the entry is still the exact object the decision was
//! based on.

use std::sync::Arc;

use crate::latch::Latch;

/// Statistics about a single cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStats {
    /// The time at which the value was loaded, in milliseconds of the cache [`Clock`](crate::Clock).
    pub loaded_at_millis: u64,
}

/// Statistics about the cache as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Accesses that found an entry, including in-flight ones.
    pub hits: u64,
    /// Accesses that found nothing, or an expired entry.
    pub misses: u64,
    /// Entries currently held, excluding expired ones.
    pub size: usize,
}

/// Where the value returned by [`Cache::get_either`](crate::Cache::get_either) came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetched<V> {
    /// The value was already cached, or being computed by another caller.
    Cached(V),
    /// The value was computed by this call.
    Computed(V),
}

impl<V> Fetched<V> {
    /// Returns the value, regardless of where it came from.
    pub fn into_inner(self) -> V {
        match self {
            Self::Cached(value) | Self::Computed(value) => value,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }
}

/// A resolved lookup.
#[derive(Debug)]
pub(crate) struct Complete<V, E> {
    pub result: Result<V, E>,
    pub stats: EntryStats,
    pub expires_at_millis: u64,
}

impl<V, E> Complete<V, E> {
    /// Whether this entry is expired at `now`.
    pub fn has_expired(&self, now: u64) -> bool {
        now > self.expires_at_millis
    }

    pub fn value(&self) -> Option<&V> {
        self.result.as_ref().ok()
    }
}

/// The state of a single key.
#[derive(Debug)]
pub(crate) enum MapValue<V, E> {
    /// A lookup is in flight.
    Pending(Latch<V, E>),
    /// The lookup has finished.
    Complete(Arc<Complete<V, E>>),
    /// A new lookup is in flight, while the previous value is still being served.
    Refreshing {
        latch: Latch<V, E>,
        previous: Arc<Complete<V, E>>,
    },
}

impl<V, E> MapValue<V, E> {
    /// The complete value this entry can serve, if any.
    pub fn complete(&self) -> Option<&Arc<Complete<V, E>>> {
        match self {
            MapValue::Pending(_) => None,
            MapValue::Complete(complete) => Some(complete),
            MapValue::Refreshing { previous, .. } => Some(previous),
        }
    }

    /// Whether this entry has run out of time at `now`.
    ///
    /// Pending entries never expire, as they have no value yet.
    pub fn has_expired(&self, now: u64) -> bool {
        self.complete()
            .is_some_and(|complete| complete.has_expired(now))
    }
}
