//! Concurrent memoizing caches for async lookups.
//!
//! There are two caches, both built on the same engine:
//!
//! - [`Cache`] computes values on demand with request coalescing, bounds its size with LRU
//!   eviction and bounds staleness with a time-to-live.
//! - [`ScopedCache`] caches acquired resources, and defers releasing them until the last borrower
//!   is done with them, even after the cache has dropped them.
//!
//! [`cached_function`] is a shorthand for an unbounded cache in front of a single function.

#[macro_use]
pub mod metrics;

pub mod config;
pub mod logging;

mod access_order;
mod cache;
mod clock;
mod defer;
mod engine;
mod entry;
mod error;
mod latch;
mod memoize;
mod scope;
mod scoped;

pub use access_order::AccessOrder;
pub use cache::{Cache, CacheBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{CacheStats, EntryStats, Fetched};
pub use error::{CacheError, ConfigError};
pub use memoize::{Memoized, cached_function};
pub use scope::Scope;
pub use scoped::ScopedCache;
