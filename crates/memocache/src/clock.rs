//! Time sources used for entry statistics and expiry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of the current time, in milliseconds.
pub trait Clock: Send + Sync + 'static {
    /// The current time in milliseconds.
    fn now_millis(&self) -> u64;
}

/// The wall clock, as milliseconds since the unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis() as u64)
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time, so a test can keep one handle and hand another to the cache.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock starting at `millis`.
    pub fn new(millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(millis)),
        }
    }

    /// Moves the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        self.millis
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Computes the absolute expiry of an entry loaded at `now`.
///
/// `None` means the entry never expires.
pub(crate) fn expires_at(now: u64, time_to_live: Option<Duration>) -> u64 {
    match time_to_live {
        Some(ttl) => now.saturating_add(ttl.as_millis().min(u64::MAX as u128) as u64),
        None => u64::MAX,
    }
}
