use std::io;

use thiserror::Error;

/// An error returned by cache lookups.
///
/// Every caller waiting on the same in-flight lookup observes the same outcome, so this error is
/// cloneable whenever the lookup error is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError<E> {
    /// The lookup function failed.
    ///
    /// Failures are cached like values, and replayed to later callers until the entry expires,
    /// is invalidated or is refreshed.
    #[error("lookup failed: {0}")]
    Lookup(E),
    /// The task running the lookup was cancelled before it produced a value.
    ///
    /// This is never cached. The next call for the same key starts a new lookup.
    #[error("lookup was cancelled")]
    Cancelled,
}

impl<E> CacheError<E> {
    /// Returns the lookup error, if this is not a cancellation.
    pub fn into_lookup(self) -> Option<E> {
        match self {
            Self::Lookup(err) => Some(err),
            Self::Cancelled => None,
        }
    }

    /// Whether the lookup was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// An error in the configuration of a cache.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A cache must be able to hold at least one entry.
    #[error("cache capacity must be greater than zero")]
    ZeroCapacity,
    /// The configuration file could not be read.
    #[error("failed to read config file")]
    Io(#[from] io::Error),
    /// The configuration file exists but has no content.
    #[error("config file empty")]
    Empty,
    /// The configuration file is not valid YAML for the expected schema.
    #[error("failed to parse config YAML")]
    Parse(#[from] serde_yaml::Error),
}
