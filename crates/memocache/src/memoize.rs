use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use crate::CacheError;
use crate::clock::SystemClock;
use crate::engine::{self, CacheCore, Settings};

/// An async function that remembers its results.
///
/// Created by [`cached_function`].
pub struct Memoized<K, V, E> {
    core: Arc<CacheCore<K, V, E>>,
}

/// Wraps `f` so that it runs at most once per distinct argument.
///
/// Results are kept forever, failures included. Concurrent calls with the same argument share a
/// single invocation of `f`.
pub fn cached_function<K, V, E, F, Fut>(f: F) -> Memoized<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
{
    let settings = Settings {
        name: "memoized".into(),
        capacity: usize::MAX,
        time_to_live: Arc::new(|_: Result<&V, &E>| None),
        clock: Arc::new(SystemClock),
        on_removal: None,
    };
    Memoized {
        core: Arc::new(CacheCore::new(settings, engine::boxed_lookup(f))),
    }
}

impl<K, V, E> Memoized<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub async fn call(&self, arg: K) -> Result<V, CacheError<E>> {
        self.core.get(arg).await
    }
}

impl<K, V, E> Clone for Memoized<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}
