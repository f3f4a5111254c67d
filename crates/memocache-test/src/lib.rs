//! Helpers for testing the caches.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Resources handed out by [`WatchableLookup`] are only counted as acquired once the test
//!    calls [`ObservableResource::acquire`], typically from inside the cache lookup. Register the
//!    returned cleanup on the lookup's scope, so that the cache decides when it runs.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `memocache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("memocache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

static NEXT_RESOURCE_ID: AtomicUsize = AtomicUsize::new(0);

/// A resource that counts how often it was acquired and cleaned up.
///
/// Clones share their counters, so a test can keep one and hand out the others.
#[derive(Clone)]
pub struct ObservableResource {
    id: usize,
    acquired: Arc<AtomicUsize>,
    cleaned: Arc<AtomicUsize>,
}

impl ObservableResource {
    pub fn new() -> Self {
        Self {
            id: NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed),
            acquired: Default::default(),
            cleaned: Default::default(),
        }
    }

    /// Acquires the resource, returning the cleanup that releases it.
    pub fn acquire(&self) -> impl FnOnce() -> anyhow::Result<()> + Send + 'static {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let cleaned = Arc::clone(&self.cleaned);
        move || {
            cleaned.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn cleaned(&self) -> usize {
        self.cleaned.load(Ordering::SeqCst)
    }

    #[track_caller]
    pub fn assert_not_acquired(&self) {
        assert_eq!(self.acquired(), 0, "resource {} was acquired", self.id);
        assert_eq!(self.cleaned(), 0, "resource {} was cleaned", self.id);
    }

    #[track_caller]
    pub fn assert_acquired_once_and_not_cleaned(&self) {
        assert_eq!(self.acquired(), 1, "resource {} acquisitions", self.id);
        assert_eq!(self.cleaned(), 0, "resource {} cleanups", self.id);
    }

    #[track_caller]
    pub fn assert_acquired_once_and_cleaned(&self) {
        assert_eq!(self.acquired(), 1, "resource {} acquisitions", self.id);
        assert_eq!(self.cleaned(), 1, "resource {} cleanups", self.id);
    }
}

impl Default for ObservableResource {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for ObservableResource {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for ObservableResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableResource")
            .field("id", &self.id)
            .field("acquired", &self.acquired())
            .field("cleaned", &self.cleaned())
            .finish()
    }
}

/// A lookup that creates a fresh [`ObservableResource`] per call, and remembers all of them.
///
/// The lookup can be [`lock`](Self::lock)ed, in which case calls are recorded right away but do
/// not complete until it is [`unlock`](Self::unlock)ed again.
pub struct WatchableLookup<K> {
    created: Arc<Mutex<HashMap<K, Vec<ObservableResource>>>>,
    locked: Arc<watch::Sender<bool>>,
}

impl<K> WatchableLookup<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        let (locked, _) = watch::channel(false);
        Self {
            created: Default::default(),
            locked: Arc::new(locked),
        }
    }

    /// Records a call for `key` and returns the resource it created, once the lookup is unlocked.
    pub fn call(&self, key: K) -> impl Future<Output = ObservableResource> + Send + use<K> {
        let resource = ObservableResource::new();
        self.created
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push(resource.clone());

        let mut unlocked = self.locked.subscribe();
        async move {
            // The sender lives in `self`, which outlives every call in a test.
            let _ = unlocked.wait_for(|locked| !*locked).await;
            resource
        }
    }

    /// Holds all current and future calls until [`unlock`](Self::unlock).
    pub fn lock(&self) {
        self.locked.send_replace(true);
    }

    pub fn unlock(&self) {
        self.locked.send_replace(false);
    }

    pub fn called_times(&self, key: &K) -> usize {
        self.created
            .lock()
            .unwrap()
            .get(key)
            .map_or(0, Vec::len)
    }

    /// All resources created for `key`, oldest first.
    pub fn created_resources(&self, key: &K) -> Vec<ObservableResource> {
        self.created
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    #[track_caller]
    pub fn first_created_resource(&self, key: &K) -> ObservableResource {
        self.created_resources(key)
            .into_iter()
            .next()
            .expect("no resource was created for this key")
    }

    /// Asserts that every resource created for `key` has been released as often as acquired.
    #[track_caller]
    pub fn assert_all_cleaned_for_key(&self, key: &K) {
        for resource in self.created_resources(key) {
            assert_eq!(resource.acquired(), resource.cleaned(), "{resource:?}");
        }
    }

    #[track_caller]
    pub fn assert_first_n_created_resources_cleaned(&self, key: &K, n: usize) {
        let resources = self.created_resources(key);
        assert!(resources.len() >= n, "only {} resources were created", resources.len());
        for resource in &resources[..n] {
            resource.assert_acquired_once_and_cleaned();
        }
    }
}

impl<K> Clone for WatchableLookup<K> {
    fn clone(&self) -> Self {
        Self {
            created: Arc::clone(&self.created),
            locked: Arc::clone(&self.locked),
        }
    }
}

impl<K> Default for WatchableLookup<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
