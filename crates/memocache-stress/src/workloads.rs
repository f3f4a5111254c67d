use std::future::Future;
use std::time::Duration;

use memocache::config::CacheConfig;
use memocache::{Cache, CacheBuilder, CacheError, Scope, ScopedCache};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// Number of distinct keys requested, drawn uniformly.
    pub keys: u64,
    /// Time each lookup takes.
    #[serde(default, with = "humantime_serde")]
    pub latency: Duration,
    /// Share of lookups that fail, between `0.0` and `1.0`.
    #[serde(default)]
    pub failure_rate: f64,
    /// Share of requests that refresh their key instead of reading it.
    #[serde(default)]
    pub refresh_rate: f64,
    #[serde(default)]
    pub kind: CacheKind,
    /// Overrides the configured cache capacity.
    #[serde(default)]
    pub capacity: Option<usize>,
    /// Overrides the configured time-to-live.
    #[serde(default, with = "humantime_serde")]
    pub time_to_live: Option<Duration>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    #[default]
    Plain,
    Scoped,
}

pub enum PreparedCache {
    Plain(Cache<u64, u64, String>),
    Scoped(ScopedCache<u64, u64, String>),
}

pub struct PreparedWorkload {
    pub concurrency: usize,
    keys: u64,
    refresh_rate: f64,
    pub cache: PreparedCache,
}

/// Creates the cache a workload runs against, using the shared cache configuration.
pub fn prepare_workload(
    index: usize,
    config: &CacheConfig,
    workload: Workload,
) -> anyhow::Result<PreparedWorkload> {
    let Workload {
        concurrency,
        keys,
        latency,
        failure_rate,
        refresh_rate,
        kind,
        capacity,
        time_to_live,
    } = workload;

    let config = CacheConfig {
        name: format!("{}.{index}", config.name),
        capacity: capacity.unwrap_or(config.capacity),
        time_to_live: time_to_live.or(config.time_to_live),
    };
    let builder = CacheBuilder::from(&config);
    let cache = match kind {
        CacheKind::Plain => PreparedCache::Plain(
            builder.build(move |key: u64| simulated_lookup(key, latency, failure_rate))?,
        ),
        CacheKind::Scoped => {
            PreparedCache::Scoped(builder.build_scoped(move |key: u64, scope: Scope| {
                // the resource is a no-op, we only want the bookkeeping
                scope.add_finalizer(|| Ok(()));
                simulated_lookup(key, latency, failure_rate)
            })?)
        }
    };

    Ok(PreparedWorkload {
        concurrency,
        keys: keys.max(1),
        refresh_rate,
        cache,
    })
}

fn simulated_lookup(
    key: u64,
    latency: Duration,
    failure_rate: f64,
) -> impl Future<Output = Result<u64, String>> + Send + 'static {
    let fails = rand::rng().random_bool(failure_rate.clamp(0.0, 1.0));
    async move {
        tokio::time::sleep(latency).await;
        match fails {
            true => Err(format!("lookup of {key} failed")),
            false => Ok(key),
        }
    }
}

/// Performs a single request of the workload.
///
/// Failed lookups are part of the workload and not reported.
pub async fn process_payload(workload: &PreparedWorkload) -> Result<(), CacheError<String>> {
    let (key, refresh) = {
        let mut rng = rand::rng();
        let key = rng.random_range(0..workload.keys);
        (key, rng.random_bool(workload.refresh_rate.clamp(0.0, 1.0)))
    };

    let result = match (&workload.cache, refresh) {
        (PreparedCache::Plain(cache), true) => cache.refresh(key).await,
        (PreparedCache::Plain(cache), false) => cache.get(key).await.map(drop),
        (PreparedCache::Scoped(cache), true) => cache.refresh(key).await,
        (PreparedCache::Scoped(cache), false) => {
            let scope = Scope::new();
            let result = cache.get(key, &scope).await.map(drop);
            if let Err(error) = scope.close() {
                eprintln!("failed to release resource: {error:#}");
            }
            result
        }
    };

    match result {
        Err(CacheError::Cancelled) => Err(CacheError::Cancelled),
        _ => Ok(()),
    }
}
