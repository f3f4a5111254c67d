use std::time::Duration;

use memocache::{CacheError, ManualClock, Scope, ScopedCache};
use memocache_test::{ObservableResource, WatchableLookup};

use crate::{test_setup, wait_for_calls, watchable_scoped_cache};

/// Borrows the resource for `key` and gives it back right away.
async fn use_once<K>(cache: &ScopedCache<K, ObservableResource, ()>, key: K) -> ObservableResource
where
    K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
{
    let scope = Scope::new();
    let resource = cache.get(key, &scope).await.unwrap();
    scope.close().unwrap();
    resource
}

#[tokio::test]
async fn test_sequential_use_acquires_once() {
    test_setup();

    let resource = ObservableResource::new();
    let lookup_resource = resource.clone();
    let cache = ScopedCache::new(1, Some(Duration::from_secs(60)), move |_: (), scope: Scope| {
        let resource = lookup_resource.clone();
        async move {
            scope.add_finalizer(resource.acquire());
            Ok::<_, ()>(resource)
        }
    })
    .unwrap();
    resource.assert_not_acquired();

    for _ in 0..3 {
        assert_eq!(use_once(&cache, ()).await, resource);
        resource.assert_acquired_once_and_not_cleaned();
    }

    drop(cache);
    resource.assert_acquired_once_and_cleaned();
}

#[tokio::test]
async fn test_failed_acquisition_is_cached_and_released() {
    test_setup();

    let lookup = WatchableLookup::new();
    let watched = lookup.clone();
    let cache = ScopedCache::new(10, None, move |key: u32, scope: Scope| {
        let call = watched.call(key);
        async move {
            let resource = call.await;
            scope.add_finalizer(resource.acquire());
            Err::<ObservableResource, _>("acquisition failed")
        }
    })
    .unwrap();

    let scope = Scope::new();
    for _ in 0..2 {
        assert_eq!(
            cache.get(1, &scope).await,
            Err(CacheError::Lookup("acquisition failed"))
        );
    }
    scope.close().unwrap();

    assert_eq!(lookup.called_times(&1), 1);
    lookup
        .first_created_resource(&1)
        .assert_acquired_once_and_cleaned();
}

#[tokio::test]
async fn test_concurrent_borrowers_share_resource() {
    let (cache, lookup) = watchable_scoped_cache::<u32>(1, None, ManualClock::new(0));

    let first = Scope::new();
    let second = Scope::new();
    let resource = cache.get(1, &first).await.unwrap();
    assert_eq!(cache.get(1, &second).await, Ok(resource.clone()));
    assert_eq!(lookup.called_times(&1), 1);

    first.close().unwrap();
    second.close().unwrap();
    resource.assert_acquired_once_and_not_cleaned();

    drop(cache);
    resource.assert_acquired_once_and_cleaned();
}

/// Has two borrowers acquire `key` concurrently, while the lookup is held back.
async fn borrow_concurrently(
    cache: &ScopedCache<u32, ObservableResource, ()>,
    lookup: &WatchableLookup<u32>,
    key: u32,
) -> (ObservableResource, Scope, Scope) {
    lookup.lock();
    let first = Scope::new();
    let second = Scope::new();

    let borrows: Vec<_> = [first.clone(), second.clone()]
        .into_iter()
        .map(|scope| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(key, &scope).await })
        })
        .collect();

    wait_for_calls(lookup, &key, 1).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(lookup.called_times(&key), 1);

    lookup.unlock();
    let resource = lookup.first_created_resource(&key);
    for borrow in borrows {
        assert_eq!(borrow.await.unwrap(), Ok(resource.clone()));
    }
    assert_eq!(lookup.called_times(&key), 1);
    resource.assert_acquired_once_and_not_cleaned();

    (resource, first, second)
}

#[tokio::test]
async fn test_concurrent_acquirers_share_one_acquisition() {
    let (cache, lookup) = watchable_scoped_cache::<u32>(10, None, ManualClock::new(0));
    let (resource, first, second) = borrow_concurrently(&cache, &lookup, 1).await;

    cache.invalidate(&1);
    resource.assert_acquired_once_and_not_cleaned();

    first.close().unwrap();
    resource.assert_acquired_once_and_not_cleaned();

    second.close().unwrap();
    resource.assert_acquired_once_and_cleaned();
}

#[tokio::test]
async fn test_eviction_waits_for_all_concurrent_borrowers() {
    let (cache, lookup) = watchable_scoped_cache::<u32>(1, None, ManualClock::new(0));
    let (resource, first, second) = borrow_concurrently(&cache, &lookup, 1).await;

    use_once(&cache, 2).await;
    assert!(!cache.contains(&1));

    second.close().unwrap();
    resource.assert_acquired_once_and_not_cleaned();

    first.close().unwrap();
    resource.assert_acquired_once_and_cleaned();
}

#[tokio::test]
async fn test_borrowers_outlive_cache() {
    let (cache, _) = watchable_scoped_cache::<u32>(1, None, ManualClock::new(0));

    let first = Scope::new();
    let second = Scope::new();
    let resource = cache.get(1, &first).await.unwrap();
    cache.get(1, &second).await.unwrap();

    drop(cache);
    resource.assert_acquired_once_and_not_cleaned();

    first.close().unwrap();
    resource.assert_acquired_once_and_not_cleaned();

    second.close().unwrap();
    resource.assert_acquired_once_and_cleaned();
}

#[tokio::test]
async fn test_eviction_releases_unused_resources() {
    let (cache, lookup) = watchable_scoped_cache::<u32>(5, None, ManualClock::new(0));

    for key in 1..=10 {
        use_once(&cache, key).await;
    }

    assert_eq!(cache.size(), 5);
    for key in 1..=5 {
        lookup.assert_first_n_created_resources_cleaned(&key, 1);
    }
    for key in 6..=10 {
        lookup
            .first_created_resource(&key)
            .assert_acquired_once_and_not_cleaned();
    }
}

#[tokio::test]
async fn test_eviction_waits_for_borrower() {
    let (cache, lookup) = watchable_scoped_cache::<u32>(1, None, ManualClock::new(0));

    let scope = Scope::new();
    let resource = cache.get(1, &scope).await.unwrap();
    use_once(&cache, 2).await;

    assert!(!cache.contains(&1));
    resource.assert_acquired_once_and_not_cleaned();

    scope.close().unwrap();
    resource.assert_acquired_once_and_cleaned();
    lookup
        .first_created_resource(&2)
        .assert_acquired_once_and_not_cleaned();
}

#[tokio::test]
async fn test_refresh_replaces_resource() {
    let (cache, lookup) = watchable_scoped_cache::<u32>(10, None, ManualClock::new(0));

    let first = use_once(&cache, 1).await;
    cache.refresh(1).await.unwrap();

    let created = lookup.created_resources(&1);
    assert_eq!(created.len(), 2);
    first.assert_acquired_once_and_cleaned();
    created[1].assert_acquired_once_and_not_cleaned();
    assert_eq!(use_once(&cache, 1).await, created[1]);
}

#[tokio::test]
async fn test_refresh_keeps_resource_until_replacement_is_ready() {
    let (cache, lookup) = watchable_scoped_cache::<u32>(10, None, ManualClock::new(0));

    let first = use_once(&cache, 1).await;
    lookup.lock();

    let refresh = tokio::spawn({
        let cache = cache.clone();
        async move { cache.refresh(1).await }
    });
    wait_for_calls(&lookup, &1, 2).await;

    // Borrowers during the refresh still receive the current resource.
    let scope = Scope::new();
    assert_eq!(cache.get(1, &scope).await, Ok(first.clone()));
    first.assert_acquired_once_and_not_cleaned();

    lookup.unlock();
    refresh.await.unwrap().unwrap();
    first.assert_acquired_once_and_not_cleaned();

    scope.close().unwrap();
    first.assert_acquired_once_and_cleaned();
    assert_eq!(use_once(&cache, 1).await, lookup.created_resources(&1)[1]);
}

#[tokio::test]
async fn test_refresh_releases_expired_resource_right_away() {
    let clock = ManualClock::new(0);
    let (cache, lookup) =
        watchable_scoped_cache::<u32>(10, Some(Duration::from_secs(10)), clock.clone());

    let first = use_once(&cache, 1).await;
    clock.advance(Duration::from_secs(11));
    lookup.lock();

    let refresh = tokio::spawn({
        let cache = cache.clone();
        async move { cache.refresh(1).await }
    });
    wait_for_calls(&lookup, &1, 2).await;
    first.assert_acquired_once_and_cleaned();

    lookup.unlock();
    refresh.await.unwrap().unwrap();
    lookup.created_resources(&1)[1].assert_acquired_once_and_not_cleaned();
}

#[tokio::test]
async fn test_refresh_waits_for_borrower_of_expired_resource() {
    let clock = ManualClock::new(0);
    let (cache, _) =
        watchable_scoped_cache::<u32>(10, Some(Duration::from_secs(10)), clock.clone());

    let scope = Scope::new();
    let first = cache.get(1, &scope).await.unwrap();
    clock.advance(Duration::from_secs(11));

    cache.refresh(1).await.unwrap();
    first.assert_acquired_once_and_not_cleaned();

    scope.close().unwrap();
    first.assert_acquired_once_and_cleaned();
}

#[tokio::test]
async fn test_refresh_acquires_missing_resources() {
    let (cache, lookup) = watchable_scoped_cache::<u32>(100, None, ManualClock::new(0));

    for key in 1..=100 {
        cache.refresh(key).await.unwrap();
    }

    assert_eq!(cache.size(), 100);
    for key in 1..=100 {
        assert_eq!(lookup.called_times(&key), 1);
        lookup
            .first_created_resource(&key)
            .assert_acquired_once_and_not_cleaned();
    }
}

#[tokio::test]
async fn test_expired_resource_is_released_on_read() {
    let clock = ManualClock::new(0);
    let (cache, lookup) =
        watchable_scoped_cache::<u32>(10, Some(Duration::from_secs(10)), clock.clone());

    let first = use_once(&cache, 1).await;
    clock.advance(Duration::from_secs(11));

    let second = use_once(&cache, 1).await;
    assert_ne!(first, second);
    assert_eq!(lookup.called_times(&1), 2);
    first.assert_acquired_once_and_cleaned();
    second.assert_acquired_once_and_not_cleaned();
}

#[tokio::test]
async fn test_get_option_never_waits() {
    let (cache, lookup) = watchable_scoped_cache::<u32>(10, None, ManualClock::new(0));
    let scope = Scope::new();

    assert_eq!(cache.get_option(1, &scope), Ok(None));
    assert_eq!(lookup.called_times(&1), 0);

    lookup.lock();
    let get = tokio::spawn({
        let cache = cache.clone();
        async move { use_once(&cache, 1).await }
    });
    wait_for_calls(&lookup, &1, 1).await;

    assert_eq!(cache.get_option(1, &scope), Ok(None));
    assert_eq!(cache.get_option_complete(1, &scope), None);

    lookup.unlock();
    let resource = get.await.unwrap();
    assert_eq!(cache.get_option_complete(1, &scope), Some(resource.clone()));

    // The borrow made through `get_option_complete` keeps the resource alive.
    cache.invalidate(&1);
    resource.assert_acquired_once_and_not_cleaned();
    scope.close().unwrap();
    resource.assert_acquired_once_and_cleaned();
}

#[tokio::test]
async fn test_invalidate_all_releases_unused_resources() {
    let (cache, lookup) = watchable_scoped_cache::<u32>(10, None, ManualClock::new(0));

    let scope = Scope::new();
    let borrowed = cache.get(1, &scope).await.unwrap();
    use_once(&cache, 2).await;

    cache.invalidate_all();
    assert_eq!(cache.cache_stats().size, 0);
    lookup.assert_all_cleaned_for_key(&2);
    borrowed.assert_acquired_once_and_not_cleaned();

    scope.close().unwrap();
    lookup.assert_all_cleaned_for_key(&1);
}

#[tokio::test]
async fn test_borrower_observes_finalizer_failure() {
    test_setup();

    let cache = ScopedCache::new(10, None, |key: u32, scope: Scope| async move {
        scope.add_finalizer(|| anyhow::bail!("connection already closed"));
        Ok::<_, ()>(key)
    })
    .unwrap();

    let scope = Scope::new();
    assert_eq!(cache.get(1, &scope).await, Ok(1));
    cache.invalidate(&1);

    let error = scope.close().unwrap_err();
    assert_eq!(error.to_string(), "connection already closed");
}

#[tokio::test]
async fn test_zero_capacity_is_rejected() {
    test_setup();

    let result = ScopedCache::new(0, None, |key: u32, _: Scope| async move { Ok::<_, ()>(key) });
    assert!(matches!(result, Err(memocache::ConfigError::ZeroCapacity)));
}
