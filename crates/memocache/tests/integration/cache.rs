use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use memocache::{CacheBuilder, CacheError, EntryStats, Fetched, ManualClock};

use crate::{counting_cache, wait_for_calls, watchable_cache};

#[tokio::test]
async fn test_concurrent_gets_share_one_lookup() {
    let (cache, lookup) = watchable_cache::<u32>(10);
    lookup.lock();

    let requests: Vec<_> = (0..10)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(1).await })
        })
        .collect();

    wait_for_calls(&lookup, &1, 1).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(lookup.called_times(&1), 1);

    lookup.unlock();
    let resource = lookup.first_created_resource(&1);
    for request in requests {
        assert_eq!(request.await.unwrap(), Ok(resource.clone()));
    }
    assert_eq!(lookup.called_times(&1), 1);
}

#[tokio::test]
async fn test_least_recently_used_are_evicted() {
    let (cache, calls) = counting_cache(5, None, ManualClock::new(0));

    for key in 1..=10 {
        assert_eq!(cache.get(key).await, Ok(key * 10));
    }

    let mut keys = cache.keys();
    keys.sort();
    assert_eq!(keys, vec![6, 7, 8, 9, 10]);
    assert_eq!(cache.size(), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn test_refreshed_keys_count_against_capacity() {
    let (cache, calls) = counting_cache(2, None, ManualClock::new(0));

    for key in 1..=5 {
        cache.refresh(key).await.unwrap();
        assert!(cache.cache_stats().size <= 2);
    }

    let mut keys = cache.keys();
    keys.sort();
    assert_eq!(keys, vec![4, 5]);
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_capacity_holds_with_lookups_in_flight() {
    let (cache, lookup) = watchable_cache::<u32>(1);
    lookup.lock();

    let requests: Vec<_> = [1, 2]
        .into_iter()
        .map(|key| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(key).await })
        })
        .collect();
    wait_for_calls(&lookup, &1, 1).await;
    wait_for_calls(&lookup, &2, 1).await;

    lookup.unlock();
    for request in requests {
        request.await.unwrap().unwrap();
    }

    assert_eq!(cache.cache_stats().size, 1);
    cache.get(3).await.unwrap();
    assert_eq!(cache.keys(), vec![3]);
}

#[tokio::test]
async fn test_reads_refresh_recency() {
    let (cache, _) = counting_cache(3, None, ManualClock::new(0));

    for key in [1, 2, 3] {
        cache.get(key).await.unwrap();
    }
    cache.get(1).await.unwrap();
    cache.get(4).await.unwrap();

    let mut keys = cache.keys();
    keys.sort();
    assert_eq!(keys, vec![1, 3, 4]);
}

#[tokio::test]
async fn test_entries_expire_after_time_to_live() {
    let clock = ManualClock::new(0);
    let (cache, calls) = counting_cache(10, Some(Duration::from_secs(10)), clock.clone());

    assert_eq!(cache.get(1).await, Ok(10));

    // The entry is still valid at its exact deadline.
    clock.advance(Duration::from_secs(10));
    assert_eq!(cache.get(1).await, Ok(10));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance(Duration::from_millis(1));
    assert_eq!(cache.get_option(1), Ok(None));
    assert!(!cache.contains(&1));
    assert_eq!(cache.get(1).await, Ok(10));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let stats = cache.cache_stats();
    assert_eq!((stats.hits, stats.misses), (1, 3));
}

#[tokio::test]
async fn test_entry_stats() {
    let clock = ManualClock::new(5_000);
    let (cache, _) = counting_cache(10, None, clock.clone());

    assert_eq!(cache.entry_stats(&1), None);
    cache.get(1).await.unwrap();
    clock.advance(Duration::from_secs(1));

    assert_eq!(
        cache.entry_stats(&1),
        Some(EntryStats {
            loaded_at_millis: 5_000
        })
    );
}

#[tokio::test]
async fn test_cache_stats() {
    let (cache, _) = counting_cache(10, None, ManualClock::new(0));

    cache.get(1).await.unwrap();
    cache.get(1).await.unwrap();
    cache.get(0).await.unwrap_err();
    assert_eq!(cache.get_option(2), Ok(None));
    assert_eq!(cache.get_option(1), Ok(Some(10)));
    assert_eq!(cache.get_option_complete(0), None);

    insta::assert_debug_snapshot!(cache.cache_stats(), @r###"
    CacheStats {
        hits: 3,
        misses: 3,
        size: 2,
    }
    "###);
}

#[tokio::test]
async fn test_failures_are_cached() {
    let (cache, calls) = counting_cache(10, None, ManualClock::new(0));

    let expected = Err(CacheError::Lookup("zero is not allowed".to_owned()));
    assert_eq!(cache.get(0).await, expected);
    assert_eq!(cache.get(0).await, expected);
    assert_eq!(cache.get_option(0), Err("zero is not allowed".to_owned()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Failures are held, but are not part of the values.
    assert!(cache.contains(&0));
    assert_eq!(cache.size(), 0);
    assert!(cache.values().is_empty());
}

#[tokio::test]
async fn test_get_either_reports_origin() {
    let (cache, _) = counting_cache(10, None, ManualClock::new(0));

    assert_eq!(cache.get_either(1).await, Ok(Fetched::Computed(10)));
    assert_eq!(cache.get_either(1).await, Ok(Fetched::Cached(10)));
}

#[tokio::test]
async fn test_set_bypasses_lookup() {
    let (cache, calls) = counting_cache(10, None, ManualClock::new(0));

    cache.set(1, 42);
    assert_eq!(cache.get(1).await, Ok(42));
    assert_eq!(cache.entries(), vec![(1, 42)]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalidate() {
    let (cache, calls) = counting_cache(10, None, ManualClock::new(0));

    cache.get(1).await.unwrap();
    cache.invalidate(&1);
    assert!(!cache.contains(&1));
    assert_eq!(cache.get_option(1), Ok(None));

    cache.get(1).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalidate_when() {
    let (cache, _) = counting_cache(10, None, ManualClock::new(0));

    for key in 0..=3 {
        let _ = cache.get(key).await;
    }

    cache.invalidate_when(&2, |value| *value == 20);
    cache.invalidate_when(&3, |value| *value == 0);
    cache.invalidate_when(&0, |_| true);

    assert!(!cache.contains(&2));
    assert!(cache.contains(&3));
    assert!(cache.contains(&0));
}

#[tokio::test]
async fn test_invalidate_all() {
    let (cache, calls) = counting_cache(10, None, ManualClock::new(0));

    for key in 0..5 {
        let _ = cache.get(key).await;
    }
    cache.invalidate_all();
    assert_eq!(cache.cache_stats().size, 0);

    // The access order was reset along with the entries.
    for key in 5..15 {
        cache.get(key).await.unwrap();
    }
    assert_eq!(cache.size(), 10);
    assert_eq!(calls.load(Ordering::SeqCst), 15);
}

#[tokio::test]
async fn test_lookup_cancellation_reaches_waiters() {
    let (cache, lookup) = watchable_cache::<u32>(10);
    lookup.lock();

    let first = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get(1).await }
    });
    wait_for_calls(&lookup, &1, 1).await;

    let second = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get(1).await }
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());
    assert_eq!(second.await.unwrap(), Err(CacheError::Cancelled));
    assert!(!cache.contains(&1));

    lookup.unlock();
    cache.get(1).await.unwrap();
    assert_eq!(lookup.called_times(&1), 2);
}

#[tokio::test]
async fn test_refresh_serves_previous_value() {
    let (cache, lookup) = watchable_cache::<u32>(10);

    let first = cache.get(1).await.unwrap();
    lookup.lock();

    let refresh = tokio::spawn({
        let cache = cache.clone();
        async move { cache.refresh(1).await }
    });
    wait_for_calls(&lookup, &1, 2).await;

    assert_eq!(cache.get(1).await, Ok(first.clone()));
    assert_eq!(cache.get_option(1), Ok(Some(first.clone())));
    assert_eq!(cache.get_option_complete(1), None);
    assert_eq!(cache.size(), 0);
    assert!(cache.keys().is_empty());
    assert_eq!(cache.cache_stats().size, 1);

    lookup.unlock();
    refresh.await.unwrap().unwrap();

    let second = cache.get(1).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(second, lookup.created_resources(&1)[1]);
    assert_eq!(cache.size(), 1);
}

#[tokio::test]
async fn test_refresh_after_failures() {
    crate::test_setup();

    let counter = Arc::new(AtomicU32::new(2));
    let lookup_counter = Arc::clone(&counter);
    let cache = CacheBuilder::new(10)
        .build(move |_: ()| {
            let n = lookup_counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                match n % 3 {
                    0 => Err(format!("failure {n}")),
                    _ => Ok(n),
                }
            }
        })
        .unwrap();

    assert_eq!(cache.get(()).await, Err(CacheError::Lookup("failure 3".into())));
    cache.refresh(()).await.unwrap();
    assert_eq!(cache.get(()).await, Ok(4));

    cache.refresh(()).await.unwrap();
    assert_eq!(
        cache.refresh(()).await,
        Err(CacheError::Lookup("failure 6".into()))
    );
    cache.refresh(()).await.unwrap();
    assert_eq!(cache.get(()).await, Ok(7));
}

#[tokio::test]
async fn test_refresh_expired_entry_recomputes() {
    let clock = ManualClock::new(0);
    let (cache, calls) = counting_cache(10, Some(Duration::from_secs(1)), clock.clone());

    cache.get(1).await.unwrap();
    clock.advance(Duration::from_secs(2));
    cache.refresh(1).await.unwrap();

    assert_eq!(cache.get_option(1), Ok(Some(10)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
