use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use memocache::config::CacheConfig;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{PreparedCache, WorkloadsConfig, prepare_workload, process_payload};

pub async fn perform_stresstest(
    cache_config: &CacheConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // initialize workloads
    let workloads = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| prepare_workload(i, cache_config, workload).map(Arc::new))
        .collect::<Result<Vec<_>>>()?;

    // warmup: run each workload once to make sure caches are warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                let _ = process_payload(&workload).await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let workload = Arc::clone(workload);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let task_start = Instant::now();

                        tokio::spawn(async move {
                            if process_payload(&workload).await.is_ok() {
                                let elapsed = task_start.elapsed().as_secs_f64();
                                if let Ok(mut task_durations) = task_durations.lock() {
                                    task_durations.add(elapsed);
                                }
                            }

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = match task_durations.lock() {
                Ok(mut task_durations) => std::mem::take(&mut *task_durations),
                Err(_) => DDSketch::default(),
            };
            task_durations
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, (task, workload)) in finished_tasks.into_iter().zip(&workloads).enumerate() {
        let task_durations = task?;
        let concurrency = workload.concurrency;

        let ops = task_durations.count();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");

        if ops > 0 {
            let seconds = |value: Option<f64>| Duration::from_secs_f64(value.unwrap_or_default());
            let avg = seconds(task_durations.sum().map(|sum| sum / ops as f64));
            let p50 = seconds(task_durations.quantile(0.5)?);
            let p90 = seconds(task_durations.quantile(0.9)?);
            let p99 = seconds(task_durations.quantile(0.99)?);
            println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }

        let stats = match &workload.cache {
            PreparedCache::Plain(cache) => cache.cache_stats(),
            PreparedCache::Scoped(cache) => cache.cache_stats(),
        };
        let lookups = stats.hits + stats.misses;
        let hit_rate = stats.hits as f64 / lookups.max(1) as f64 * 100.0;
        println!(
            "  hits: {}; misses: {}; hit rate: {hit_rate:.1}%; size: {}",
            stats.hits, stats.misses, stats.size
        );
    }

    Ok(())
}
