use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use memocache::config::Config;
use memocache::metrics;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

mod logging;
mod stresstest;
mod workloads;

#[cfg(not(target_env = "msvc"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Enable tracing, writing all log events into a sink.
    #[arg(long)]
    tracing: bool,

    /// Enable metrics, sending all of them to a local sink unless a statsd server is configured.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    match execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            memocache::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

fn execute() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config = Config::get(cli.config.as_deref()).context("failed to load configuration")?;
    logging::init_logging(cli.tracing, &config.logging);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )?;
    } else if cli.metrics {
        let udp_sink = runtime.block_on(async { logging::init_metrics(&config.metrics) })?;
        runtime.spawn(udp_sink);
    }

    runtime.block_on(perform_stresstest(&config.cache, workloads, cli.duration))
}
