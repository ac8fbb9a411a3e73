//! Command line entry points of the `benchmark` and `scanner` binaries.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use s3perf_service::StorageService;
use tokio_util::sync::CancellationToken;
use yansi::Paint;

use crate::benchmark::BenchmarkDriver;
use crate::config::Config;
use crate::metrics::{LogReporter, MetricRegistry, MetricsSnapshot, Reporter};
use crate::observability;
use crate::scanner::ScanDriver;

/// Report interval of the benchmark when none is configured.
const BENCHMARK_REPORT_INTERVAL: Duration = Duration::from_secs(60);
/// Report interval of the scanner when none is configured.
const SCANNER_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Writes objects of growing size at growing concurrency, then reads them back.
#[derive(Debug, FromArgs)]
struct BenchmarkArgs {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// concurrency per available CPU (default 10)
    #[argh(option, short = 'm')]
    multiplier: Option<usize>,

    /// number of rounds (default 10)
    #[argh(option, short = 'r')]
    range: Option<usize>,

    /// objects written per size tier (default 100)
    #[argh(option, short = 'w')]
    writes: Option<usize>,

    /// bucket name
    #[argh(option, short = 'b')]
    bucket: Option<String>,

    /// access key
    #[argh(option, short = 'a')]
    access_key: Option<String>,

    /// secret key
    #[argh(option, short = 's')]
    secret_key: Option<String>,
}

impl BenchmarkArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(bucket) = &self.bucket {
            config.bucket = bucket.clone();
        }
        if let Some(multiplier) = self.multiplier {
            config.benchmark.multiplier = multiplier;
        }
        if let Some(rounds) = self.range {
            config.benchmark.rounds = rounds;
        }
        if let Some(writes) = self.writes {
            config.benchmark.writes = writes;
        }
        config.set_credentials(self.access_key.as_deref(), self.secret_key.as_deref());
    }
}

/// Counts the records of all gzip-compressed NDJSON objects below a path.
#[derive(Debug, FromArgs)]
struct ScannerArgs {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// concurrency per available CPU (default 60)
    #[argh(option, short = 'm')]
    multiplier: Option<usize>,

    /// bucket name
    #[argh(option, short = 'b')]
    bucket: Option<String>,

    /// key prefix to scan
    #[argh(option, short = 'p')]
    path: Option<String>,

    /// bucket region (default us-west-2)
    #[argh(option, short = 'r')]
    region: Option<String>,
}

impl ScannerArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(bucket) = &self.bucket {
            config.bucket = bucket.clone();
        }
        if let Some(multiplier) = self.multiplier {
            config.scanner.multiplier = multiplier;
        }
        if let Some(path) = &self.path {
            config.scanner.prefix = path.clone();
        }
        if let Some(region) = &self.region {
            config.set_region(region);
        }
    }
}

/// Bootstraps the runtime and runs the benchmark.
pub fn benchmark() -> Result<()> {
    let args: BenchmarkArgs = argh::from_env();
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    execute(config, "s3benchmark", run_benchmark)
}

/// Bootstraps the runtime and runs the scanner.
pub fn scanner() -> Result<()> {
    let args: ScannerArgs = argh::from_env();
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    execute(config, "s3scanner", run_scanner)
}

fn execute<F, Fut>(config: Config, service: &'static str, run: F) -> Result<()>
where
    F: FnOnce(Config) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("main-rt")
        .enable_all()
        .worker_threads(config.runtime.worker_threads.max(1))
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config.logging);
    tracing::debug!(?config);

    let metrics_guard = observability::init_metrics(&config.metrics, service)?;

    let result = runtime.block_on(run(config));
    if let Err(ref error) = result {
        tracing::error!(error = ?error, "{service} failed");
    }

    // Flush metrics unconditionally before shutdown, even on error.
    runtime.block_on(async {
        if let Some(metrics_guard) = metrics_guard {
            metrics_guard.flush(None).await.ok();
        }
    });

    result
}

/// Cancels `token` on the first Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, waiting for in-flight operations");
            token.cancel();
        }
    });
}

fn report_interval(config: &Config, default: Duration) -> Duration {
    config.metrics.report_interval.unwrap_or(default)
}

async fn run_benchmark(config: Config) -> Result<()> {
    let store = StorageService::new(config.storage_config()?)
        .context("failed to initialize storage")?;

    let registry = Arc::new(MetricRegistry::new());
    let reporter = tokio::spawn(Arc::clone(&registry).run_reporter(
        LogReporter::new("s3benchmark"),
        report_interval(&config, BENCHMARK_REPORT_INTERVAL),
    ));

    let options = config.benchmark.options();
    println!(
        "{} {} rounds of {} tiers with {} writes each against {}",
        "## BENCHMARK".bold(),
        options.rounds.bold(),
        options.tier_count.bold(),
        options.writes.bold(),
        store.bucket().bold().blue(),
    );

    let driver = BenchmarkDriver::new(store, &registry, options);
    cancel_on_interrupt(driver.cancellation_token());
    let result = driver.run().await;

    reporter.abort();
    let snapshot = registry.snapshot();
    LogReporter::new("s3benchmark").report(&snapshot);

    let summary = result?;
    println!();
    println!("{} ({} rounds)", "## TOTALS".bold(), summary.rounds.len());
    print_timers(&snapshot);

    Ok(())
}

async fn run_scanner(config: Config) -> Result<()> {
    let options = config.scanner.options()?;
    let store = StorageService::new(config.storage_config()?)
        .context("failed to initialize storage")?;

    let registry = Arc::new(MetricRegistry::new());
    let reporter = tokio::spawn(Arc::clone(&registry).run_reporter(
        LogReporter::new("s3scanner"),
        report_interval(&config, SCANNER_REPORT_INTERVAL),
    ));

    println!(
        "{} {}/{} with concurrency {}",
        "## SCAN".bold(),
        store.bucket().bold().blue(),
        options.prefix.bold().blue(),
        options.concurrency.bold(),
    );

    let driver = ScanDriver::new(store, &registry, options);
    cancel_on_interrupt(driver.cancellation_token());
    let result = driver.run().await;

    reporter.abort();
    let snapshot = registry.snapshot();
    LogReporter::new("s3scanner").report(&snapshot);

    let summary = result?;
    println!();
    println!("{} {summary}", "## TOTALS".bold());
    print_timers(&snapshot);
    println!("{}", summary.records);

    Ok(())
}

fn print_timers(snapshot: &MetricsSnapshot) {
    for (name, timer) in &snapshot.timers {
        if timer.count == 0 {
            continue;
        }
        println!(
            "{}: {} ops, avg {:.2?}, p50 {:.2?}, p90 {:.2?}, p99 {:.2?}",
            name.bold(),
            timer.count.bold(),
            timer.mean,
            timer.p50,
            timer.p90,
            timer.p99,
        );
    }
}
