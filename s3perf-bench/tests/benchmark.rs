use std::time::Duration;

use s3perf_bench::Error;
use s3perf_bench::benchmark::{BenchmarkDriver, BenchmarkOptions};
use s3perf_bench::metrics::MetricRegistry;
use s3perf_service::StorageService;
use s3perf_service::backend::InMemoryBackend;

fn options(concurrency: usize, writes: usize, tiers: usize, step: u64) -> BenchmarkOptions {
    BenchmarkOptions {
        multiplier: concurrency,
        rounds: 1,
        writes,
        concurrency_step: 0,
        tier_count: tiers,
        tier_step: step,
        key_prefix: "bench/".into(),
        parallelism: 1,
    }
}

#[tokio::test]
async fn empty_payloads() {
    s3perf_test::tracing::init();

    let backend = InMemoryBackend::new("bench");
    let registry = MetricRegistry::new();
    let driver = BenchmarkDriver::new(
        StorageService::from_backend(backend.clone()),
        &registry,
        options(4, 8, 1, 0),
    );

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.rounds.len(), 1);

    let round = &summary.rounds[0];
    assert_eq!(round.concurrency, 4);
    assert_eq!(round.tiers.len(), 1);
    assert_eq!(round.tiers[0].writes, 8);
    assert_eq!(round.tiers[0].size, 0);
    assert_eq!(round.read.keys, 8);
    assert_eq!(round.read.failures, 0);
    assert_eq!(round.read.bytes, 0);

    assert_eq!(backend.len(), 8);
    assert_eq!(registry.timer("s3benchmark.put.latency").count(), 8);
    assert_eq!(registry.timer("s3benchmark.get.latency").count(), 8);
    assert_eq!(registry.counter("s3benchmark.get.bytes").get(), 0);
}

#[tokio::test]
async fn reads_back_every_byte() {
    let backend = InMemoryBackend::new("bench");
    let registry = MetricRegistry::new();
    let driver = BenchmarkDriver::new(
        StorageService::from_backend(backend.clone()),
        &registry,
        options(4, 5, 3, 1024),
    );

    let summary = driver.run().await.unwrap();
    let round = &summary.rounds[0];

    let sizes: Vec<_> = round.tiers.iter().map(|tier| tier.size).collect();
    assert_eq!(sizes, [0, 1024, 2048]);

    let expected = 5 * (1024 + 2048);
    assert_eq!(round.read.keys, 15);
    assert_eq!(round.read.bytes, expected);
    assert_eq!(registry.counter("s3benchmark.put.bytes").get(), expected);
    assert_eq!(registry.counter("s3benchmark.get.bytes").get(), expected);
    assert_eq!(registry.gauge("s3benchmark.put.size").get(), 2048);

    assert_eq!(backend.len(), 15);
}

#[tokio::test]
async fn keys_are_prefixed() {
    let backend = InMemoryBackend::new("bench");
    let registry = MetricRegistry::new();
    let driver = BenchmarkDriver::new(
        StorageService::from_backend(backend.clone()),
        &registry,
        options(2, 3, 1, 16),
    );
    driver.run().await.unwrap();

    let store = StorageService::from_backend(backend);
    let page = store.list_objects("bench/", None).await.unwrap();
    assert_eq!(page.objects.len(), 3);
    assert!(page.is_last());
}

#[tokio::test]
async fn concurrency_grows_per_round() {
    let backend = InMemoryBackend::new("bench");
    let registry = MetricRegistry::new();
    let options = BenchmarkOptions {
        rounds: 3,
        concurrency_step: 2,
        ..options(1, 4, 2, 8)
    };
    let driver = BenchmarkDriver::new(StorageService::from_backend(backend.clone()), &registry, options);

    let summary = driver.run().await.unwrap();
    let concurrency: Vec<_> = summary.rounds.iter().map(|r| r.concurrency).collect();
    assert_eq!(concurrency, [1, 3, 5]);

    // Every round writes fresh keys.
    assert_eq!(backend.len(), 3 * 4 * 2);
    assert!(summary.rounds.iter().all(|r| r.read.keys == 8));
    assert_eq!(registry.gauge("s3benchmark.concurrency").get(), 5);
}

#[tokio::test(start_paused = true)]
async fn in_flight_never_exceeds_concurrency() {
    let backend = InMemoryBackend::new("bench").with_latency(Duration::from_millis(5));
    let registry = MetricRegistry::new();
    let driver = BenchmarkDriver::new(
        StorageService::from_backend(backend.clone()),
        &registry,
        options(3, 20, 2, 64),
    );

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.rounds[0].read.keys, 40);

    let peak = backend.peak_in_flight();
    assert!(peak <= 3, "peak {peak} exceeds concurrency");
    assert!(peak > 1, "operations never overlapped");
}

#[tokio::test]
async fn failed_write_is_fatal() {
    let backend = InMemoryBackend::new("bench");
    backend.fail_writes(true);
    let registry = MetricRegistry::new();
    let driver = BenchmarkDriver::new(
        StorageService::from_backend(backend.clone()),
        &registry,
        options(4, 10, 2, 16),
    );

    let error = driver.run().await.unwrap_err();
    let Error::WriteFailed { key, .. } = &error else {
        panic!("expected write failure, got {error:?}");
    };
    assert!(key.starts_with("bench/"));

    assert!(backend.is_empty());
    assert_eq!(registry.timer("s3benchmark.get.latency").count(), 0);
    assert!(driver.cancellation_token().is_cancelled());
}

#[tokio::test]
async fn cancelled_before_start() {
    let backend = InMemoryBackend::new("bench");
    let registry = MetricRegistry::new();
    let driver = BenchmarkDriver::new(
        StorageService::from_backend(backend.clone()),
        &registry,
        options(4, 10, 1, 16),
    );

    driver.cancellation_token().cancel();
    let error = driver.run().await.unwrap_err();
    assert!(matches!(error, Error::Cancelled), "{error:?}");
}

#[tokio::test]
async fn zero_rounds() {
    let registry = MetricRegistry::new();
    let driver = BenchmarkDriver::new(
        StorageService::from_backend(InMemoryBackend::new("bench")),
        &registry,
        BenchmarkOptions {
            rounds: 0,
            ..options(1, 1, 1, 0)
        },
    );

    let summary = driver.run().await.unwrap();
    assert!(summary.rounds.is_empty());
}
