//! In-process metric registry shared by all tasks of a run.
//!
//! The [`MetricRegistry`] hands out named [`Counter`]s, [`Gauge`]s and [`Timer`]s; asking twice for
//! the same name returns the same instance. All of them can be updated concurrently from any task.
//! Counters and gauges are plain atomics, timers aggregate into a DDSketch so that percentiles can
//! be reported without keeping individual samples.
//!
//! A [`Reporter`] receives periodic [`MetricsSnapshot`]s via [`MetricRegistry::run_reporter`].
//! Remote submission is handled separately through `merni` at the instrumentation sites.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use sketches_ddsketch::DDSketch;

/// A monotonically increasing accumulator.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Adds `n` to the counter.
    pub fn inc(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns the current total.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A value that is overwritten on every update.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    /// Sets the gauge to `value`.
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Returns the last value set.
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A latency distribution.
#[derive(Default)]
pub struct Timer(Mutex<DDSketch>);

impl Timer {
    /// Starts a span which records its duration into this timer when stopped or dropped.
    pub fn start(self: &Arc<Self>) -> TimerSpan {
        TimerSpan {
            timer: Some(Arc::clone(self)),
            start: Instant::now(),
        }
    }

    /// Records a single duration.
    pub fn record(&self, duration: Duration) {
        self.sketch().add(duration.as_secs_f64());
    }

    /// Returns the number of recorded durations.
    pub fn count(&self) -> usize {
        self.sketch().count()
    }

    /// Summarizes the recorded durations.
    pub fn summary(&self) -> TimerSummary {
        let sketch = self.sketch();
        let count = sketch.count();
        if count == 0 {
            return TimerSummary::default();
        }

        let quantile = |q| {
            let secs = sketch.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs.max(0.0))
        };
        let mean = sketch.sum().unwrap_or_default() / count as f64;

        TimerSummary {
            count,
            mean: Duration::from_secs_f64(mean.max(0.0)),
            p50: quantile(0.5),
            p90: quantile(0.9),
            p99: quantile(0.99),
        }
    }

    fn sketch(&self) -> MutexGuard<'_, DDSketch> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("count", &self.count())
            .finish()
    }
}

/// A running measurement of a [`Timer`].
///
/// The span records when [`stop`](Self::stop) is called or when it is dropped, so a span also
/// covers early returns. Use [`discard`](Self::discard) for measurements that should not count.
#[derive(Debug)]
#[must_use = "dropping the span immediately records a zero-length duration"]
pub struct TimerSpan {
    timer: Option<Arc<Timer>>,
    start: Instant,
}

impl TimerSpan {
    /// Records the elapsed time and returns it.
    pub fn stop(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if let Some(timer) = self.timer.take() {
            timer.record(elapsed);
        }
        elapsed
    }

    /// Ends the span without recording anything.
    pub fn discard(mut self) {
        self.timer = None;
    }
}

impl Drop for TimerSpan {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.record(self.start.elapsed());
        }
    }
}

/// Aggregated view of a [`Timer`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TimerSummary {
    /// Number of recorded spans.
    pub count: usize,
    /// Mean duration.
    pub mean: Duration,
    /// Median duration.
    pub p50: Duration,
    /// 90th percentile.
    pub p90: Duration,
    /// 99th percentile.
    pub p99: Duration,
}

/// Point-in-time values of all registered metrics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Counter totals by name.
    pub counters: BTreeMap<String, u64>,
    /// Gauge values by name.
    pub gauges: BTreeMap<String, i64>,
    /// Timer summaries by name.
    pub timers: BTreeMap<String, TimerSummary>,
}

type Family<T> = Mutex<BTreeMap<String, Arc<T>>>;

/// Registry of named metrics.
#[derive(Debug, Default)]
pub struct MetricRegistry {
    counters: Family<Counter>,
    gauges: Family<Gauge>,
    timers: Family<Timer>,
}

fn get_or_create<T: Default>(family: &Family<T>, name: &str) -> Arc<T> {
    let mut family = family.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(metric) = family.get(name) {
        return Arc::clone(metric);
    }
    let metric = Arc::new(T::default());
    family.insert(name.to_owned(), Arc::clone(&metric));
    metric
}

fn collect<T, V>(family: &Family<T>, value: impl Fn(&T) -> V) -> BTreeMap<String, V> {
    family
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(name, metric)| (name.clone(), value(metric)))
        .collect()
}

impl MetricRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counter with the given name, creating it if necessary.
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        get_or_create(&self.counters, name)
    }

    /// Returns the gauge with the given name, creating it if necessary.
    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        get_or_create(&self.gauges, name)
    }

    /// Returns the timer with the given name, creating it if necessary.
    pub fn timer(&self, name: &str) -> Arc<Timer> {
        get_or_create(&self.timers, name)
    }

    /// Captures the current value of every registered metric.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: collect(&self.counters, Counter::get),
            gauges: collect(&self.gauges, Gauge::get),
            timers: collect(&self.timers, Timer::summary),
        }
    }

    /// Hands a snapshot to `reporter` every `interval`, starting one interval from now.
    ///
    /// This future runs forever and is intended to be spawned as a background task.
    pub async fn run_reporter<R: Reporter>(self: Arc<Self>, reporter: R, interval: Duration) {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            ticker.tick().await;
            reporter.report(&self.snapshot());
        }
    }
}

/// Destination for periodic metric snapshots.
pub trait Reporter: Send + Sync + 'static {
    /// Publishes one snapshot.
    fn report(&self, snapshot: &MetricsSnapshot);
}

/// Writes snapshots to the log.
#[derive(Debug, Clone)]
pub struct LogReporter {
    service: &'static str,
}

impl LogReporter {
    /// Creates a reporter tagging every entry with `service`.
    pub fn new(service: &'static str) -> Self {
        Self { service }
    }
}

impl Reporter for LogReporter {
    fn report(&self, snapshot: &MetricsSnapshot) {
        let service = self.service;
        for (name, value) in &snapshot.counters {
            tracing::info!(service, metric = name.as_str(), value, "counter");
        }
        for (name, value) in &snapshot.gauges {
            tracing::info!(service, metric = name.as_str(), value, "gauge");
        }
        for (name, summary) in &snapshot.timers {
            tracing::info!(
                service,
                metric = name.as_str(),
                count = summary.count,
                mean = ?summary.mean,
                p50 = ?summary.p50,
                p90 = ?summary.p90,
                p99 = ?summary.p99,
                "timer"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn same_name_same_metric() {
        let registry = MetricRegistry::new();
        registry.counter("objects").inc(2);
        registry.counter("objects").inc(3);
        assert_eq!(registry.counter("objects").get(), 5);

        registry.gauge("concurrency").set(40);
        assert_eq!(registry.gauge("concurrency").get(), 40);
    }

    #[test]
    fn concurrent_increments_are_order_independent() {
        let registry = Arc::new(MetricRegistry::new());
        let values: Vec<u64> = (1..=100).collect();

        let handles: Vec<_> = (0..8)
            .map(|shift| {
                let registry = Arc::clone(&registry);
                let values = values.clone();
                thread::spawn(move || {
                    let counter = registry.counter("bytes");
                    // Each thread walks the values starting at a different offset.
                    for i in 0..values.len() {
                        counter.inc(values[(i + shift * 13) % values.len()]);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let expected: u64 = values.iter().sum::<u64>() * 8;
        assert_eq!(registry.counter("bytes").get(), expected);
    }

    #[test]
    fn spans_record_on_stop_and_drop() {
        let registry = MetricRegistry::new();
        let timer = registry.timer("latency");

        let span = timer.start();
        span.stop();
        {
            let _span = timer.start();
        }
        timer.start().discard();

        assert_eq!(timer.count(), 2);
    }

    #[test]
    fn timer_summary() {
        let timer = Timer::default();
        assert_eq!(timer.summary(), TimerSummary::default());

        for millis in 1..=100 {
            timer.record(Duration::from_millis(millis));
        }

        let summary = timer.summary();
        assert_eq!(summary.count, 100);
        // DDSketch guarantees a relative error of 1%.
        let p50 = summary.p50.as_secs_f64();
        assert!((0.049..=0.052).contains(&p50), "{p50}");
        assert!(summary.p99 >= summary.p90);
        assert!(summary.p90 >= summary.p50);
    }

    #[test]
    fn snapshot_contains_all_metrics() {
        let registry = MetricRegistry::new();
        registry.counter("a").inc(1);
        registry.gauge("b").set(-2);
        registry.timer("c").record(Duration::from_millis(5));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.counters["a"], 1);
        assert_eq!(snapshot.gauges["b"], -2);
        assert_eq!(snapshot.timers["c"].count, 1);
    }

    #[derive(Clone, Default)]
    struct CollectingReporter(Arc<Mutex<Vec<MetricsSnapshot>>>);

    impl Reporter for CollectingReporter {
        fn report(&self, snapshot: &MetricsSnapshot) {
            self.0.lock().unwrap().push(snapshot.clone());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_runs_on_interval() {
        let registry = Arc::new(MetricRegistry::new());
        registry.counter("objects").inc(7);

        let reporter = CollectingReporter::default();
        let reports = Arc::clone(&reporter.0);
        let interval = Duration::from_secs(5);

        let handle = tokio::spawn(Arc::clone(&registry).run_reporter(reporter, interval));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(reports.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        handle.abort();

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].counters["objects"], 7);
    }
}
