//! The write-then-read benchmark.
//!
//! A benchmark consists of a number of rounds, each at a fixed concurrency level that grows from
//! round to round. Within a round, every payload size tier writes a batch of fresh objects; once
//! all tiers are written, every key of the round is read back. Each phase ends with a full drain
//! of the [`AdmissionGate`], so throughput figures only ever cover settled work.
//!
//! A failed write is fatal: the read phase relies on every key of the round being present. The
//! failing task cancels all other in-flight work, and [`BenchmarkDriver::run`] returns
//! [`Error::WriteFailed`] once the gate is drained.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::TryStreamExt;
use s3perf_service::{ObjectMetadata, StorageService};
use tokio_util::sync::CancellationToken;
use yansi::Paint;

use crate::concurrency::{AdmissionGate, GateError};
use crate::error::{Error, ObjectError, Result};
use crate::metrics::{Counter, Gauge, MetricRegistry, Timer};
use crate::payload::{KeySet, Payload, object_key};

/// Settings of a benchmark run.
#[derive(Clone, Debug)]
pub struct BenchmarkOptions {
    /// Base concurrency per available CPU.
    pub multiplier: usize,
    /// Number of rounds.
    pub rounds: usize,
    /// Number of objects written per tier.
    pub writes: usize,
    /// Concurrency added per round.
    pub concurrency_step: usize,
    /// Number of payload size tiers per round.
    pub tier_count: usize,
    /// Size difference between consecutive tiers, starting at zero bytes.
    pub tier_step: u64,
    /// Prefix for all written keys.
    pub key_prefix: String,
    /// Number of CPUs the concurrency is scaled by.
    pub parallelism: usize,
}

impl Default for BenchmarkOptions {
    fn default() -> Self {
        Self {
            multiplier: 10,
            rounds: 10,
            writes: 100,
            concurrency_step: 5,
            tier_count: 10,
            tier_step: 10 * 1024,
            key_prefix: String::new(),
            parallelism: available_parallelism(),
        }
    }
}

impl BenchmarkOptions {
    /// The concurrency level of the given zero-based round.
    pub fn concurrency(&self, round: usize) -> usize {
        self.parallelism
            .saturating_mul(self.multiplier)
            .saturating_add(round.saturating_mul(self.concurrency_step))
    }

    /// The payload sizes written in every round, in order.
    pub fn tier_sizes(&self) -> Vec<u64> {
        (0..self.tier_count as u64)
            .map(|tier| tier * self.tier_step)
            .collect()
    }
}

/// Returns the number of CPUs available to this process, at least one.
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// Operations per second, or `None` if the elapsed time is below clock resolution.
pub fn rate(count: usize, elapsed: Duration) -> Option<f64> {
    let millis = elapsed.as_millis();
    if millis == 0 {
        return None;
    }
    Some(1000.0 * count as f64 / millis as f64)
}

struct Rate(Option<f64>);

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(rate) => write!(f, "{rate:.2}"),
            None => f.write_str("n/a"),
        }
    }
}

/// Result of writing one payload size tier.
#[derive(Clone, Debug, PartialEq)]
pub struct TierReport {
    /// Concurrency of the round.
    pub concurrency: usize,
    /// Number of objects written.
    pub writes: usize,
    /// Size of each object in bytes.
    pub size: u64,
    /// Time from the first submission until the barrier returned.
    pub elapsed: Duration,
}

impl TierReport {
    /// Writes per second.
    pub fn rate(&self) -> Option<f64> {
        rate(self.writes, self.elapsed)
    }
}

impl fmt::Display for TierReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "concurrency: {} doing {} writes of {} bytes in {} ms: {} w/s",
            self.concurrency,
            self.writes,
            self.size,
            self.elapsed.as_millis(),
            Rate(self.rate()),
        )
    }
}

/// Result of reading back all keys of a round.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadReport {
    /// Concurrency of the round.
    pub concurrency: usize,
    /// Number of keys that were read.
    pub keys: usize,
    /// Number of reads that failed.
    pub failures: usize,
    /// Total bytes received.
    pub bytes: u64,
    /// Time from the first submission until the barrier returned.
    pub elapsed: Duration,
}

impl ReadReport {
    /// Reads per second.
    pub fn rate(&self) -> Option<f64> {
        rate(self.keys, self.elapsed)
    }

    /// Average object size in bytes, or `None` if no keys were read.
    pub fn mean_bytes(&self) -> Option<u64> {
        (self.keys > 0).then(|| self.bytes / self.keys as u64)
    }
}

impl fmt::Display for ReadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mean = self.mean_bytes().unwrap_or_default();
        write!(
            f,
            "concurrency: {} doing {} reads of {} bytes in {} ms: {} r/s",
            self.concurrency,
            self.keys,
            mean,
            self.elapsed.as_millis(),
            Rate(self.rate()),
        )?;
        if self.failures > 0 {
            write!(f, " ({} failures)", self.failures)?;
        }
        Ok(())
    }
}

/// Result of a full round.
#[derive(Clone, Debug, PartialEq)]
pub struct RoundReport {
    /// Zero-based round index.
    pub round: usize,
    /// Concurrency of the round.
    pub concurrency: usize,
    /// One report per size tier, in order.
    pub tiers: Vec<TierReport>,
    /// The read phase.
    pub read: ReadReport,
}

/// Result of a complete benchmark run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BenchmarkSummary {
    /// One report per round, in order.
    pub rounds: Vec<RoundReport>,
}

struct Instruments {
    put_latency: Arc<Timer>,
    get_latency: Arc<Timer>,
    put_bytes: Arc<Counter>,
    get_bytes: Arc<Counter>,
    get_failures: Arc<Counter>,
    concurrency: Arc<Gauge>,
    put_size: Arc<Gauge>,
    in_flight: Arc<Gauge>,
}

impl Instruments {
    fn new(registry: &MetricRegistry) -> Self {
        Self {
            put_latency: registry.timer("s3benchmark.put.latency"),
            get_latency: registry.timer("s3benchmark.get.latency"),
            put_bytes: registry.counter("s3benchmark.put.bytes"),
            get_bytes: registry.counter("s3benchmark.get.bytes"),
            get_failures: registry.counter("s3benchmark.get.failures"),
            concurrency: registry.gauge("s3benchmark.concurrency"),
            put_size: registry.gauge("s3benchmark.put.size"),
            in_flight: registry.gauge("s3benchmark.in_flight"),
        }
    }
}

/// State shared with every spawned task.
struct Shared {
    store: StorageService,
    instruments: Instruments,
    cancel: CancellationToken,
}

/// Holds the first fatal error raised by any task of a phase.
#[derive(Default)]
struct FatalSlot(Mutex<Option<Error>>);

impl FatalSlot {
    fn set(&self, error: Error) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn take(&self) -> Option<Error> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[derive(Default)]
struct ReadTally {
    bytes: AtomicU64,
    failures: AtomicUsize,
}

/// Runs the write-then-read benchmark against a bucket.
pub struct BenchmarkDriver {
    shared: Arc<Shared>,
    options: BenchmarkOptions,
}

impl fmt::Debug for BenchmarkDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BenchmarkDriver")
            .field("store", &self.shared.store)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl BenchmarkDriver {
    /// Creates a driver writing to `store` and recording into `registry`.
    pub fn new(store: StorageService, registry: &MetricRegistry, options: BenchmarkOptions) -> Self {
        let shared = Shared {
            store,
            instruments: Instruments::new(registry),
            cancel: CancellationToken::new(),
        };

        Self {
            shared: Arc::new(shared),
            options,
        }
    }

    /// A token that stops the run when cancelled.
    ///
    /// Pending admissions give up, in-flight operations are abandoned, and [`run`](Self::run)
    /// returns [`Error::Cancelled`] after draining.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Runs all rounds in sequence.
    pub async fn run(&self) -> Result<BenchmarkSummary> {
        let mut summary = BenchmarkSummary::default();
        for round in 0..self.options.rounds {
            summary.rounds.push(self.run_round(round).await?);
        }
        Ok(summary)
    }

    /// Runs a single round: all write tiers followed by the read phase.
    pub async fn run_round(&self, round: usize) -> Result<RoundReport> {
        let concurrency = self.options.concurrency(round);
        let instruments = &self.shared.instruments;
        instruments.concurrency.set(concurrency as i64);
        merni::gauge!("concurrency": concurrency);
        tracing::info!(round, concurrency, "starting round");

        let gate = AdmissionGate::new(concurrency);
        let in_flight = Arc::clone(&instruments.in_flight);
        let emitter = tokio::spawn(gate.clone().run_emitter(move |count| {
            in_flight.set(count as i64);
            merni::gauge!("in_flight": count);
            std::future::ready(())
        }));

        let result = self.run_phases(round, &gate).await;
        emitter.abort();
        result
    }

    async fn run_phases(&self, round: usize, gate: &AdmissionGate) -> Result<RoundReport> {
        let keys = Arc::new(KeySet::new());

        let mut tiers = Vec::with_capacity(self.options.tier_count);
        for size in self.options.tier_sizes() {
            let report = self.write_tier(gate, &keys, size).await?;
            println!("{} {report}", "WRITE:".bold().green());
            tiers.push(report);
        }

        let read = self.read_all(gate, keys.take()).await?;
        println!("{} {read}", "READ: ".bold().green());

        Ok(RoundReport {
            round,
            concurrency: gate.capacity(),
            tiers,
            read,
        })
    }

    async fn write_tier(
        &self,
        gate: &AdmissionGate,
        keys: &Arc<KeySet>,
        size: u64,
    ) -> Result<TierReport> {
        self.shared.instruments.put_size.set(size as i64);
        emit_tier_size(size);

        let payloads: Vec<_> = (0..self.options.writes)
            .map(|_| {
                let key = object_key(&self.options.key_prefix);
                (key, Payload::random(size).into_bytes())
            })
            .collect();

        let fatal = Arc::new(FatalSlot::default());
        let start = Instant::now();

        for (key, payload) in payloads {
            let task = write_object(
                Arc::clone(&self.shared),
                Arc::clone(keys),
                Arc::clone(&fatal),
                key,
                payload,
            );
            match gate.submit_until(&self.shared.cancel, task).await {
                Ok(_) => {}
                Err(GateError::Cancelled) => break,
                Err(err) => return Err(err.into()),
            }
        }

        gate.drain().await?;
        let elapsed = start.elapsed();

        if let Some(error) = fatal.take() {
            return Err(error);
        }
        if self.shared.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let report = TierReport {
            concurrency: gate.capacity(),
            writes: self.options.writes,
            size,
            elapsed,
        };
        tracing::info!(
            concurrency = report.concurrency,
            writes = report.writes,
            size,
            elapsed_ms = elapsed.as_millis() as u64,
            rate = report.rate(),
            "tier written"
        );

        Ok(report)
    }

    async fn read_all(&self, gate: &AdmissionGate, keys: Vec<String>) -> Result<ReadReport> {
        let key_count = keys.len();
        let tally = Arc::new(ReadTally::default());
        let start = Instant::now();

        for key in keys {
            let task = read_object(Arc::clone(&self.shared), Arc::clone(&tally), key);
            match gate.submit_until(&self.shared.cancel, task).await {
                Ok(_) => {}
                Err(GateError::Cancelled) => break,
                Err(err) => return Err(err.into()),
            }
        }

        gate.drain().await?;
        let elapsed = start.elapsed();

        if self.shared.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let report = ReadReport {
            concurrency: gate.capacity(),
            keys: key_count,
            failures: tally.failures.load(Ordering::Relaxed),
            bytes: tally.bytes.load(Ordering::Relaxed),
            elapsed,
        };
        tracing::info!(
            concurrency = report.concurrency,
            keys = report.keys,
            failures = report.failures,
            bytes = report.bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            rate = report.rate(),
            "keys read"
        );

        Ok(report)
    }
}

async fn write_object(
    shared: Arc<Shared>,
    keys: Arc<KeySet>,
    fatal: Arc<FatalSlot>,
    key: String,
    payload: Bytes,
) {
    let len = payload.len() as u64;
    let metadata = ObjectMetadata::with_length(len);
    let instruments = &shared.instruments;

    let span = instruments.put_latency.start();
    let result = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => {
            span.discard();
            return;
        }
        result = shared.store.put_object(&key, &metadata, payload) => result,
    };

    match result {
        Ok(()) => {
            span.stop();
            instruments.put_bytes.inc(len);
            merni::counter!("put.bytes": len);
            keys.insert(key);
        }
        Err(source) => {
            span.discard();
            tracing::error!(
                error = &source as &dyn std::error::Error,
                key = %key,
                "error writing object"
            );
            fatal.set(Error::WriteFailed { key, source });
            shared.cancel.cancel();
        }
    }
}

async fn read_object(shared: Arc<Shared>, tally: Arc<ReadTally>, key: String) {
    let instruments = &shared.instruments;

    let span = instruments.get_latency.start();
    let result = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => {
            span.discard();
            return;
        }
        result = fetch_object(&shared.store, &key) => result,
    };

    match result {
        Ok(len) => {
            span.stop();
            instruments.get_bytes.inc(len);
            merni::counter!("get.bytes": len);
            tally.bytes.fetch_add(len, Ordering::Relaxed);
        }
        Err(err) => {
            span.discard();
            instruments.get_failures.inc(1);
            merni::counter!("get.failures": 1);
            tally.failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                error = &err as &dyn std::error::Error,
                key = %key,
                "error reading object"
            );
        }
    }
}

/// Reads the full body of an object and returns its length.
async fn fetch_object(store: &StorageService, key: &str) -> Result<u64, ObjectError> {
    let (metadata, mut stream) = store.get_object(key).await?.ok_or(ObjectError::NotFound)?;

    let mut len = 0;
    while let Some(chunk) = stream.try_next().await? {
        len += chunk.len() as u64;
    }

    if let Some(expected) = metadata.content_length {
        if expected != len {
            tracing::warn!(key, expected, actual = len, "object length mismatch");
        }
    }

    Ok(len)
}

/// Reports the payload size of the tier being written.
///
/// Kept apart from the `put.size` distribution the storage service emits per put.
fn emit_tier_size(size: u64) {
    merni::gauge!("put.tier_size": size);
}

#[cfg(test)]
mod tests {
    use merni::MetricType;
    use merni::testing::TestDispatcher;

    use super::*;

    #[test]
    fn concurrency_grows_per_round() {
        let options = BenchmarkOptions {
            multiplier: 10,
            concurrency_step: 5,
            parallelism: 4,
            ..Default::default()
        };

        assert_eq!(options.concurrency(0), 40);
        assert_eq!(options.concurrency(1), 45);
        assert_eq!(options.concurrency(9), 85);
    }

    #[test]
    fn concurrency_saturates() {
        let options = BenchmarkOptions {
            multiplier: usize::MAX,
            concurrency_step: usize::MAX,
            parallelism: 2,
            ..Default::default()
        };

        assert_eq!(options.concurrency(0), usize::MAX);
        assert_eq!(options.concurrency(usize::MAX), usize::MAX);
    }

    #[test]
    fn tier_size_has_its_own_metric() {
        let dispatcher = TestDispatcher::new();
        emit_tier_size(10 * 1024);
        let metrics = dispatcher.finish();

        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].ty(), MetricType::Gauge);
        assert_eq!(metrics[0].key(), "put.tier_size");
        assert_eq!(metrics[0].value().get(), 10240.0);
    }

    #[test]
    fn default_tiers_go_up_to_90_kib() {
        let sizes = BenchmarkOptions::default().tier_sizes();
        assert_eq!(sizes.len(), 10);
        assert_eq!(sizes.first(), Some(&0));
        assert_eq!(sizes.last(), Some(&(90 * 1024)));
    }

    #[test]
    fn rate_guards_against_zero_elapsed() {
        assert_eq!(rate(100, Duration::ZERO), None);
        assert_eq!(rate(100, Duration::from_micros(999)), None);
        assert_eq!(rate(100, Duration::from_millis(50)), Some(2000.0));
        assert_eq!(rate(0, Duration::from_millis(50)), Some(0.0));
    }

    #[test]
    fn reports_render_without_rate() {
        let tier = TierReport {
            concurrency: 4,
            writes: 8,
            size: 0,
            elapsed: Duration::ZERO,
        };
        assert_eq!(
            tier.to_string(),
            "concurrency: 4 doing 8 writes of 0 bytes in 0 ms: n/a w/s"
        );

        let read = ReadReport {
            concurrency: 4,
            keys: 0,
            failures: 0,
            bytes: 0,
            elapsed: Duration::from_millis(10),
        };
        assert_eq!(read.mean_bytes(), None);
        assert_eq!(
            read.to_string(),
            "concurrency: 4 doing 0 reads of 0 bytes in 10 ms: 0.00 r/s"
        );
    }

    #[test]
    fn read_report_mean() {
        let read = ReadReport {
            concurrency: 4,
            keys: 4,
            failures: 1,
            bytes: 4096,
            elapsed: Duration::from_millis(2),
        };
        assert_eq!(read.mean_bytes(), Some(1024));
        assert_eq!(
            read.to_string(),
            "concurrency: 4 doing 4 reads of 1024 bytes in 2 ms: 2000.00 r/s (1 failures)"
        );
    }
}
