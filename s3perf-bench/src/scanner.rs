//! The list, fetch and parse pipeline.
//!
//! A single lister task pages through the bucket listing and pushes every object onto a
//! [`WorkQueue`]. Concurrently, the dispatch loop pops items, admits each through the
//! [`AdmissionGate`] and spawns a task that downloads the object, decompresses it and parses every
//! line as JSON. Listing therefore overlaps with processing.
//!
//! The queue yields `None` only after the lister closed it and every buffered item was taken, so
//! the dispatch loop can never stop early while items are still on their way.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_compression::tokio::bufread::GzipDecoder;
use futures_util::TryStreamExt;
use s3perf_service::{ObjectSummary, StorageService};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::benchmark::available_parallelism;
use crate::concurrency::{AdmissionGate, GateError};
use crate::error::{Error, ObjectError, Result};
use crate::metrics::{Counter, Gauge, MetricRegistry, Timer};
use crate::queue::{WorkProducer, work_queue};

/// One object to fetch and parse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    /// The bucket the object was listed in.
    pub bucket: String,
    /// The object key.
    pub key: String,
    /// The size reported by the listing.
    pub known_size: Option<u64>,
}

impl From<ObjectSummary> for WorkItem {
    fn from(summary: ObjectSummary) -> Self {
        Self {
            bucket: summary.bucket,
            key: summary.key,
            known_size: summary.size,
        }
    }
}

/// Settings of a scan.
#[derive(Clone, Debug)]
pub struct ScanOptions {
    /// Only objects whose key starts with this prefix are scanned.
    pub prefix: String,
    /// Maximum number of objects processed at the same time.
    pub concurrency: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            concurrency: available_parallelism() * 60,
        }
    }
}

/// Totals of a completed scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Objects returned by the listing.
    pub objects_listed: u64,
    /// Objects that were read to the end.
    pub objects_scanned: u64,
    /// Objects that could not be fetched or decoded.
    pub objects_failed: u64,
    /// Successfully parsed records.
    pub records: u64,
    /// Lines that were not valid JSON.
    pub parse_failures: u64,
    /// Bytes downloaded.
    pub bytes_compressed: u64,
    /// Bytes after decompression, counting one newline per line.
    pub bytes_uncompressed: u64,
    /// Wall time of the scan.
    pub elapsed: Duration,
}

impl fmt::Display for ScanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scanned {}/{} objects ({} failed) in {} ms: {} records, {} malformed lines, \
             {} bytes compressed, {} bytes uncompressed",
            self.objects_scanned,
            self.objects_listed,
            self.objects_failed,
            self.elapsed.as_millis(),
            self.records,
            self.parse_failures,
            self.bytes_compressed,
            self.bytes_uncompressed,
        )
    }
}

struct Instruments {
    objects: Arc<Counter>,
    list: Arc<Timer>,
    get: Arc<Timer>,
    parsing: Arc<Timer>,
    bytes_compressed: Arc<Counter>,
    bytes_uncompressed: Arc<Counter>,
    records: Arc<Counter>,
    failures: Arc<Counter>,
    parse_failures: Arc<Counter>,
    in_flight: Arc<Gauge>,
}

impl Instruments {
    fn new(registry: &MetricRegistry) -> Self {
        Self {
            objects: registry.counter("s3scanner.objects"),
            list: registry.timer("s3scanner.list"),
            get: registry.timer("s3scanner.get"),
            parsing: registry.timer("s3scanner.parsing"),
            bytes_compressed: registry.counter("s3scanner.bytes.compressed"),
            bytes_uncompressed: registry.counter("s3scanner.bytes.uncompressed"),
            records: registry.counter("s3scanner.records"),
            failures: registry.counter("s3scanner.failures"),
            parse_failures: registry.counter("s3scanner.parse.failures"),
            in_flight: registry.gauge("s3scanner.in_flight"),
        }
    }
}

/// Per-run totals, updated concurrently by all object tasks.
#[derive(Default)]
struct ScanTally {
    objects_scanned: AtomicU64,
    objects_failed: AtomicU64,
    records: AtomicU64,
    parse_failures: AtomicU64,
    bytes_compressed: AtomicU64,
    bytes_uncompressed: AtomicU64,
}

impl ScanTally {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn summary(&self, objects_listed: u64, elapsed: Duration) -> ScanSummary {
        ScanSummary {
            objects_listed,
            objects_scanned: self.objects_scanned.load(Ordering::Relaxed),
            objects_failed: self.objects_failed.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            bytes_compressed: self.bytes_compressed.load(Ordering::Relaxed),
            bytes_uncompressed: self.bytes_uncompressed.load(Ordering::Relaxed),
            elapsed,
        }
    }
}

struct Shared {
    store: StorageService,
    instruments: Instruments,
    cancel: CancellationToken,
}

/// Scans every gzip-compressed NDJSON object under a prefix and counts its records.
pub struct ScanDriver {
    shared: Arc<Shared>,
    options: ScanOptions,
}

impl fmt::Debug for ScanDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanDriver")
            .field("store", &self.shared.store)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ScanDriver {
    /// Creates a driver reading from `store` and recording into `registry`.
    pub fn new(store: StorageService, registry: &MetricRegistry, options: ScanOptions) -> Self {
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

    /// A token that stops the scan when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Runs the scan to completion.
    ///
    /// Every run lists the bucket afresh and reports only its own totals. Failures of individual objects are logged and counted, but do not stop the scan. A failed
    /// listing stops further listing; objects already queued are still processed before
    /// [`Error::ListFailed`] is returned.
    pub async fn run(&self) -> Result<ScanSummary> {
        let start = Instant::now();
        let cancel = &self.shared.cancel;
        let tally = Arc::new(ScanTally::default());

        let (producer, mut queue) = work_queue();
        let lister = tokio::spawn(list_all(
            Arc::clone(&self.shared),
            self.options.prefix.clone(),
            producer,
        ));

        let gate = AdmissionGate::new(self.options.concurrency);
        let in_flight = Arc::clone(&self.shared.instruments.in_flight);
        let emitter = tokio::spawn(gate.clone().run_emitter(move |count| {
            in_flight.set(count as i64);
            merni::gauge!("in_flight": count);
            std::future::ready(())
        }));

        let dispatched = async {
            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    item = queue.pop() => item,
                };
                let Some(item) = item else { break };

                let task = scan_object(Arc::clone(&self.shared), Arc::clone(&tally), item);
                match gate.submit_until(cancel, task).await {
                    Ok(_) => {}
                    Err(GateError::Cancelled) => break,
                    Err(err) => return Err(Error::from(err)),
                }
            }
            Ok(())
        }
        .await;

        // Unblocks the lister if the loop ended before the listing did.
        drop(queue);
        let drained = gate.drain().await;
        emitter.abort();
        dispatched?;
        drained?;

        let listed = lister.await??;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let summary = tally.summary(listed, start.elapsed());
        tracing::info!(
            objects = summary.objects_scanned,
            failed = summary.objects_failed,
            records = summary.records,
            parse_failures = summary.parse_failures,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "scan complete"
        );

        Ok(summary)
    }
}

/// Pages through the listing and feeds every object into the queue.
///
/// Returns the number of listed objects. The queue is closed when this returns, both on success
/// and on failure.
async fn list_all(shared: Arc<Shared>, prefix: String, producer: WorkProducer<WorkItem>) -> Result<u64> {
    let instruments = &shared.instruments;
    let mut continuation: Option<String> = None;
    let mut listed = 0;

    loop {
        let span = instruments.list.start();
        let result = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => {
                span.discard();
                return Err(Error::Cancelled);
            }
            result = shared.store.list_objects(&prefix, continuation.as_deref()) => result,
        };

        let page = match result {
            Ok(page) => {
                span.stop();
                page
            }
            Err(source) => {
                span.discard();
                tracing::error!(
                    error = &source as &dyn std::error::Error,
                    prefix = %prefix,
                    "error listing objects"
                );
                return Err(Error::ListFailed(source));
            }
        };

        let count = page.objects.len() as u64;
        instruments.objects.inc(count);
        merni::counter!("objects": count);
        listed += count;
        tracing::debug!(count, listed, "listed page");

        if producer
            .push_all(page.objects.into_iter().map(WorkItem::from))
            .is_err()
        {
            // The dispatch loop is gone, nobody is waiting for more items.
            return Err(Error::Cancelled);
        }

        match page.next_continuation_token {
            Some(token) => continuation = Some(token),
            None => break,
        }
    }

    println!("Found {listed} objects");
    producer.close();
    Ok(listed)
}

async fn scan_object(shared: Arc<Shared>, tally: Arc<ScanTally>, item: WorkItem) {
    let instruments = &shared.instruments;

    let span = instruments.get.start();
    let result = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => {
            span.discard();
            return;
        }
        result = scan_records(&shared, &tally, &item.key) => result,
    };
    span.stop();

    match result {
        Ok(records) => {
            ScanTally::add(&tally.objects_scanned, 1);
            tracing::debug!(key = %item.key, records, "object scanned");
        }
        Err(err) => {
            ScanTally::add(&tally.objects_failed, 1);
            instruments.failures.inc(1);
            merni::counter!("failures": 1);
            tracing::error!(
                error = &err as &dyn std::error::Error,
                key = %item.key,
                "error reading object"
            );
        }
    }
}

/// Streams one object through gzip and parses it line by line.
///
/// Returns the number of parsed records. Blank lines are skipped, malformed lines are counted and
/// skipped. Records parsed before a download or decoding error stay counted.
async fn scan_records(shared: &Shared, tally: &ScanTally, key: &str) -> Result<u64, ObjectError> {
    let instruments = &shared.instruments;

    let (_, stream) = shared
        .store
        .get_object(key)
        .await?
        .ok_or(ObjectError::NotFound)?;

    let compressed = AtomicU64::new(0);
    let stream = stream.inspect_ok(|chunk| {
        let len = chunk.len() as u64;
        ScanTally::add(&compressed, len);
        instruments.bytes_compressed.inc(len);
        ScanTally::add(&tally.bytes_compressed, len);
    });

    let mut decoder = GzipDecoder::new(StreamReader::new(stream));
    decoder.multiple_members(true);
    let mut lines = BufReader::new(decoder).lines();

    let mut records = 0;
    let mut uncompressed = 0;
    let mut malformed = 0;
    while let Some(line) = lines.next_line().await? {
        let len = line.len() as u64 + 1;
        uncompressed += len;
        instruments.bytes_uncompressed.inc(len);
        ScanTally::add(&tally.bytes_uncompressed, len);

        if line.trim().is_empty() {
            continue;
        }

        let span = instruments.parsing.start();
        match serde_json::from_str::<serde_json::Value>(&line) {
            Ok(_) => {
                span.stop();
                records += 1;
                instruments.records.inc(1);
                ScanTally::add(&tally.records, 1);
            }
            Err(err) => {
                span.discard();
                malformed += 1;
                instruments.parse_failures.inc(1);
                ScanTally::add(&tally.parse_failures, 1);
                tracing::debug!(error = &err as &dyn std::error::Error, key, "skipping malformed line");
            }
        }
    }

    merni::counter!("bytes.compressed": compressed.load(Ordering::Relaxed));
    merni::counter!("records": records);
    merni::counter!("bytes.uncompressed": uncompressed);
    if malformed > 0 {
        merni::counter!("parse.failures": malformed);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use s3perf_service::backend::InMemoryBackend;

    use super::*;

    #[test]
    fn work_item_from_summary() {
        let summary = ObjectSummary {
            bucket: "logs".into(),
            key: "2024/01/01.json.gz".into(),
            size: Some(42),
        };

        let item = WorkItem::from(summary);
        assert_eq!(item.bucket, "logs");
        assert_eq!(item.key, "2024/01/01.json.gz");
        assert_eq!(item.known_size, Some(42));
    }

    #[tokio::test]
    async fn counts_lines_and_bytes() {
        let raw = "{\"a\":1}\n\n[1,2]\nnot json\n\"tail\"";
        let backend = InMemoryBackend::new("logs");
        backend.insert("one.gz", s3perf_test::fixtures::gzip(raw.as_bytes()));
        let registry = MetricRegistry::new();
        let driver = ScanDriver::new(
            StorageService::from_backend(backend),
            &registry,
            ScanOptions::default(),
        );

        let tally = ScanTally::default();
        let records = scan_records(&driver.shared, &tally, "one.gz")
            .await
            .unwrap();
        assert_eq!(records, 3);

        assert_eq!(tally.parse_failures.load(Ordering::Relaxed), 1);
        assert_eq!(
            tally.bytes_uncompressed.load(Ordering::Relaxed),
            raw.len() as u64 + 1
        );
        assert_eq!(registry.counter("s3scanner.records").get(), 3);
        assert_eq!(registry.timer("s3scanner.parsing").count(), 3);
    }

    #[tokio::test]
    async fn missing_object() {
        let registry = MetricRegistry::new();
        let driver = ScanDriver::new(
            StorageService::from_backend(InMemoryBackend::new("logs")),
            &registry,
            ScanOptions::default(),
        );

        let result = scan_records(&driver.shared, &ScanTally::default(), "missing.gz").await;
        assert!(matches!(result, Err(ObjectError::NotFound)));
    }

    #[tokio::test]
    async fn concatenated_gzip_members() {
        let mut body = s3perf_test::fixtures::gzip(b"{\"n\":1}\n").to_vec();
        body.extend_from_slice(&s3perf_test::fixtures::gzip(b"{\"n\":2}\n{\"n\":3}\n"));

        let backend = InMemoryBackend::new("logs");
        backend.insert("multi.gz", body);
        let registry = MetricRegistry::new();
        let driver = ScanDriver::new(
            StorageService::from_backend(backend),
            &registry,
            ScanOptions::default(),
        );

        let records = scan_records(&driver.shared, &ScanTally::default(), "multi.gz")
            .await
            .unwrap();
        assert_eq!(records, 3);
    }

    #[test]
    fn summary_display() {
        let summary = ScanSummary {
            objects_listed: 3,
            objects_scanned: 2,
            objects_failed: 1,
            records: 10,
            parse_failures: 0,
            bytes_compressed: 100,
            bytes_uncompressed: 400,
            elapsed: Duration::from_millis(5),
        };

        assert_eq!(
            summary.to_string(),
            "scanned 2/3 objects (1 failed) in 5 ms: 10 records, 0 malformed lines, \
             100 bytes compressed, 400 bytes uncompressed"
        );
    }
}
