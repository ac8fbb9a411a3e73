//! In-memory backend for tests.
//!
//! This provides a [`Backend`] backed by a `BTreeMap`, removing the need for real buckets or
//! tempdir management in tests. The backend is [`Clone`] so tests can hold a handle for direct
//! inspection while the service owns a boxed copy.
//!
//! Besides storing objects, the backend can inject latency and write failures, and it records the
//! peak number of operations that were running at the same time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use super::{Backend, DEFAULT_PAGE_SIZE, GetResponse, paginate};
use crate::error::{Error, Result};
use crate::object::{ListPage, ObjectMetadata};
use crate::stream;

type Store = BTreeMap<String, (ObjectMetadata, Bytes)>;

/// A bucket held entirely in memory.
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    bucket: String,
    page_size: usize,
    latency: Duration,
    store: Arc<Mutex<Store>>,
    fail_writes: Arc<AtomicBool>,
    list_calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl InMemoryBackend {
    /// Creates an empty bucket with the given name.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            page_size: DEFAULT_PAGE_SIZE,
            latency: Duration::ZERO,
            store: Default::default(),
            fail_writes: Default::default(),
            list_calls: Default::default(),
            in_flight: Default::default(),
            peak_in_flight: Default::default(),
        }
    }

    /// Sets the number of objects returned per listing page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Delays every operation by the given duration.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes all subsequent writes fail with [`Error::WriteRejected`].
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Stores an object directly, bypassing the `Backend` trait.
    pub fn insert(&self, key: impl Into<String>, contents: impl Into<Bytes>) {
        let contents = contents.into();
        let metadata = ObjectMetadata::with_length(contents.len() as u64);
        self.lock().insert(key.into(), (metadata, contents));
    }

    /// Returns a clone of the stored bytes, if present.
    pub fn get_stored(&self, key: &str) -> Option<Bytes> {
        self.lock().get(key).map(|(_, bytes)| bytes.clone())
    }

    /// Returns the number of stored objects.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if the backend has no stored objects.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns how many listing pages have been requested so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::Relaxed)
    }

    /// Returns the highest number of operations that were in progress at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        // The map is never left in an inconsistent state, so a poisoned lock is still usable.
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_io(&self) -> InFlightGuard<'_> {
        let current = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::AcqRel);
        let guard = InFlightGuard(&self.in_flight);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        guard
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait::async_trait]
impl Backend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_object(
        &self,
        key: &str,
        metadata: &ObjectMetadata,
        payload: Bytes,
    ) -> Result<()> {
        let _guard = self.simulate_io().await;
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::WriteRejected(key.to_owned()));
        }

        let mut metadata = metadata.clone();
        metadata.content_length = Some(payload.len() as u64);
        self.lock().insert(key.to_owned(), (metadata, payload));
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<GetResponse> {
        let _guard = self.simulate_io().await;
        let entry = self.lock().get(key).cloned();
        Ok(entry.map(|(metadata, bytes)| (metadata, stream::once(bytes))))
    }

    async fn list_objects(&self, prefix: &str, continuation: Option<&str>) -> Result<ListPage> {
        let _guard = self.simulate_io().await;
        self.list_calls.fetch_add(1, Ordering::Relaxed);

        let store = self.lock();
        let entries = store
            .iter()
            .map(|(key, (_, bytes))| (key.as_str(), bytes.len() as u64));
        Ok(paginate(
            &self.bucket,
            entries,
            prefix,
            continuation,
            self.page_size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::read_to_vec;

    #[tokio::test]
    async fn stores_and_reads_objects() {
        let backend = InMemoryBackend::new("bucket");
        backend
            .put_object("key", &ObjectMetadata::default(), Bytes::from_static(b"oh hai!"))
            .await
            .unwrap();

        let (metadata, stream) = backend.get_object("key").await.unwrap().unwrap();
        assert_eq!(metadata.content_length, Some(7));
        assert_eq!(read_to_vec(stream).await.unwrap(), b"oh hai!");

        assert!(backend.get_object("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lists_in_pages() {
        let backend = InMemoryBackend::new("bucket").with_page_size(2);
        for i in 0..5 {
            backend.insert(format!("prefix/{i}"), "x");
        }
        backend.insert("other", "x");

        let mut token = None;
        let mut seen = Vec::new();
        loop {
            let page = backend
                .list_objects("prefix/", token.as_deref())
                .await
                .unwrap();
            seen.extend(page.objects.into_iter().map(|o| o.key));
            token = page.next_continuation_token;
            if token.is_none() {
                break;
            }
        }

        assert_eq!(seen.len(), 5);
        assert_eq!(backend.list_calls(), 3);
    }

    #[tokio::test]
    async fn rejects_writes_when_failing() {
        let backend = InMemoryBackend::new("bucket");
        backend.fail_writes(true);

        let result = backend
            .put_object("key", &ObjectMetadata::default(), Bytes::new())
            .await;
        assert!(matches!(result, Err(Error::WriteRejected(key)) if key == "key"));
        assert!(backend.is_empty());
    }
}
