//! Core storage service and configuration.
//!
//! This module contains [`StorageService`], the handle the benchmark and scanner use for all
//! object store access, along with [`StorageConfig`] for backend initialization.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::backend::{self, Backend, BoxedBackend, GetResponse, S3CompatibleConfig};
use crate::error::Result;
use crate::object::{ListPage, ObjectMetadata};

/// High-level asynchronous service for storing, retrieving and listing objects in one bucket.
///
/// Cloning is cheap; all clones share the same backend and its connection pool.
#[derive(Clone, Debug)]
pub struct StorageService(Arc<StorageServiceInner>);

#[derive(Debug)]
struct StorageServiceInner {
    backend: BoxedBackend,
}

/// Configuration to initialize a [`StorageService`].
#[derive(Debug, Clone)]
pub enum StorageConfig<'a> {
    /// Use a local directory per bucket as the storage backend.
    FileSystem {
        /// The directory containing one subdirectory per bucket.
        path: &'a Path,
        /// The name of the bucket to use.
        bucket: &'a str,
        /// Number of objects per listing page.
        page_size: Option<usize>,
    },
    /// Use an S3-compatible storage backend.
    S3Compatible {
        /// The name of the bucket to use.
        bucket: &'a str,
        /// The region of the bucket.
        region: &'a str,
        /// Optional endpoint URL for S3-compatible services other than AWS.
        endpoint: Option<&'a str>,
        /// Use path-style addressing.
        path_style: bool,
        /// Timeout for individual requests.
        request_timeout: Option<Duration>,
        /// Explicit access key.
        access_key: Option<&'a str>,
        /// Explicit secret key.
        secret_key: Option<&'a str>,
        /// Number of objects per listing page.
        page_size: Option<usize>,
    },
}

impl StorageService {
    /// Creates a new `StorageService` with the specified configuration.
    pub fn new(config: StorageConfig<'_>) -> Result<Self> {
        let backend: BoxedBackend = match config {
            StorageConfig::FileSystem {
                path,
                bucket,
                page_size,
            } => {
                let mut local = backend::LocalFs::new(path, bucket);
                if let Some(page_size) = page_size {
                    local = local.with_page_size(page_size);
                }
                Box::new(local)
            }
            StorageConfig::S3Compatible {
                bucket,
                region,
                endpoint,
                path_style,
                request_timeout,
                access_key,
                secret_key,
                page_size,
            } => Box::new(backend::S3CompatibleBackend::new(S3CompatibleConfig {
                bucket: bucket.to_owned(),
                region: region.to_owned(),
                endpoint: endpoint.map(str::to_owned),
                request_timeout,
                path_style,
                access_key: access_key.map(str::to_owned),
                secret_key: secret_key.map(str::to_owned),
                page_size,
            })?),
        };

        Ok(Self::from_boxed(backend))
    }

    /// Creates a service on top of an already constructed backend.
    ///
    /// This is primarily used by tests together with the in-memory backend.
    pub fn from_backend(backend: impl Backend) -> Self {
        Self::from_boxed(Box::new(backend))
    }

    fn from_boxed(backend: BoxedBackend) -> Self {
        let inner = StorageServiceInner { backend };
        Self(Arc::new(inner))
    }

    /// The bucket this service operates on.
    pub fn bucket(&self) -> &str {
        self.0.backend.bucket()
    }

    /// The type of the underlying backend.
    pub fn backend_name(&self) -> &'static str {
        self.0.backend.name()
    }

    /// Stores or overwrites an object at the given key.
    pub async fn put_object(
        &self,
        key: &str,
        metadata: &ObjectMetadata,
        payload: Bytes,
    ) -> Result<()> {
        let start = Instant::now();
        let size = payload.len() as u64;
        let result = self.0.backend.put_object(key, metadata, payload).await;

        merni::distribution!(
            "put.latency"@s: start.elapsed(),
            "backend_type" => self.backend_name(),
            "result" => outcome(&result)
        );
        if result.is_ok() {
            merni::distribution!(
                "put.size"@b: size,
                "backend_type" => self.backend_name()
            );
        }

        result
    }

    /// Fetches the object stored at the given key.
    ///
    /// Returns `None` if the object does not exist. The latency recorded here covers the time until
    /// the response started, not the time to consume the stream.
    pub async fn get_object(&self, key: &str) -> Result<GetResponse> {
        let start = Instant::now();
        let result = self.0.backend.get_object(key).await;

        merni::distribution!(
            "get.latency.pre-response"@s: start.elapsed(),
            "backend_type" => self.backend_name(),
            "result" => outcome(&result)
        );

        if let Ok(Some((metadata, _stream))) = &result {
            match metadata.content_length {
                Some(size) => merni::distribution!(
                    "get.size"@b: size,
                    "backend_type" => self.backend_name()
                ),
                None => tracing::warn!(backend_type = self.backend_name(), "Missing object size"),
            }
        }

        result
    }

    /// Lists one page of objects below `prefix`.
    pub async fn list_objects(&self, prefix: &str, continuation: Option<&str>) -> Result<ListPage> {
        let start = Instant::now();
        let result = self.0.backend.list_objects(prefix, continuation).await;

        merni::distribution!(
            "list.latency"@s: start.elapsed(),
            "backend_type" => self.backend_name(),
            "result" => outcome(&result)
        );

        result
    }
}

fn outcome<T>(result: &Result<T>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(_) => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::stream::read_to_vec;

    #[tokio::test]
    async fn stores_files_on_filesystem() {
        let tempdir = tempfile::tempdir().unwrap();
        let config = StorageConfig::FileSystem {
            path: tempdir.path(),
            bucket: "bucket",
            page_size: None,
        };
        let service = StorageService::new(config).unwrap();
        assert_eq!(service.bucket(), "bucket");

        service
            .put_object(
                "the_file_key",
                &ObjectMetadata::default(),
                Bytes::from_static(b"oh hai!"),
            )
            .await
            .unwrap();

        let (_metadata, stream) = service.get_object("the_file_key").await.unwrap().unwrap();
        assert_eq!(read_to_vec(stream).await.unwrap(), b"oh hai!");
        assert!(tempdir.path().join("bucket/the_file_key").exists());
    }

    #[tokio::test]
    async fn shares_backend_between_clones() {
        let backend = InMemoryBackend::new("bucket");
        let service = StorageService::from_backend(backend.clone());
        let clone = service.clone();

        clone
            .put_object("key", &ObjectMetadata::default(), Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert_eq!(backend.get_stored("key").as_deref(), Some(&b"x"[..]));
        let page = service.list_objects("", None).await.unwrap();
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].bucket, "bucket");
    }
}
