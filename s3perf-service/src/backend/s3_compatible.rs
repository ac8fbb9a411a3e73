use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};

use super::{Backend, DEFAULT_PAGE_SIZE, GetResponse};
use crate::error::{Error, Result};
use crate::object::{ListPage, ObjectMetadata, ObjectSummary};
use crate::stream;

const NOT_FOUND: u16 = 404;

/// Configuration to construct a [`S3CompatibleBackend`].
#[derive(Clone, Default)]
pub struct S3CompatibleConfig {
    /// The name of the bucket.
    pub bucket: String,
    /// The region the bucket lives in, such as `us-west-2`.
    pub region: String,
    /// Custom endpoint; defaults to the regional AWS endpoint.
    pub endpoint: Option<String>,
    /// Timeout applied to every request.
    pub request_timeout: Option<Duration>,
    /// Use path-style instead of virtual-host-style addressing.
    pub path_style: bool,
    /// Access key; falls back to the environment and instance profile if unset.
    pub access_key: Option<String>,
    /// Secret key; falls back to the environment and instance profile if unset.
    pub secret_key: Option<String>,
    /// Maximum number of keys per listing page.
    pub page_size: Option<usize>,
}

impl fmt::Debug for S3CompatibleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3CompatibleConfig")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("request_timeout", &self.request_timeout)
            .field("path_style", &self.path_style)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

/// A bucket on AWS S3 or any service speaking the S3 protocol.
pub struct S3CompatibleBackend {
    bucket: Box<Bucket>,
    name: String,
    page_size: usize,
}

impl S3CompatibleBackend {
    /// Creates a new S3 compatible backend bound to the given bucket.
    pub fn new(config: S3CompatibleConfig) -> Result<Self> {
        let credentials = Credentials::new(
            config.access_key.as_deref(),
            config.secret_key.as_deref(),
            None,
            None,
            None,
        )
        .map_err(|cause| Error::Generic {
            context: "failed to resolve S3 credentials".to_owned(),
            cause: Box::new(cause),
        })?;

        let region = Region::Custom {
            endpoint: match config.endpoint {
                Some(endpoint) => endpoint,
                None => format!("https://s3.{}.amazonaws.com", config.region),
            },
            region: config.region,
        };

        let mut bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|cause| Error::s3("failed to configure bucket", cause))?;

        if config.path_style {
            bucket = bucket.with_path_style();
        }

        if let Some(request_timeout) = config.request_timeout {
            bucket = bucket
                .with_request_timeout(request_timeout)
                .map_err(|cause| Error::s3("failed to set request timeout", cause))?;
        }

        Ok(Self {
            bucket,
            name: config.bucket,
            page_size: config.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        })
    }
}

impl fmt::Debug for S3CompatibleBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Compatible")
            .field("bucket", &self.name)
            .field("endpoint", &self.bucket.host())
            .finish_non_exhaustive()
    }
}

fn check_status(context: &str, status: u16) -> Result<()> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(Error::Status {
            context: context.to_owned(),
            status,
        })
    }
}

#[async_trait::async_trait]
impl Backend for S3CompatibleBackend {
    fn name(&self) -> &'static str {
        "s3-compatible"
    }

    fn bucket(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(level = "trace", skip_all, fields(key = %key))]
    async fn put_object(&self, key: &str, metadata: &ObjectMetadata, payload: Bytes) -> Result<()> {
        tracing::debug!("Writing to s3_compatible backend");
        let content_type = metadata
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");

        let response = self
            .bucket
            .put_object_with_content_type(key, &payload, content_type)
            .await
            .map_err(|cause| Error::s3("failed to put object", cause))?;

        check_status("failed to put object", response.status_code())
    }

    #[tracing::instrument(level = "trace", skip_all, fields(key = %key))]
    async fn get_object(&self, key: &str) -> Result<GetResponse> {
        tracing::debug!("Reading from s3_compatible backend");

        let response = match self.bucket.get_object(key).await {
            Ok(response) => response,
            Err(S3Error::HttpFailWithBody(NOT_FOUND, _)) => {
                tracing::debug!("Object not found");
                return Ok(None);
            }
            Err(cause) => return Err(Error::s3("failed to get object", cause)),
        };

        if response.status_code() == NOT_FOUND {
            tracing::debug!("Object not found");
            return Ok(None);
        }
        check_status("failed to get object", response.status_code())?;

        let bytes = Bytes::from(response.to_vec());
        let metadata = ObjectMetadata::with_length(bytes.len() as u64);
        Ok(Some((metadata, stream::once(bytes))))
    }

    #[tracing::instrument(level = "trace", skip_all, fields(prefix = %prefix))]
    async fn list_objects(&self, prefix: &str, continuation: Option<&str>) -> Result<ListPage> {
        let (result, status) = self
            .bucket
            .list_page(
                prefix.to_owned(),
                None,
                continuation.map(str::to_owned),
                None,
                Some(self.page_size),
            )
            .await
            .map_err(|cause| Error::s3("failed to list objects", cause))?;
        check_status("failed to list objects", status)?;

        let objects = result
            .contents
            .into_iter()
            .map(|object| ObjectSummary {
                bucket: self.name.clone(),
                key: object.key,
                size: Some(object.size),
            })
            .collect();

        // Some S3 implementations echo a token on the last page; only truncated pages continue.
        let next_continuation_token = match result.is_truncated {
            true => result.next_continuation_token,
            false => None,
        };

        Ok(ListPage {
            objects,
            next_continuation_token,
        })
    }
}
