//! Storage backends implementing the [`Backend`] trait.

use std::fmt::Debug;

use bytes::Bytes;

use crate::error::Result;
use crate::object::{ListPage, ObjectMetadata, ObjectSummary};
use crate::stream::PayloadStream;

mod in_memory;
mod local_fs;
mod s3_compatible;

pub use in_memory::InMemoryBackend;
pub use local_fs::LocalFs;
pub use s3_compatible::{S3CompatibleBackend, S3CompatibleConfig};

/// Number of objects per listing page, matching the S3 default.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// A type-erased [`Backend`] instance.
pub type BoxedBackend = Box<dyn Backend>;

/// Response of [`Backend::get_object`]; `None` if the object does not exist.
pub type GetResponse = Option<(ObjectMetadata, PayloadStream)>;

/// A single bucket on some object storage.
#[async_trait::async_trait]
pub trait Backend: Debug + Send + Sync + 'static {
    /// The backend name, used for diagnostics and metric tags.
    fn name(&self) -> &'static str;

    /// The name of the bucket this backend is bound to.
    fn bucket(&self) -> &str;

    /// Stores an object under the given key, overwriting any previous contents.
    async fn put_object(
        &self,
        key: &str,
        metadata: &ObjectMetadata,
        payload: Bytes,
    ) -> Result<()>;

    /// Retrieves the object stored under the given key.
    async fn get_object(&self, key: &str) -> Result<GetResponse>;

    /// Lists one page of objects whose keys start with `prefix`.
    ///
    /// Pass the `next_continuation_token` of the previous page to continue the listing.
    async fn list_objects(&self, prefix: &str, continuation: Option<&str>) -> Result<ListPage>;
}

/// Pages over `(key, size)` entries sorted by key.
///
/// The continuation token is the last key of the previous page, so listing resumes strictly after
/// it. This is only used by backends without native pagination.
pub(crate) fn paginate<'a, I>(
    bucket: &str,
    entries: I,
    prefix: &str,
    continuation: Option<&str>,
    page_size: usize,
) -> ListPage
where
    I: IntoIterator<Item = (&'a str, u64)>,
{
    let mut matching = entries
        .into_iter()
        .filter(|(key, _)| key.starts_with(prefix))
        .filter(|(key, _)| continuation.is_none_or(|after| *key > after))
        .peekable();

    let mut objects = Vec::new();
    while objects.len() < page_size.max(1) {
        let Some((key, size)) = matching.next() else {
            break;
        };
        objects.push(ObjectSummary {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            size: Some(size),
        });
    }

    let next_continuation_token = match matching.peek() {
        Some(_) => objects.last().map(|object| object.key.clone()),
        None => None,
    };

    ListPage {
        objects,
        next_continuation_token,
    }
}
