//! Plain data types describing stored objects and listing pages.

/// Metadata attached to an object on write and reported back on read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// Size of the object body in bytes, if known.
    pub content_length: Option<u64>,
    /// The MIME type of the object body.
    pub content_type: Option<String>,
}

impl ObjectMetadata {
    /// Creates metadata describing a body of `len` bytes.
    pub fn with_length(len: u64) -> Self {
        Self {
            content_length: Some(len),
            content_type: None,
        }
    }
}

/// One entry of a listing page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectSummary {
    /// The bucket the object lives in.
    pub bucket: String,
    /// The full key of the object.
    pub key: String,
    /// The size reported by the listing, if the backend provides one.
    pub size: Option<u64>,
}

/// A single page returned by [`list_objects`](crate::StorageService::list_objects).
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    /// Objects on this page, in key order.
    pub objects: Vec<ObjectSummary>,
    /// Cursor for the next page, `None` on the final page.
    pub next_continuation_token: Option<String>,
}

impl ListPage {
    /// Returns `true` if this is the last page of the listing.
    pub fn is_last(&self) -> bool {
        self.next_continuation_token.is_none()
    }
}
