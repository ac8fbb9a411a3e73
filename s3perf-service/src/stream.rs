//! Payload stream type and test utilities.

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;

/// Type alias for data streams returned by [`get_object`](crate::StorageService::get_object).
pub type PayloadStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Creates a [`PayloadStream`] yielding the given bytes as a single chunk.
pub fn once(bytes: Bytes) -> PayloadStream {
    tokio_stream::once(Ok(bytes)).boxed()
}

/// Collects a [`PayloadStream`] into a `Vec<u8>`.
pub async fn read_to_vec(mut stream: PayloadStream) -> std::io::Result<Vec<u8>> {
    use futures_util::TryStreamExt;

    let mut payload = Vec::new();
    while let Some(chunk) = stream.try_next().await? {
        payload.extend_from_slice(&chunk);
    }
    Ok(payload)
}
