use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::ReaderStream;

use super::{Backend, DEFAULT_PAGE_SIZE, GetResponse, paginate};
use crate::error::{Error, Result};
use crate::object::{ListPage, ObjectMetadata};

/// A bucket stored as a directory on the local filesystem.
///
/// Objects live at `<root>/<bucket>/<key>`, where `/` in the key denotes subdirectories.
#[derive(Debug)]
pub struct LocalFs {
    bucket: String,
    path: PathBuf,
    page_size: usize,
}

impl LocalFs {
    /// Creates a backend for `bucket` below the given root directory.
    pub fn new(root: &Path, bucket: &str) -> Self {
        Self {
            bucket: bucket.to_owned(),
            path: root.join(bucket),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Sets the number of objects returned per listing page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let is_plain = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));

        if !is_plain {
            return Err(Error::InvalidKey(key.to_owned()));
        }
        Ok(self.path.join(relative))
    }

    /// Collects all object keys with their sizes, sorted by key.
    async fn walk(&self) -> Result<Vec<(String, u64)>> {
        let mut entries = Vec::new();
        let mut pending = vec![(self.path.clone(), String::new())];

        while let Some((dir, key_prefix)) = pending.pop() {
            let mut read_dir = match tokio::fs::read_dir(&dir).await {
                Ok(read_dir) => read_dir,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };

            while let Some(entry) = read_dir.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = format!("{key_prefix}{name}");
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    pending.push((entry.path(), format!("{key}/")));
                } else if file_type.is_file() {
                    entries.push((key, entry.metadata().await?.len()));
                }
            }
        }

        entries.sort_unstable();
        Ok(entries)
    }
}

#[async_trait::async_trait]
impl Backend for LocalFs {
    fn name(&self) -> &'static str {
        "local-fs"
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[tracing::instrument(level = "trace", skip_all, fields(key = %key))]
    async fn put_object(
        &self,
        key: &str,
        _metadata: &ObjectMetadata,
        payload: Bytes,
    ) -> Result<()> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;

        let mut writer = BufWriter::new(file);
        writer.write_all(&payload).await?;
        writer.flush().await?;
        let file = writer.into_inner();
        file.sync_data().await?;

        Ok(())
    }

    #[tracing::instrument(level = "trace", skip_all, fields(key = %key))]
    async fn get_object(&self, key: &str) -> Result<GetResponse> {
        let path = self.object_path(key)?;
        let file = match OpenOptions::new().read(true).open(path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!("Object not found");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let metadata = ObjectMetadata::with_length(file.metadata().await?.len());
        let stream = ReaderStream::new(file);
        Ok(Some((metadata, stream.boxed())))
    }

    async fn list_objects(&self, prefix: &str, continuation: Option<&str>) -> Result<ListPage> {
        let entries = self.walk().await?;
        let entries = entries.iter().map(|(key, size)| (key.as_str(), *size));

        Ok(paginate(
            &self.bucket,
            entries,
            prefix,
            continuation,
            self.page_size,
        ))
    }
}
