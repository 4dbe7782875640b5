//! Object store abstraction for blobs, staged uploads, build caches and logs.
//!
//! Committed blobs live at `blobs/<algo>/<2>/<2>/<rest>`, staged uploads at
//! `blob_uploads/<file_id>`, build caches at `caches/<builder_id>`. Backends
//! must supply native multipart assembly; the filesystem driver emulates it
//! with a part directory next to the staging key.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::info;

use crate::digest::{Digest, Hasher};

pub mod s3;

pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found")]
    NotFound,
    #[error("object store i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("object store backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
}

/// Returned by a part upload; the etag must be replayed verbatim into
/// `complete_multipart`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt {
    pub etag: String,
    pub size: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    async fn stat(&self, key: &str) -> Result<ObjectMeta, StorageError>;

    /// Stream an entire object into place, returning its size.
    async fn upload(&self, key: &str, body: ByteStream) -> Result<u64, StorageError>;

    async fn reader(
        &self,
        key: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, StorageError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn create_multipart(&self, key: &str) -> Result<String, StorageError>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: ByteStream,
    ) -> Result<PartReceipt, StorageError>;

    /// Assemble the object at `key` from its parts. Atomic: either the whole
    /// object appears or nothing does.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        etags: &[String],
    ) -> Result<(), StorageError>;

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StorageError>;
}

fn map_io(err: std::io::Error) -> StorageError {
    match err.kind() {
        ErrorKind::NotFound => StorageError::NotFound,
        _ => StorageError::Io(err),
    }
}

#[derive(Debug)]
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn parts_dir(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.parts"))
    }

    async fn ensure_parent(&self, path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Remove empty ancestor directories left behind after a delete so the
    /// blob fan-out does not accumulate dead folders.
    async fn prune_ancestors(&self, path: &Path) {
        let Some(parent) = path.parent() else { return };

        for dir in parent.ancestors().take(3) {
            if dir == self.root {
                break;
            }

            match tokio::fs::remove_dir(dir).await {
                Ok(_) => {
                    info!("Removed empty directory {dir:?}");
                }
                // Not empty or already gone; either way stop climbing
                Err(_) => break,
            }
        }
    }
}

#[async_trait]
impl ObjectStore for FilesystemStore {
    async fn stat(&self, key: &str) -> Result<ObjectMeta, StorageError> {
        let metadata = tokio::fs::metadata(self.full_path(key)).await.map_err(map_io)?;
        Ok(ObjectMeta {
            size: metadata.len(),
        })
    }

    async fn upload(&self, key: &str, mut body: ByteStream) -> Result<u64, StorageError> {
        let path = self.full_path(key);
        self.ensure_parent(&path).await?;

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .await?;

        let mut size = 0;
        while let Some(item) = body.next().await {
            let item = item?;
            file.write_all(&item).await?;
            size += item.len() as u64;
        }

        file.sync_all().await?;

        Ok(size)
    }

    async fn reader(
        &self,
        key: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, StorageError> {
        let file = tokio::fs::File::open(self.full_path(key))
            .await
            .map_err(map_io)?;
        Ok(Box::new(file))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let dest = self.full_path(to);
        self.ensure_parent(&dest).await?;
        tokio::fs::rename(self.full_path(from), dest)
            .await
            .map_err(map_io)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.full_path(key);
        tokio::fs::remove_file(&path).await.map_err(map_io)?;
        self.prune_ancestors(&path).await;
        Ok(())
    }

    async fn create_multipart(&self, key: &str) -> Result<String, StorageError> {
        let dir = self.parts_dir(key);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(uuid::Uuid::new_v4().as_hyphenated().to_string())
    }

    async fn upload_part(
        &self,
        key: &str,
        _upload_id: &str,
        part_number: u32,
        mut body: ByteStream,
    ) -> Result<PartReceipt, StorageError> {
        let path = self.parts_dir(key).join(format!("{part_number:05}"));

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .await
            .map_err(map_io)?;

        let mut hasher = Hasher::new();
        let mut size = 0;

        while let Some(item) = body.next().await {
            let item = item?;
            file.write_all(&item).await?;
            hasher.update(&item);
            size += item.len() as u64;
        }

        file.sync_all().await?;

        Ok(PartReceipt {
            etag: hasher.finish().hash,
            size,
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        _upload_id: &str,
        etags: &[String],
    ) -> Result<(), StorageError> {
        let dir = self.parts_dir(key);
        let dest = self.full_path(key);
        self.ensure_parent(&dest).await?;

        // Assemble into a scratch file first so a crash can never leave a
        // half written object at the final key.
        let scratch = self.full_path(&format!("{key}.assembling"));
        let mut out = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&scratch)
            .await?;

        for (index, etag) in etags.iter().enumerate() {
            let part_number = (index + 1) as u32;
            let path = dir.join(format!("{part_number:05}"));

            let contents = tokio::fs::read(&path).await.map_err(map_io)?;

            let actual = Digest::of_bytes(&contents).hash;
            if &actual != etag {
                return Err(StorageError::Backend(format!(
                    "part {part_number} etag mismatch"
                )));
            }

            out.write_all(&contents).await?;
        }

        out.sync_all().await?;
        tokio::fs::rename(&scratch, &dest).await?;
        tokio::fs::remove_dir_all(&dir).await?;

        Ok(())
    }

    async fn abort_multipart(&self, key: &str, _upload_id: &str) -> Result<(), StorageError> {
        let dir = self.parts_dir(key);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }

        let staged = self.full_path(key);
        if tokio::fs::try_exists(&staged).await? {
            tokio::fs::remove_file(&staged).await?;
        }

        Ok(())
    }
}

/// Adapt a fixed buffer into a [`ByteStream`]; handy for small bodies and
/// tests.
pub fn stream_of(bytes: impl Into<Bytes> + Send + 'static) -> ByteStream {
    futures::stream::once(async move { Ok(bytes.into()) }).boxed()
}
