//! Blob store uploads
//!
//! Completed CSV files can be mirrored to object storage. Before a transfer
//! starts, an existing object under the item's key marks the item as already
//! uploaded.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Blob store errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Local filesystem error
    #[error("IO error: {0}")]
    Io(String),

    /// Remote store rejected or failed the request
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result type for blob store operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Object storage capability
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Whether an object exists under `key`
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Upload a local file to `key`
    async fn upload(&self, local_path: &Path, key: &str) -> StorageResult<()>;

    /// Human-readable location for logs (e.g. `s3://bucket`)
    fn describe(&self) -> String;
}

/// `<prefix>/<file name>`, or just the file name without a prefix
pub fn blob_key(prefix: &str, file_name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        file_name.to_string()
    } else {
        format!("{prefix}/{file_name}")
    }
}

/// Mirror directory acting as a blob store
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Store objects below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|part| !part.is_empty() && *part != "." && *part != "..")
            .fold(self.root.clone(), |path, part| path.join(part))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        tokio::fs::try_exists(self.object_path(key))
            .await
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    async fn upload(&self, local_path: &Path, key: &str) -> StorageResult<()> {
        let target = self.object_path(key);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Io(format!("Failed to create directory: {e}")))?;
        }
        let bytes = tokio::fs::copy(local_path, &target)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to copy to {}: {e}", target.display())))?;

        debug!(key = key, bytes = bytes, "Copied to local blob store");
        Ok(())
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

#[cfg(feature = "s3")]
pub use s3::S3BlobStore;

#[cfg(feature = "s3")]
mod s3 {
    use super::{BlobStore, StorageError, StorageResult};
    use async_trait::async_trait;
    use aws_sdk_s3::primitives::ByteStream;
    use aws_sdk_s3::Client;
    use std::path::Path;
    use tracing::info;

    /// Amazon S3 bucket as a blob store
    #[derive(Clone)]
    pub struct S3BlobStore {
        client: Client,
        bucket: String,
    }

    impl S3BlobStore {
        /// Connect using the default AWS credential chain
        pub async fn from_env(bucket: impl Into<String>) -> Self {
            let config = aws_config::load_from_env().await;
            let bucket = bucket.into();
            info!("S3 blob store initialized for bucket: {}", bucket);
            Self {
                client: Client::new(&config),
                bucket,
            }
        }
    }

    #[async_trait]
    impl BlobStore for S3BlobStore {
        async fn exists(&self, key: &str) -> StorageResult<bool> {
            match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(e) => {
                    let service_error = e.into_service_error();
                    if service_error.is_not_found() {
                        Ok(false)
                    } else {
                        Err(StorageError::Backend(format!(
                            "Failed to check S3 object existence: {service_error}"
                        )))
                    }
                }
            }
        }

        async fn upload(&self, local_path: &Path, key: &str) -> StorageResult<()> {
            let body = ByteStream::from_path(local_path)
                .await
                .map_err(|e| StorageError::Io(format!("Failed to open {}: {e}", local_path.display())))?;

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .content_type("text/csv")
                .body(body)
                .send()
                .await
                .map_err(|e| StorageError::Backend(format!("Failed to upload to S3: {e}")))?;

            info!("Successfully uploaded to s3://{}/{}", self.bucket, key);
            Ok(())
        }

        fn describe(&self) -> String {
            format!("s3://{}", self.bucket)
        }
    }
}

/// Upload `local_path` under `key`, logging the destination
pub async fn upload_file(store: &dyn BlobStore, local_path: &Path, key: &str) -> StorageResult<()> {
    info!(
        key = key,
        store = %store.describe(),
        path = %local_path.display(),
        "Uploading output"
    );
    store.upload(local_path, key).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_blob_key() {
        assert_eq!(blob_key("", "a.csv"), "a.csv");
        assert_eq!(blob_key("/cms/datasets/", "a.csv"), "cms/datasets/a.csv");
    }

    #[tokio::test]
    async fn test_local_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("a.csv");
        std::fs::write(&source, "x\n1\n").unwrap();

        let store = LocalBlobStore::new(dir.path().join("mirror"));
        let key = blob_key("cms", "a.csv");
        assert!(!store.exists(&key).await.unwrap());

        upload_file(&store, &source, &key).await.unwrap();
        assert!(store.exists(&key).await.unwrap());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("mirror/cms/a.csv")).unwrap(),
            "x\n1\n"
        );
    }

    #[test]
    fn test_object_path_ignores_traversal() {
        let store = LocalBlobStore::new("/mirror");
        assert_eq!(store.object_path("../etc//x.csv"), PathBuf::from("/mirror/etc/x.csv"));
    }
}
