//! Filesystem-backed blob store.
//!
//! Directory layout:
//! ```text
//! blobs_dir/
//!   3f2a...e9        # raw bytes
//!   3f2a...e9.json   # BlobMetadata
//! ```
//!
//! Both files are written to a temp file first and renamed into place, so a
//! crash never leaves a truncated blob behind.

use crate::ContextError;
use crate::blob::{BlobFuture, BlobMetadata, BlobStore, StoredBlob, content_address};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    /// Create a store, ensuring the directory exists.
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn data_path(&self, uri: &str) -> PathBuf {
        self.dir.join(uri)
    }

    fn meta_path(&self, uri: &str) -> PathBuf {
        self.dir.join(format!("{uri}.json"))
    }

    /// URIs are SHA-256 hex digests; anything else never reaches the filesystem.
    fn check_uri(uri: &str) -> Result<(), ContextError> {
        if uri.len() == 64 && uri.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(())
        } else {
            Err(ContextError::Blob(format!("invalid blob uri: {uri}")))
        }
    }
}

/// Atomic write: write to a temp file, then rename into place.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ContextError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

impl BlobStore for FsBlobStore {
    fn store(&self, data: Vec<u8>, metadata: BlobMetadata) -> BlobFuture<'_, String> {
        Box::pin(async move {
            let uri = content_address(&data);
            let data_path = self.data_path(&uri);
            if !fs::try_exists(&data_path).await? {
                write_atomic(&data_path, &data).await?;
            }
            let meta = serde_json::to_vec_pretty(&metadata)?;
            write_atomic(&self.meta_path(&uri), &meta).await?;
            debug!(uri = %uri, bytes = data.len(), "Stored blob");
            Ok(uri)
        })
    }

    fn retrieve<'a>(&'a self, uri: &'a str) -> BlobFuture<'a, StoredBlob> {
        Box::pin(async move {
            Self::check_uri(uri)?;
            let data = fs::read(self.data_path(uri))
                .await
                .map_err(|e| ContextError::Blob(format!("failed to read blob {uri}: {e}")))?;
            let meta = fs::read(self.meta_path(uri))
                .await
                .map_err(|e| ContextError::Blob(format!("failed to read metadata for {uri}: {e}")))?;
            let metadata: BlobMetadata = serde_json::from_slice(&meta)?;
            Ok(StoredBlob { data, metadata })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobSource;

    #[tokio::test]
    async fn store_and_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().join("blobs")).unwrap();
        let meta = BlobMetadata::new("image/png", BlobSource::User).with_original_name("a.png");

        let uri = store.store(vec![9; 2048], meta.clone()).await.unwrap();
        let blob = store.retrieve(&uri).await.unwrap();
        assert_eq!(blob.data.len(), 2048);
        assert_eq!(blob.metadata, meta);
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        let uri = store
            .store(b"hello".to_vec(), BlobMetadata::new("text/plain", BlobSource::Tool))
            .await
            .unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&uri));
        assert!(!names.iter().any(|n| n.ends_with(".tmp")));
    }

    #[tokio::test]
    async fn rejects_path_like_uris() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        let err = store.retrieve("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, ContextError::Blob(_)));
    }
}
