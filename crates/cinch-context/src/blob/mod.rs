//! Content-addressed storage for large attachments.
//!
//! Attachments above the offload threshold (and every binary-likely media
//! type) are moved out of message history into a [`BlobStore`] and replaced
//! by an `@blob:<uri>` reference. The [`resolver::BlobResolver`] performs the
//! offload on append and the expansion on read.
//!
//! Two stores ship with the crate:
//!
//! - [`MemoryBlobStore`] — process-local map, for tests and short sessions.
//! - [`fs::FsBlobStore`] — one file per blob plus a JSON metadata sidecar.
//!
//! Both key blobs by the SHA-256 of their bytes, so storing the same payload
//! twice yields the same URI.

pub mod fs;
pub mod resolver;

use crate::ContextError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

/// Boxed future returned by [`BlobStore`] methods.
pub type BlobFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ContextError>> + Send + 'a>>;

/// Who produced an offloaded attachment.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlobSource {
    #[default]
    User,
    Tool,
    System,
}

/// Metadata stored alongside a blob.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlobMetadata {
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(default)]
    pub source: BlobSource,
}

impl BlobMetadata {
    pub fn new(mime_type: impl Into<String>, source: BlobSource) -> Self {
        Self {
            mime_type: mime_type.into(),
            original_name: None,
            source,
        }
    }

    pub fn with_original_name(mut self, name: impl Into<String>) -> Self {
        self.original_name = Some(name.into());
        self
    }
}

/// A retrieved blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredBlob {
    pub data: Vec<u8>,
    pub metadata: BlobMetadata,
}

/// Persistent storage for attachment payloads.
///
/// `store` returns the URI the blob can later be retrieved by. The URI does
/// not carry the `@blob:` prefix; the resolver adds it.
pub trait BlobStore: Send + Sync {
    fn store(&self, data: Vec<u8>, metadata: BlobMetadata) -> BlobFuture<'_, String>;

    fn retrieve<'a>(&'a self, uri: &'a str) -> BlobFuture<'a, StoredBlob>;
}

/// Hex SHA-256 of `data`, used as the blob URI.
pub fn content_address(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// In-process blob store.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, StoredBlob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn store(&self, data: Vec<u8>, metadata: BlobMetadata) -> BlobFuture<'_, String> {
        Box::pin(async move {
            let uri = content_address(&data);
            self.blobs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(uri.clone(), StoredBlob { data, metadata });
            Ok(uri)
        })
    }

    fn retrieve<'a>(&'a self, uri: &'a str) -> BlobFuture<'a, StoredBlob> {
        Box::pin(async move {
            self.blobs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(uri)
                .cloned()
                .ok_or_else(|| ContextError::Blob(format!("blob not found: {uri}")))
        })
    }
}
