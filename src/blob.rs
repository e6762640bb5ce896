//! Blob store contract and the in-memory implementation.
//!
//! Uploaded chunk bytes live here under `uploads/{parent_id}/chunk.{index}.{ext}` keys.
//! As with the key-value store, the pipeline only sees the contract.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Metadata returned by [`BlobStore::head`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobMeta {
    pub size: u64,
}

/// Contract for the shared object store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>, content_type: &str)
    -> Result<()>;

    /// Fetch the full object. Chunks are bounded by the chunk-size limit, so whole-object
    /// reads are fine here.
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    async fn head(&self, bucket: &str, key: &str) -> Result<BlobMeta>;
}

/// In-memory [`BlobStore`].
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().expect("blob store poisoned").len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<()> {
        let mut objects = self.objects.lock().expect("blob store poisoned");
        objects.insert((bucket.to_owned(), key.to_owned()), bytes);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let objects = self.objects.lock().expect("blob store poisoned");
        objects
            .get(&(bucket.to_owned(), key.to_owned()))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("object {bucket}/{key}")))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let mut objects = self.objects.lock().expect("blob store poisoned");
        objects.remove(&(bucket.to_owned(), key.to_owned()));
        Ok(())
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<BlobMeta> {
        let objects = self.objects.lock().expect("blob store poisoned");
        objects
            .get(&(bucket.to_owned(), key.to_owned()))
            .map(|bytes| BlobMeta {
                size: bytes.len() as u64,
            })
            .ok_or_else(|| Error::not_found(format!("object {bucket}/{key}")))
    }
}

/// Blob key for one uploaded chunk.
pub fn chunk_object_key(parent_id: uuid::Uuid, chunk_index: u32, extension: &str) -> String {
    format!("uploads/{parent_id}/chunk.{chunk_index}.{extension}")
}
