//! Core blob store trait.

use async_trait::async_trait;
use bytes::Bytes;

use crate::BlobResult;

/// Key/value blob operations used by the state layer.
///
/// Keys are relative, `/`-separated paths such as `state/app/dev.json`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Get the entire blob.
    ///
    /// Returns `BlobError::NotFound` if the blob doesn't exist.
    async fn get(&self, key: &str) -> BlobResult<Bytes>;

    /// Write the blob, replacing any existing content.
    async fn put(&self, key: &str, data: Bytes) -> BlobResult<()>;

    /// Create the blob only if no blob exists at `key`.
    ///
    /// Returns `BlobError::AlreadyExists` when the key is taken. Backends must
    /// implement this atomically; it is the only mutual exclusion primitive
    /// the lock relies on.
    async fn put_if_absent(&self, key: &str, data: Bytes) -> BlobResult<()>;

    /// Delete the blob. Deleting a missing blob succeeds.
    async fn delete(&self, key: &str) -> BlobResult<()>;

    async fn exists(&self, key: &str) -> BlobResult<bool>;

    /// List keys below `prefix`, relative to the store root.
    async fn list(&self, prefix: &str) -> BlobResult<Vec<String>>;
}
