//! Blob store abstraction for Stelvio state.
//!
//! The state layer talks to a [`BlobStore`]: a flat key space of small JSON
//! documents with one atomic primitive, [`BlobStore::put_if_absent`].
//! [`ObjectBlobStore`] implements it over `object_store` and supports S3,
//! the local filesystem and an in-memory backend selected by URL scheme
//! (`s3://`, `file://`, `memory://`).

mod config;
mod error;
mod storage;
mod traits;

pub use config::{default_blob_store_path, BlobStorageConfig};
pub use error::{BlobError, BlobResult};
pub use storage::ObjectBlobStore;
pub use traits::BlobStore;
