//! Blob storage configuration.

use std::env;

use serde::{Deserialize, Serialize};

/// Configuration for blob storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobStorageConfig {
    /// Storage url (e.g., `s3://bucket/prefix`, `file:///path`, `memory:///`).
    #[serde(default = "default_blob_store_path")]
    pub path: String,

    /// AWS region (for S3).
    #[serde(default)]
    pub region: Option<String>,
}

impl BlobStorageConfig {
    pub fn new(path: &str) -> Self {
        BlobStorageConfig {
            path: format!("file://{}", path),
            region: None,
        }
    }

    pub fn in_memory() -> Self {
        BlobStorageConfig {
            path: "memory:///".to_string(),
            region: None,
        }
    }
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        Self {
            path: default_blob_store_path(),
            region: None,
        }
    }
}

/// Default blob store path (local filesystem).
pub fn default_blob_store_path() -> String {
    format!(
        "file://{}",
        env::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join(".stelvio/state")
            .to_str()
            .unwrap_or("./.stelvio/state")
    )
}
