//! Error types for blob store operations.

/// Result type for blob store operations.
pub type BlobResult<T> = Result<T, BlobError>;

/// Errors that can occur during blob store operations.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// Blob not found at the specified key.
    #[error("blob not found: {key}")]
    NotFound { key: String },

    /// A conditional create found an existing blob.
    #[error("blob already exists: {key}")]
    AlreadyExists { key: String },

    /// Invalid store URL.
    #[error("invalid blob store url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Backend or network failure.
    #[error("blob store error on '{key}': {source}")]
    Backend {
        key: String,
        #[source]
        source: object_store::Error,
    },

    #[error("blob store error: {0}")]
    Other(#[from] anyhow::Error),
}

impl BlobError {
    pub fn from_store(key: &str, err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => BlobError::NotFound {
                key: key.to_string(),
            },
            object_store::Error::AlreadyExists { .. }
            | object_store::Error::Precondition { .. } => BlobError::AlreadyExists {
                key: key.to_string(),
            },
            source => BlobError::Backend {
                key: key.to_string(),
                source,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound { .. })
    }
}

