use std::path::PathBuf;

use blob_store::BlobError;
use data_model::UpdateId;

pub type Result<T> = std::result::Result<T, StateError>;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error(
        "state for {app}/{env} is locked by '{command}' since {created} (update {update_id}). \
         If no other operation is running, run `stlv unlock --env {env}`"
    )]
    Locked {
        app: String,
        env: String,
        command: String,
        created: String,
        update_id: UpdateId,
    },

    #[error(
        "could not acquire the lock for {app}/{env}: it kept changing hands. Retry, or run \
         `stlv unlock --env {env}` if no other operation is running"
    )]
    LockContention { app: String, env: String },

    #[error("'{location}' does not contain valid JSON: {source}")]
    Corrupt {
        location: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("resource not found in state: {0}")]
    ResourceNotFound(String),

    #[error(
        "'{name}' matches {} resources, pass one of these URNs instead: {}",
        candidates.len(),
        candidates.join(", ")
    )]
    AmbiguousResource {
        name: String,
        candidates: Vec<String>,
    },

    #[error("local state file not found: {}", .0.display())]
    StateFileMissing(PathBuf),

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("engine {operation} failed: {message}")]
    Engine { operation: String, message: String },

    #[error(transparent)]
    Blob(#[from] BlobError),
}

impl StateError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(location: impl Into<String>, source: serde_json::Error) -> Self {
        StateError::Corrupt {
            location: location.into(),
            source,
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(
            self,
            StateError::Locked { .. } | StateError::LockContention { .. }
        )
    }
}

pub(crate) fn encode<T: serde::Serialize>(what: &'static str, value: &T) -> Result<bytes::Bytes> {
    serde_json::to_vec_pretty(value)
        .map(bytes::Bytes::from)
        .map_err(|source| StateError::Encode { what, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locked_message_has_remediation() {
        let err = StateError::Locked {
            app: "shop".to_string(),
            env: "dev".to_string(),
            command: "deploy".to_string(),
            created: "2024-01-01T00:00:00Z".to_string(),
            update_id: UpdateId::from("u1"),
        };
        let message = err.to_string();
        assert!(message.contains("locked by 'deploy'"));
        assert!(message.contains("since 2024-01-01T00:00:00Z"));
        assert!(message.contains("update u1"));
        assert!(message.contains("stlv unlock --env dev"));
        assert!(err.is_locked());
    }

    #[test]
    fn test_ambiguous_resource_lists_candidates() {
        let err = StateError::AmbiguousResource {
            name: "assets".to_string(),
            candidates: vec!["urn:a::assets".to_string(), "urn:b::assets".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "'assets' matches 2 resources, pass one of these URNs instead: urn:a::assets, \
             urn:b::assets"
        );
    }

    #[test]
    fn test_blob_errors_convert() {
        let err: StateError = BlobError::NotFound {
            key: "state/shop/dev.json".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "blob not found: state/shop/dev.json");
        assert!(!err.is_locked());
    }
}
