use std::{path::Path, sync::Arc};

use blob_store::{BlobError, BlobStore};
use bytes::Bytes;
use data_model::{StateBlob, StateKeys, UpdateId};
use tracing::{debug, info, warn};

use crate::error::{encode, Result, StateError};

/// Moves the canonical state blob between the blob store and a local scratch
/// file, and keeps the per-deploy snapshots.
#[derive(Clone)]
pub struct StateSync {
    blob_store: Arc<dyn BlobStore>,
    keys: StateKeys,
    metrics: Arc<metrics::state_ops::Metrics>,
}

impl StateSync {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        keys: StateKeys,
        metrics: Arc<metrics::state_ops::Metrics>,
    ) -> Self {
        Self {
            blob_store,
            keys,
            metrics,
        }
    }

    /// Copies the remote state to `local_path` and returns the pulled bytes,
    /// `None` when there is no remote state yet.
    pub async fn pull(&self, local_path: &Path) -> Result<Option<Bytes>> {
        let key = self.keys.state();
        let data = match self.blob_store.get(&key).await {
            Ok(data) => data,
            Err(BlobError::NotFound { .. }) => {
                debug!(key = %key, "no remote state");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice::<serde_json::Value>(&data)
            .map_err(|e| StateError::corrupt(key.as_str(), e))?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StateError::io(parent, e))?;
        }
        tokio::fs::write(local_path, &data)
            .await
            .map_err(|e| StateError::io(local_path, e))?;
        info!(key = %key, size_bytes = data.len(), "pulled state");
        Ok(Some(data))
    }

    /// Uploads `state` when given, otherwise the file at `local_path`.
    pub async fn push(&self, local_path: &Path, state: Option<&StateBlob>) -> Result<()> {
        let data = match state {
            Some(state) => encode("state", state)?,
            None => read_state_file(local_path).await?,
        };
        self.upload(data).await
    }

    /// Uploads raw state bytes. Callers validate the content.
    pub async fn upload(&self, data: Bytes) -> Result<()> {
        let _timer = metrics::Timer::start(&self.metrics.state_push);
        let key = self.keys.state();
        let size_bytes = data.len();
        self.blob_store.put(&key, data).await?;
        debug!(key = %key, size_bytes, "pushed state");
        Ok(())
    }

    pub async fn load_remote(&self) -> Result<Option<StateBlob>> {
        let key = self.keys.state();
        let data = match self.blob_store.get(&key).await {
            Ok(data) => data,
            Err(BlobError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = StateBlob::from_slice(&data).map_err(|e| StateError::corrupt(key, e))?;
        Ok(Some(state))
    }

    /// Copies the current remote state to the snapshot of `update_id`.
    /// Returns false when there is no state to snapshot.
    pub async fn create_snapshot(&self, update_id: &UpdateId) -> Result<bool> {
        let data = match self.blob_store.get(&self.keys.state()).await {
            Ok(data) => data,
            Err(BlobError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let key = self.keys.snapshot(update_id);
        match self.blob_store.put_if_absent(&key, data).await {
            Ok(()) => {
                info!(key = %key, "created state snapshot");
                Ok(true)
            }
            Err(BlobError::AlreadyExists { .. }) => {
                warn!(key = %key, "snapshot already exists, leaving it untouched");
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_snapshots(&self) -> Result<Vec<String>> {
        Ok(self.blob_store.list(&self.keys.snapshot_prefix()).await?)
    }

    /// Deletes every snapshot of the (app, env). Returns how many were deleted.
    pub async fn delete_snapshots(&self) -> Result<usize> {
        let keys = self.list_snapshots().await?;
        for key in keys.iter() {
            self.blob_store.delete(key).await?;
        }
        info!(count = keys.len(), "deleted state snapshots");
        Ok(keys.len())
    }
}

/// Reads a local state file and checks it is complete JSON.
pub async fn read_state_file(path: &Path) -> Result<Bytes> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StateError::StateFileMissing(path.to_path_buf()))
        }
        Err(e) => return Err(StateError::io(path, e)),
    };
    serde_json::from_slice::<serde_json::Value>(&data)
        .map_err(|e| StateError::corrupt(path.display().to_string(), e))?;
    Ok(Bytes::from(data))
}
