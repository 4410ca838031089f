use std::sync::Arc;

use blob_store::{BlobError, BlobStore};
use data_model::{StateKeys, UpdateId, UpdateRecord};
use tracing::{info, warn};

use crate::error::{encode, Result, StateError};

/// Per-run audit trail under `update/{app}/{env}/`. Records outlive the lock so
/// history stays readable after a force-unlock.
#[derive(Clone)]
pub struct UpdateLedger {
    blob_store: Arc<dyn BlobStore>,
    keys: StateKeys,
}

impl UpdateLedger {
    pub fn new(blob_store: Arc<dyn BlobStore>, keys: StateKeys) -> Self {
        Self { blob_store, keys }
    }

    pub async fn record_start(
        &self,
        update_id: &UpdateId,
        command: &str,
        run_id: Option<String>,
    ) -> Result<UpdateRecord> {
        let record = UpdateRecord::started(update_id.clone(), command, run_id);
        self.write(&record).await?;
        Ok(record)
    }

    /// Marks the update finished. The stored record is read back so
    /// `time_started` survives. Returns `None` when no record exists.
    pub async fn record_complete(
        &self,
        update_id: &UpdateId,
        errors: Option<Vec<String>>,
    ) -> Result<Option<UpdateRecord>> {
        let Some(mut record) = self.get(update_id).await? else {
            warn!(%update_id, "no update record to complete");
            return Ok(None);
        };
        let errors = errors.filter(|errors| !errors.is_empty());
        record.complete(errors);
        self.write(&record).await?;
        info!(
            %update_id,
            command = %record.command,
            failed = record.failed(),
            "update record completed"
        );
        Ok(Some(record))
    }

    pub async fn get(&self, update_id: &UpdateId) -> Result<Option<UpdateRecord>> {
        let key = self.keys.update(update_id);
        self.read(&key).await
    }

    /// All update records of the (app, env), oldest first.
    pub async fn list(&self) -> Result<Vec<UpdateRecord>> {
        let keys = self.blob_store.list(&self.keys.update_prefix()).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.read(&key).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.time_started.cmp(&b.time_started));
        Ok(records)
    }

    async fn read(&self, key: &str) -> Result<Option<UpdateRecord>> {
        let data = match self.blob_store.get(key).await {
            Ok(data) => data,
            Err(BlobError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = serde_json::from_slice(&data).map_err(|e| StateError::corrupt(key, e))?;
        Ok(Some(record))
    }

    async fn write(&self, record: &UpdateRecord) -> Result<()> {
        let key = self.keys.update(&record.id);
        self.blob_store
            .put(&key, encode("update record", record)?)
            .await?;
        Ok(())
    }
}
