use std::sync::Arc;

use blob_store::{BlobError, BlobStore};
use data_model::{LockRecord, StateKeys, UpdateId};
use tracing::{debug, info, warn};

use crate::{
    error::{encode, Result, StateError},
    ledger::UpdateLedger,
};

/// Error recorded on the update of a lock removed by `force_unlock`.
pub const FORCE_UNLOCK_ERROR: &str = "Lock was forcefully removed";

// A conflicting lock can vanish between the failed create and the read of
// its content. Retry that window a bounded number of times.
const ACQUIRE_ATTEMPTS: usize = 3;

/// Advisory lock per (app, env). The lock blob is created with a conditional
/// put, so two concurrent acquirers cannot both succeed. Release is not fenced:
/// whoever calls it deletes the lock.
#[derive(Clone)]
pub struct LockManager {
    blob_store: Arc<dyn BlobStore>,
    keys: StateKeys,
    ledger: UpdateLedger,
    metrics: Arc<metrics::state_ops::Metrics>,
}

impl LockManager {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        keys: StateKeys,
        ledger: UpdateLedger,
        metrics: Arc<metrics::state_ops::Metrics>,
    ) -> Self {
        Self {
            blob_store,
            keys,
            ledger,
            metrics,
        }
    }

    /// Acquires the lock under a fresh update id.
    pub async fn acquire(&self, command: &str, run_id: Option<String>) -> Result<UpdateId> {
        let update_id = UpdateId::generate();
        self.acquire_as(&update_id, command, run_id).await?;
        Ok(update_id)
    }

    /// Acquires the lock for `update_id` and opens its update record.
    pub async fn acquire_as(
        &self,
        update_id: &UpdateId,
        command: &str,
        run_id: Option<String>,
    ) -> Result<()> {
        let key = self.keys.lock();
        let lock = LockRecord::new(update_id.clone(), command, run_id.clone());
        let body = encode("lock record", &lock)?;

        for attempt in 1..=ACQUIRE_ATTEMPTS {
            match self.blob_store.put_if_absent(&key, body.clone()).await {
                Ok(()) => {
                    if let Err(err) = self
                        .ledger
                        .record_start(update_id, command, run_id.clone())
                        .await
                    {
                        // don't leave a lock behind that nobody will release
                        self.release().await?;
                        return Err(err);
                    }
                    info!(%update_id, command, "acquired state lock");
                    return Ok(());
                }
                Err(BlobError::AlreadyExists { .. }) => {
                    self.metrics.lock_conflicts.add(1, &[]);
                    match self.read().await? {
                        Some(existing) => {
                            return Err(StateError::Locked {
                                app: self.keys.app.clone(),
                                env: self.keys.env.clone(),
                                command: existing.command,
                                created: existing.created,
                                update_id: existing.update_id,
                            });
                        }
                        None => {
                            debug!(attempt, "conflicting lock disappeared, retrying");
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StateError::LockContention {
            app: self.keys.app.clone(),
            env: self.keys.env.clone(),
        })
    }

    pub async fn release(&self) -> Result<()> {
        self.blob_store.delete(&self.keys.lock()).await?;
        info!(app = %self.keys.app, env = %self.keys.env, "released state lock");
        Ok(())
    }

    /// Reads the current lock, `None` if the (app, env) is unlocked.
    pub async fn read(&self) -> Result<Option<LockRecord>> {
        let key = self.keys.lock();
        let data = match self.blob_store.get(&key).await {
            Ok(data) => data,
            Err(BlobError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let lock = serde_json::from_slice(&data).map_err(|e| StateError::corrupt(key, e))?;
        Ok(Some(lock))
    }

    /// Removes a lock left behind by a crashed run and marks its update as
    /// failed. A lock blob that cannot be parsed is deleted without touching
    /// the ledger.
    pub async fn force_unlock(&self) -> Result<ForceUnlock> {
        let lock = match self.read().await {
            Ok(Some(lock)) => lock,
            Ok(None) => return Ok(ForceUnlock::NotLocked),
            Err(err @ StateError::Corrupt { .. }) => {
                warn!(error = %err, "removing unreadable state lock");
                self.release().await?;
                return Ok(ForceUnlock::RemovedUnreadable);
            }
            Err(err) => return Err(err),
        };
        warn!(
            update_id = %lock.update_id,
            command = %lock.command,
            created = %lock.created,
            "forcefully removing state lock"
        );
        self.ledger
            .record_complete(&lock.update_id, Some(vec![FORCE_UNLOCK_ERROR.to_string()]))
            .await?;
        self.release().await?;
        Ok(ForceUnlock::Removed(lock))
    }
}

/// Outcome of [`LockManager::force_unlock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForceUnlock {
    NotLocked,
    Removed(LockRecord),
    /// The lock blob was not valid JSON, so its update could not be finalized.
    RemovedUnreadable,
}

impl ForceUnlock {
    pub fn removed(&self) -> Option<&LockRecord> {
        match self {
            ForceUnlock::Removed(lock) => Some(lock),
            _ => None,
        }
    }
}
