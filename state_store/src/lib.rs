use std::sync::Arc;

use blob_store::BlobStore;
use data_model::StateKeys;

pub mod error;
pub mod ledger;
pub mod lock;
pub mod partial_push;
pub mod repair;
pub mod sync;
pub mod test_blob_store;

pub use error::{Result, StateError};
pub use ledger::UpdateLedger;
pub use lock::{ForceUnlock, LockManager, FORCE_UNLOCK_ERROR};
pub use partial_push::{
    PartialPushDaemon, PartialPushTrigger, PartialPusher, PushOutcome,
    DEFAULT_PARTIAL_PUSH_INTERVAL,
};
pub use repair::{find_resource, find_resources_by_name, remove_resource, repair};
pub use sync::{read_state_file, StateSync};

/// Everything that reads or writes the remote state of one (app, env),
/// sharing a blob store and a set of metrics.
#[derive(Clone)]
pub struct StateStore {
    keys: StateKeys,
    ledger: UpdateLedger,
    locks: LockManager,
    sync: StateSync,
    metrics: Arc<metrics::state_ops::Metrics>,
}

impl StateStore {
    pub fn new(blob_store: Arc<dyn BlobStore>, keys: StateKeys) -> Self {
        let metrics = Arc::new(metrics::state_ops::Metrics::new());
        let ledger = UpdateLedger::new(blob_store.clone(), keys.clone());
        let locks = LockManager::new(
            blob_store.clone(),
            keys.clone(),
            ledger.clone(),
            metrics.clone(),
        );
        let sync = StateSync::new(blob_store, keys.clone(), metrics.clone());
        Self {
            keys,
            ledger,
            locks,
            sync,
            metrics,
        }
    }

    pub fn keys(&self) -> &StateKeys {
        &self.keys
    }

    pub fn ledger(&self) -> &UpdateLedger {
        &self.ledger
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn sync(&self) -> &StateSync {
        &self.sync
    }

    pub fn metrics(&self) -> Arc<metrics::state_ops::Metrics> {
        self.metrics.clone()
    }
}
