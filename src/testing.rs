use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use data_model::{
    test_objects::tests::{TEST_APP, TEST_ENV},
    StateBlob,
    StateKeys,
};
use state_store::{
    test_blob_store::TestBlobStore, PartialPushTrigger, Result, StateError, StateStore,
};
use tempfile::TempDir;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    command_run::RunContext,
    engine::{Engine, EngineSummary, Operation, Workspace},
};

/// Stands in for the engine: records the operations it is asked to run,
/// writes a configured state file and optionally fails afterwards.
#[derive(Default)]
pub struct FakeEngine {
    writes: Mutex<Option<StateBlob>>,
    failure: Mutex<Option<String>>,
    operations: Mutex<Vec<Operation>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// State written by every mutating operation.
    pub fn writes(&self, state: StateBlob) {
        *self.writes.lock().unwrap() = Some(state);
    }

    /// Makes every operation fail after writing its state.
    pub fn fails_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.operations.lock().unwrap().clone()
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn run(
        &self,
        operation: Operation,
        workspace: &Workspace,
        trigger: PartialPushTrigger,
    ) -> Result<EngineSummary> {
        self.operations.lock().unwrap().push(operation);
        let writes = self.writes.lock().unwrap().clone();
        let mut progress_lines = 0;
        if let (Some(state), true) = (writes, operation != Operation::Preview) {
            let path = workspace.state_path();
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StateError::io(parent, e))?;
            }
            let data = state
                .to_vec_pretty()
                .map_err(|e| StateError::corrupt("fake engine state", e))?;
            tokio::fs::write(&path, data)
                .await
                .map_err(|e| StateError::io(&path, e))?;
            trigger.trigger();
            progress_lines += 1;
        }
        let failure = self.failure.lock().unwrap().clone();
        if let Some(message) = failure {
            return Err(StateError::Engine {
                operation: operation.to_string(),
                message,
            });
        }
        Ok(EngineSummary { progress_lines })
    }
}

pub struct TestContext {
    pub blob_store: Arc<TestBlobStore>,
    pub engine: Arc<FakeEngine>,
    pub ctx: RunContext,
    work_root: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let work_root = tempfile::tempdir().unwrap();
        let blob_store = TestBlobStore::new();
        let engine = FakeEngine::new();
        let ctx = RunContext {
            store: StateStore::new(blob_store.clone(), StateKeys::new(TEST_APP, TEST_ENV)),
            engine: engine.clone(),
            work_root: work_root.path().to_path_buf(),
            partial_push_interval: Duration::from_secs(3600),
            keep_work_dir: false,
            run_id: None,
        };
        Self {
            blob_store,
            engine,
            ctx,
            work_root,
        }
    }

    /// Scratch directories currently present under the work root.
    pub fn work_dirs(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.work_root.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.is_dir())
            .collect()
    }

    pub async fn seed_state(&self, state: &StateBlob) {
        self.ctx
            .store
            .sync()
            .push(self.work_root.path(), Some(state))
            .await
            .unwrap();
    }

    pub async fn remote_state(&self) -> Option<StateBlob> {
        self.ctx.store.sync().load_remote().await.unwrap()
    }

    pub fn state_puts(&self) -> usize {
        self.blob_store.put_count(&self.ctx.store.keys().state())
    }

    pub async fn wait_for_state_puts(&self, expected: usize) {
        for _ in 0..200 {
            if self.state_puts() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} state uploads, saw {}",
            expected,
            self.state_puts()
        );
    }
}
