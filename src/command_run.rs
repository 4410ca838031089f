use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use bytes::Bytes;
use blob_store::{BlobStore, ObjectBlobStore};
use data_model::{Command, StateBlob, StateKeys, UpdateId};
use state_store::{
    read_state_file, PartialPushDaemon, PartialPushTrigger, PartialPusher, Result, StateError,
    StateStore,
};
use stelvio_utils::env_flag;
use tempfile::TempDir;
use tracing::{error, info, warn};

use crate::{
    config::StelvioConfig,
    engine::{Engine, PulumiCli, Workspace},
};

/// Set to keep the scratch directory of every run for debugging.
pub const NO_CLEANUP_ENV: &str = "STLV_NO_CLEANUP";

/// Dependencies shared by the runs of one invocation.
#[derive(Clone)]
pub struct RunContext {
    pub store: StateStore,
    pub engine: Arc<dyn Engine>,
    pub work_root: PathBuf,
    pub partial_push_interval: Duration,
    pub keep_work_dir: bool,
    pub run_id: Option<String>,
}

impl RunContext {
    pub fn from_config(config: &StelvioConfig) -> anyhow::Result<Self> {
        let blob_store: Arc<dyn BlobStore> = Arc::new(
            ObjectBlobStore::new(config.blob_storage.clone())
                .context("initializing blob store")?,
        );
        let store = StateStore::new(blob_store, StateKeys::new(&config.app, &config.env));
        Ok(Self {
            store,
            engine: Arc::new(PulumiCli::new(&config.pulumi)),
            work_root: config.work_dir.clone().unwrap_or_else(std::env::temp_dir),
            partial_push_interval: config.partial_push_interval(),
            keep_work_dir: config.keep_work_dir,
            run_id: config.run_id.clone(),
        })
    }
}

/// One command executed against the state of an (app, env).
///
/// Opening a run takes the lock (for mutating commands) and pulls the remote
/// state into a fresh scratch directory. [`CommandRun::close`] must be called
/// on every path: it finalizes the update record and releases the lock.
/// Dropping a run without closing it only cleans up the scratch directory.
pub struct CommandRun {
    command: Command,
    update_id: UpdateId,
    store: StateStore,
    workspace: Workspace,
    work_dir: Option<TempDir>,
    locked: bool,
    daemon: Option<PartialPushDaemon>,
    // remote state as pulled at open, the partial-push baseline
    pulled: Option<Bytes>,
    partial_push_interval: Duration,
    keep_work_dir: bool,
}

impl CommandRun {
    pub async fn open(ctx: &RunContext, command: Command) -> Result<CommandRun> {
        let update_id = UpdateId::generate();
        tokio::fs::create_dir_all(&ctx.work_root)
            .await
            .map_err(|e| StateError::io(&ctx.work_root, e))?;
        let work_dir = tempfile::Builder::new()
            .prefix(&format!("stlv-{}-", update_id))
            .tempdir_in(&ctx.work_root)
            .map_err(|e| StateError::io(&ctx.work_root, e))?;
        let keys = ctx.store.keys();
        let workspace = Workspace::new(work_dir.path(), &keys.app, &keys.env);
        workspace.prepare().await?;

        let mut run = CommandRun {
            command,
            update_id,
            store: ctx.store.clone(),
            workspace,
            work_dir: Some(work_dir),
            locked: false,
            daemon: None,
            pulled: None,
            partial_push_interval: ctx.partial_push_interval,
            keep_work_dir: ctx.keep_work_dir,
        };

        if let Some(lock_as) = command.lock_as() {
            // on failure `run` is dropped here, which removes the scratch dir
            ctx.store
                .locks()
                .acquire_as(&run.update_id, lock_as, ctx.run_id.clone())
                .await?;
            run.locked = true;
        }

        if command.reads_state() {
            let state_path = run.workspace.state_path();
            match run.store.sync().pull(&state_path).await {
                Ok(pulled) => run.pulled = pulled,
                Err(err) => {
                    if let Err(close_err) = run.close(vec![err.to_string()]).await {
                        error!(error = %close_err, "failed to close run after pull error");
                    }
                    return Err(err);
                }
            }
        }
        info!(
            command = %command,
            update_id = %run.update_id,
            work_dir = %run.workspace.work_dir.display(),
            "opened run"
        );
        Ok(run)
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn update_id(&self) -> &UpdateId {
        &self.update_id
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn state_path(&self) -> PathBuf {
        self.workspace.state_path()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Starts the partial-push daemon, or returns the trigger of the running
    /// one.
    pub fn start_partial_push(&mut self) -> PartialPushTrigger {
        if let Some(daemon) = &self.daemon {
            return daemon.trigger_handle();
        }
        let mut pusher = PartialPusher::new(
            self.store.sync().clone(),
            &self.state_path(),
            &self.workspace.work_dir.join("partial-push.json"),
        );
        if let Some(pulled) = &self.pulled {
            pusher = pusher.with_baseline(pulled);
        }
        let daemon =
            PartialPushDaemon::start(pusher, self.partial_push_interval, self.store.metrics());
        let trigger = daemon.trigger_handle();
        self.daemon = Some(daemon);
        trigger
    }

    pub async fn stop_partial_push(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            daemon.stop().await;
        }
    }

    /// Reads the local state file, `None` when the engine has not written one.
    pub async fn load_local(&self) -> Result<Option<StateBlob>> {
        let path = self.state_path();
        match read_state_file(&path).await {
            Ok(data) => StateBlob::from_slice(&data)
                .map(Some)
                .map_err(|e| StateError::corrupt(path.display().to_string(), e)),
            Err(StateError::StateFileMissing(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Uploads `state`, or the local state file when `None`. Only lock
    /// holders write state.
    pub async fn push_state(&self, state: Option<&StateBlob>) -> Result<()> {
        self.store.sync().push(&self.state_path(), state).await
    }

    /// Like `push_state(None)` but a missing local file is not an error.
    /// Returns whether anything was uploaded.
    pub async fn push_local_if_present(&self) -> Result<bool> {
        match self.push_state(None).await {
            Ok(()) => Ok(true),
            Err(StateError::StateFileMissing(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn create_snapshot(&self) -> Result<bool> {
        self.store.sync().create_snapshot(&self.update_id).await
    }

    pub async fn delete_snapshots(&self) -> Result<usize> {
        self.store.sync().delete_snapshots().await
    }

    /// Stops the daemon, completes the update record with `errors`, releases
    /// the lock and removes the scratch directory. The lock is released even
    /// when the ledger write fails; the first error is returned.
    pub async fn close(mut self, errors: Vec<String>) -> Result<()> {
        self.stop_partial_push().await;

        let mut result = Ok(());
        if self.locked {
            if let Err(e) = self
                .store
                .ledger()
                .record_complete(&self.update_id, Some(errors))
                .await
            {
                error!(update_id = %self.update_id, error = %e, "failed to finalize update record");
                result = Err(e);
            }
            match self.store.locks().release().await {
                Ok(()) => self.locked = false,
                Err(e) => {
                    error!(update_id = %self.update_id, error = %e, "failed to release state lock");
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        self.cleanup_work_dir();
        result
    }

    fn cleanup_work_dir(&mut self) {
        let Some(work_dir) = self.work_dir.take() else {
            return;
        };
        if self.keep_work_dir || env_flag(NO_CLEANUP_ENV) {
            let path = work_dir.keep();
            info!(path = %path.display(), "keeping work directory");
            return;
        }
        let path = work_dir.path().to_path_buf();
        if let Err(e) = work_dir.close() {
            warn!(path = %path.display(), error = %e, "failed to remove work directory");
        }
    }
}

impl Drop for CommandRun {
    fn drop(&mut self) {
        if self.locked {
            let keys = self.store.keys();
            error!(
                update_id = %self.update_id,
                "run for {}/{} ended without releasing its lock, run `stlv unlock --env {}` \
                 once no other operation is running",
                keys.app,
                keys.env,
                keys.env
            );
        }
        self.cleanup_work_dir();
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::mock_app_state;

    use super::*;
    use crate::testing::TestContext;

    #[tokio::test]
    async fn test_locking_run_lifecycle() {
        let test = TestContext::new();
        let run = CommandRun::open(&test.ctx, Command::Deploy).await.unwrap();
        assert!(run.is_locked());
        assert!(run.workspace().work_dir.exists());
        assert!(run.workspace().backend_meta_path().exists());
        let update_id = run.update_id().clone();

        let lock = test.ctx.store.locks().read().await.unwrap().unwrap();
        assert_eq!(lock.update_id, update_id);
        assert_eq!(lock.command, "deploy");

        run.close(vec![]).await.unwrap();
        assert!(test.ctx.store.locks().read().await.unwrap().is_none());
        let record = test
            .ctx
            .store
            .ledger()
            .get(&update_id)
            .await
            .unwrap()
            .unwrap();
        assert!(record.is_complete());
        assert!(!record.failed());
        assert!(test.work_dirs().is_empty());
    }

    #[tokio::test]
    async fn test_close_records_errors() {
        let test = TestContext::new();
        let run = CommandRun::open(&test.ctx, Command::Refresh).await.unwrap();
        let update_id = run.update_id().clone();
        run.close(vec!["engine refresh failed".to_string()])
            .await
            .unwrap();

        let record = test.ctx.store.ledger().get(&update_id).await.unwrap().unwrap();
        assert_eq!(record.errors, Some(vec!["engine refresh failed".to_string()]));
        assert!(test.ctx.store.locks().read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_only_run_takes_no_lock() {
        let test = TestContext::new();
        test.seed_state(&mock_app_state()).await;

        let run = CommandRun::open(&test.ctx, Command::Diff).await.unwrap();
        assert!(!run.is_locked());
        assert!(test.ctx.store.locks().read().await.unwrap().is_none());
        assert_eq!(run.load_local().await.unwrap(), Some(mock_app_state()));

        // a concurrent mutating run is not blocked
        let deploy = CommandRun::open(&test.ctx, Command::Deploy).await.unwrap();
        deploy.close(vec![]).await.unwrap();
        run.close(vec![]).await.unwrap();
        assert_eq!(test.ctx.store.ledger().list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_conflict_cleans_up_scratch_dir() {
        let test = TestContext::new();
        let holder = CommandRun::open(&test.ctx, Command::Deploy).await.unwrap();

        let err = match CommandRun::open(&test.ctx, Command::Destroy).await {
            Ok(_) => panic!("second lock acquisition succeeded"),
            Err(err) => err,
        };
        assert!(matches!(err, StateError::Locked { .. }));
        assert_eq!(test.work_dirs().len(), 1);

        holder.close(vec![]).await.unwrap();
        assert!(test.work_dirs().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_remote_state_releases_lock() {
        let test = TestContext::new();
        test.blob_store
            .put(
                &test.ctx.store.keys().state(),
                bytes::Bytes::from_static(b"{\"version\": 3"),
            )
            .await
            .unwrap();

        let err = match CommandRun::open(&test.ctx, Command::Deploy).await {
            Ok(_) => panic!("run opened on corrupt state"),
            Err(err) => err,
        };
        assert!(matches!(err, StateError::Corrupt { .. }));
        assert!(test.ctx.store.locks().read().await.unwrap().is_none());
        let records = test.ctx.store.ledger().list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].failed());
        assert!(test.work_dirs().is_empty());
    }

    #[tokio::test]
    async fn test_keep_work_dir() {
        let mut test = TestContext::new();
        test.ctx.keep_work_dir = true;
        let run = CommandRun::open(&test.ctx, Command::Outputs).await.unwrap();
        let work_dir = run.workspace().work_dir.clone();
        run.close(vec![]).await.unwrap();
        assert!(work_dir.exists());
        std::fs::remove_dir_all(work_dir).unwrap();
    }

    #[tokio::test]
    async fn test_dropped_run_removes_scratch_dir() {
        let test = TestContext::new();
        let run = CommandRun::open(&test.ctx, Command::StateList).await.unwrap();
        assert_eq!(test.work_dirs().len(), 1);
        drop(run);
        assert!(test.work_dirs().is_empty());
    }

    #[tokio::test]
    async fn test_partial_push_during_run() {
        let test = TestContext::new();
        let mut run = CommandRun::open(&test.ctx, Command::Deploy).await.unwrap();
        let trigger = run.start_partial_push();

        let state_path = run.state_path();
        std::fs::create_dir_all(state_path.parent().unwrap()).unwrap();
        std::fs::write(&state_path, mock_app_state().to_vec_pretty().unwrap()).unwrap();
        trigger.trigger();
        test.wait_for_state_puts(1).await;

        run.stop_partial_push().await;
        assert_eq!(
            test.ctx.store.sync().load_remote().await.unwrap(),
            Some(mock_app_state())
        );
        run.close(vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_push_skips_unchanged_pulled_state() {
        let test = TestContext::new();
        test.seed_state(&mock_app_state()).await;
        assert_eq!(test.state_puts(), 1);

        let mut run = CommandRun::open(&test.ctx, Command::Deploy).await.unwrap();
        let trigger = run.start_partial_push();
        trigger.trigger();
        tokio::time::sleep(Duration::from_millis(100)).await;
        run.stop_partial_push().await;

        assert_eq!(test.state_puts(), 1);
        run.close(vec![]).await.unwrap();
    }
}
