//! Best-effort upload of the engine's in-progress state during long
//! operations.
//!
//! The engine rewrites its local state file whenever a resource step
//! finishes. The daemon wakes on a trigger or on a timer, snapshots that file,
//! and uploads it when its content changed since the last upload. Nothing here
//! can fail the host operation: errors are logged and the loop continues. The
//! only guaranteed persistence point stays the final push of the command.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use stelvio_utils::sha256_hex;
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    error::{Result, StateError},
    sync::{read_state_file, StateSync},
};

pub const DEFAULT_PARTIAL_PUSH_INTERVAL: Duration = Duration::from_secs(5);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Cloneable handle the engine driver uses to request a push soon.
#[derive(Clone, Default)]
pub struct PartialPushTrigger {
    notify: Arc<Notify>,
}

impl PartialPushTrigger {
    pub fn trigger(&self) {
        // stores a permit when the daemon is busy, so a trigger during an
        // upload causes one more push afterwards
        self.notify.notify_one();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Uploaded,
    Unchanged,
    NoState,
}

/// One push attempt: copy, validate, hash, upload if changed.
pub struct PartialPusher {
    sync: StateSync,
    state_path: PathBuf,
    temp_path: PathBuf,
    last_hash: Option<String>,
}

impl PartialPusher {
    /// `temp_path` must be private to this pusher; the state file is copied
    /// there before it is read so the engine can keep rewriting the original.
    pub fn new(sync: StateSync, state_path: &Path, temp_path: &Path) -> Self {
        Self {
            sync,
            state_path: state_path.to_path_buf(),
            temp_path: temp_path.to_path_buf(),
            last_hash: None,
        }
    }

    /// Treats `data` as already uploaded, so an unchanged file is not pushed
    /// again. Used with the bytes just pulled from the remote.
    pub fn with_baseline(mut self, data: &[u8]) -> Self {
        self.last_hash = Some(sha256_hex(data));
        self
    }

    pub async fn push_once(&mut self) -> Result<PushOutcome> {
        match tokio::fs::copy(&self.state_path, &self.temp_path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PushOutcome::NoState),
            Err(e) => return Err(StateError::io(&self.state_path, e)),
        }
        // a torn read of a file mid-write fails validation here
        let data = read_state_file(&self.temp_path).await?;
        let hash = sha256_hex(&data);
        if self.last_hash.as_deref() == Some(hash.as_str()) {
            return Ok(PushOutcome::Unchanged);
        }
        self.sync.upload(data).await?;
        self.last_hash = Some(hash);
        Ok(PushOutcome::Uploaded)
    }
}

/// Background task driving a [`PartialPusher`].
pub struct PartialPushDaemon {
    trigger: PartialPushTrigger,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl PartialPushDaemon {
    pub fn start(
        pusher: PartialPusher,
        interval: Duration,
        metrics: Arc<metrics::state_ops::Metrics>,
    ) -> Self {
        let trigger = PartialPushTrigger::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let notify = trigger.notify.clone();
        let handle = tokio::spawn(run(pusher, notify, shutdown_rx, interval, metrics));
        Self {
            trigger,
            shutdown_tx,
            handle: Some(handle),
        }
    }

    pub fn trigger(&self) {
        self.trigger.trigger();
    }

    pub fn trigger_handle(&self) -> PartialPushTrigger {
        self.trigger.clone()
    }

    /// Signals the task to exit and waits for it. A task stuck in an upload
    /// past the timeout is aborted.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        match tokio::time::timeout(STOP_TIMEOUT, &mut handle).await {
            Ok(Ok(())) => debug!("partial push daemon stopped"),
            Ok(Err(e)) => warn!(error = %e, "partial push daemon exited abnormally"),
            Err(_) => {
                warn!("partial push daemon did not stop in time, aborting it");
                handle.abort();
            }
        }
    }
}

impl Drop for PartialPushDaemon {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn run(
    mut pusher: PartialPusher,
    notify: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
    interval: Duration,
    metrics: Arc<metrics::state_ops::Metrics>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = notify.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
        metrics.partial_push_attempts.add(1, &[]);
        match pusher.push_once().await {
            Ok(PushOutcome::Uploaded) => {
                metrics.partial_push_uploads.add(1, &[]);
                debug!("partial state push uploaded");
            }
            Ok(PushOutcome::Unchanged) => {
                metrics.partial_push_skipped.add(1, &[]);
            }
            Ok(PushOutcome::NoState) => {}
            Err(e) => {
                metrics.partial_push_failures.add(1, &[]);
                warn!(error = %e, "partial state push failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use data_model::{
        test_objects::tests::{mock_app_state, mock_broken_state, TEST_APP, TEST_ENV},
        StateKeys,
    };
    use tempfile::TempDir;

    use super::*;
    use crate::test_blob_store::TestBlobStore;

    const STATE_KEY: &str = "state/shop/dev.json";

    fn pusher(store: Arc<TestBlobStore>, dir: &TempDir) -> PartialPusher {
        let sync = StateSync::new(
            store,
            StateKeys::new(TEST_APP, TEST_ENV),
            Arc::new(metrics::state_ops::Metrics::new()),
        );
        PartialPusher::new(
            sync,
            &dir.path().join("dev.json"),
            &dir.path().join("partial-push.json"),
        )
    }

    fn write_state(dir: &TempDir, data: &[u8]) {
        std::fs::write(dir.path().join("dev.json"), data).unwrap();
    }

    async fn wait_for_puts(store: &TestBlobStore, expected: usize) {
        for _ in 0..200 {
            if store.put_count(STATE_KEY) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} state uploads, saw {}",
            expected,
            store.put_count(STATE_KEY)
        );
    }

    #[tokio::test]
    async fn test_identical_content_uploads_once() {
        let dir = TempDir::new().unwrap();
        let store = TestBlobStore::new();
        let mut pusher = pusher(store.clone(), &dir);
        write_state(&dir, &mock_app_state().to_vec_pretty().unwrap());

        assert_eq!(pusher.push_once().await.unwrap(), PushOutcome::Uploaded);
        assert_eq!(pusher.push_once().await.unwrap(), PushOutcome::Unchanged);
        assert_eq!(store.put_count(STATE_KEY), 1);

        write_state(&dir, &mock_broken_state().to_vec_pretty().unwrap());
        assert_eq!(pusher.push_once().await.unwrap(), PushOutcome::Uploaded);
        assert_eq!(store.put_count(STATE_KEY), 2);
    }

    #[tokio::test]
    async fn test_baseline_skips_pulled_state() {
        let dir = TempDir::new().unwrap();
        let store = TestBlobStore::new();
        let pulled = mock_app_state().to_vec_pretty().unwrap();
        let mut pusher = pusher(store.clone(), &dir).with_baseline(&pulled);
        write_state(&dir, &pulled);

        assert_eq!(pusher.push_once().await.unwrap(), PushOutcome::Unchanged);
        assert_eq!(store.total_puts(), 0);

        write_state(&dir, &mock_broken_state().to_vec_pretty().unwrap());
        assert_eq!(pusher.push_once().await.unwrap(), PushOutcome::Uploaded);
    }

    #[tokio::test]
    async fn test_missing_or_torn_state_is_not_uploaded() {
        let dir = TempDir::new().unwrap();
        let store = TestBlobStore::new();
        let mut pusher = pusher(store.clone(), &dir);

        assert_eq!(pusher.push_once().await.unwrap(), PushOutcome::NoState);
        write_state(&dir, b"{\"version\": 3, \"check");
        assert!(matches!(
            pusher.push_once().await,
            Err(StateError::Corrupt { .. })
        ));
        assert_eq!(store.total_puts(), 0);
    }

    #[tokio::test]
    async fn test_failed_upload_is_retried() {
        let dir = TempDir::new().unwrap();
        let store = TestBlobStore::new();
        let mut pusher = pusher(store.clone(), &dir);
        write_state(&dir, &mock_app_state().to_vec_pretty().unwrap());

        store.fail_next_puts(1);
        assert!(pusher.push_once().await.is_err());
        // the failed content was never recorded as pushed
        assert_eq!(pusher.push_once().await.unwrap(), PushOutcome::Uploaded);
        assert_eq!(store.put_count(STATE_KEY), 1);
    }

    #[tokio::test]
    async fn test_daemon_pushes_on_trigger() {
        let dir = TempDir::new().unwrap();
        let store = TestBlobStore::new();
        let daemon = PartialPushDaemon::start(
            pusher(store.clone(), &dir),
            Duration::from_secs(3600),
            Arc::new(metrics::state_ops::Metrics::new()),
        );

        write_state(&dir, &mock_app_state().to_vec_pretty().unwrap());
        daemon.trigger();
        wait_for_puts(&store, 1).await;

        write_state(&dir, &mock_broken_state().to_vec_pretty().unwrap());
        daemon.trigger_handle().trigger();
        wait_for_puts(&store, 2).await;

        daemon.stop().await;
    }

    #[tokio::test]
    async fn test_daemon_survives_upload_failures() {
        let dir = TempDir::new().unwrap();
        let store = TestBlobStore::new();
        write_state(&dir, &mock_app_state().to_vec_pretty().unwrap());
        store.fail_next_puts(2);

        let daemon = PartialPushDaemon::start(
            pusher(store.clone(), &dir),
            Duration::from_millis(20),
            Arc::new(metrics::state_ops::Metrics::new()),
        );
        wait_for_puts(&store, 1).await;
        daemon.stop().await;
        assert_eq!(store.put_count(STATE_KEY), 1);
    }

    #[tokio::test]
    async fn test_stop_without_pushes() {
        let dir = TempDir::new().unwrap();
        let store = TestBlobStore::new();
        let daemon = PartialPushDaemon::start(
            pusher(store.clone(), &dir),
            Duration::from_secs(3600),
            Arc::new(metrics::state_ops::Metrics::new()),
        );
        tokio::time::timeout(Duration::from_secs(1), daemon.stop())
            .await
            .unwrap();
        assert_eq!(store.total_puts(), 0);
    }
}
