//! Driver for the resource-graph engine.
//!
//! The engine is treated as opaque: it reads and writes its state file under
//! the scratch directory of a run and reports progress on stdout. Everything
//! else about state lives in `state_store`.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use state_store::{PartialPushTrigger, Result, StateError};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
};
use tracing::{debug, info};

use crate::config::PulumiConfig;

// lines of stderr kept for the error message of a failed engine run
const STDERR_TAIL_LINES: usize = 20;

// Without it the file backend falls back to the legacy `stacks/{stack}.json`
// layout and ignores the project-scoped state file.
const BACKEND_META: &str = "version: 1\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Preview,
    Up,
    Refresh,
    Destroy,
}

/// Scratch directory of one run, laid out the way the engine's file backend
/// expects it.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub work_dir: PathBuf,
    pub app: String,
    pub env: String,
}

impl Workspace {
    pub fn new(work_dir: &Path, app: &str, env: &str) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            app: app.to_string(),
            env: env.to_string(),
        }
    }

    /// Local state file. The engine project is named after the app and the
    /// stack after the env.
    pub fn state_path(&self) -> PathBuf {
        self.work_dir
            .join(".pulumi")
            .join("stacks")
            .join(&self.app)
            .join(format!("{}.json", self.env))
    }

    pub fn backend_url(&self) -> String {
        format!("file://{}", self.work_dir.display())
    }

    pub fn backend_meta_path(&self) -> PathBuf {
        self.work_dir.join(".pulumi").join("meta.yaml")
    }

    /// Creates the backend metadata that selects the project-scoped layout.
    /// Must run before state is pulled into the workspace.
    pub async fn prepare(&self) -> Result<()> {
        let meta_path = self.backend_meta_path();
        if let Some(dir) = meta_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StateError::io(dir, e))?;
        }
        tokio::fs::write(&meta_path, BACKEND_META)
            .await
            .map_err(|e| StateError::io(&meta_path, e))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineSummary {
    pub progress_lines: usize,
}

#[async_trait]
pub trait Engine: Send + Sync {
    /// Runs `operation` against the state file in `workspace`. `trigger` is
    /// called whenever the engine reports progress.
    async fn run(
        &self,
        operation: Operation,
        workspace: &Workspace,
        trigger: PartialPushTrigger,
    ) -> Result<EngineSummary>;
}

/// Runs the `pulumi` CLI with a file backend rooted at the scratch dir.
pub struct PulumiCli {
    binary: String,
    project_dir: PathBuf,
    passphrase: String,
}

impl PulumiCli {
    pub fn new(config: &PulumiConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            project_dir: config.project_dir.clone(),
            passphrase: config.passphrase.clone(),
        }
    }

    fn command(&self, workspace: &Workspace, args: &[&str]) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .arg("--non-interactive")
            .current_dir(&self.project_dir)
            .env("PULUMI_BACKEND_URL", workspace.backend_url())
            .env("PULUMI_CONFIG_PASSPHRASE", &self.passphrase)
            .env("PULUMI_SKIP_UPDATE_CHECK", "true")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn exec(
        &self,
        name: &str,
        workspace: &Workspace,
        args: &[&str],
        trigger: Option<&PartialPushTrigger>,
    ) -> Result<usize> {
        debug!(binary = %self.binary, ?args, "running engine");
        let mut child = self
            .command(workspace, args)
            .spawn()
            .map_err(|e| StateError::io(&self.binary, e))?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(StateError::Engine {
                operation: name.to_string(),
                message: "engine output was not captured".to_string(),
            });
        };
        // drained concurrently so a chatty stderr cannot block the child
        let stderr_tail = tokio::spawn(tail_lines(stderr));

        let mut lines = BufReader::new(stdout).lines();
        let mut progress_lines = 0;
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| StateError::io(&self.binary, e))?
        {
            info!(target: "pulumi", "{}", line);
            progress_lines += 1;
            if let Some(trigger) = trigger {
                trigger.trigger();
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| StateError::io(&self.binary, e))?;
        let stderr_tail = stderr_tail.await.unwrap_or_default();
        if !status.success() {
            return Err(StateError::Engine {
                operation: name.to_string(),
                message: format!("{} exited with {}: {}", self.binary, status, stderr_tail),
            });
        }
        Ok(progress_lines)
    }
}

async fn tail_lines<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.remove(0);
        }
        tail.push(line);
    }
    tail.join("\n")
}

#[async_trait]
impl Engine for PulumiCli {
    async fn run(
        &self,
        operation: Operation,
        workspace: &Workspace,
        trigger: PartialPushTrigger,
    ) -> Result<EngineSummary> {
        self.exec(
            "stack select",
            workspace,
            &["stack", "select", "--create", &workspace.env],
            None,
        )
        .await?;

        let args: &[&str] = match operation {
            Operation::Preview => &["preview", "--diff"],
            Operation::Up => &["up", "--yes", "--skip-preview"],
            Operation::Refresh => &["refresh", "--yes", "--skip-preview"],
            Operation::Destroy => &["destroy", "--yes", "--skip-preview"],
        };
        let progress_lines = self
            .exec(operation.as_ref(), workspace, args, Some(&trigger))
            .await?;
        info!(%operation, progress_lines, "engine finished");
        Ok(EngineSummary { progress_lines })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn test_workspace_paths() {
        let workspace = Workspace::new(Path::new("/tmp/stlv-u1"), "shop", "dev");
        assert_eq!(
            workspace.state_path(),
            Path::new("/tmp/stlv-u1/.pulumi/stacks/shop/dev.json")
        );
        assert_eq!(workspace.backend_url(), "file:///tmp/stlv-u1");
        assert_eq!(Operation::Up.to_string(), "up");
    }

    #[tokio::test]
    async fn test_prepare_selects_project_layout() {
        let temp_dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(temp_dir.path(), "shop", "dev");
        workspace.prepare().await.unwrap();

        let meta = std::fs::read_to_string(workspace.backend_meta_path()).unwrap();
        assert_eq!(meta, "version: 1\n");
        let pulumi_dir = workspace.backend_meta_path().parent().unwrap().to_path_buf();
        assert!(workspace.state_path().starts_with(pulumi_dir.join("stacks")));
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let engine = PulumiCli::new(&PulumiConfig {
            binary: "stlv-no-such-engine-binary".to_string(),
            ..Default::default()
        });
        let temp_dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(temp_dir.path(), "shop", "dev");
        let err = engine
            .run(Operation::Preview, &workspace, PartialPushTrigger::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::Io { .. }));
    }
}
