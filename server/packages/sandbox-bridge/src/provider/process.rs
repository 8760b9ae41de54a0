use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sandbox_bridge_error::{ProvisionFailure, SandboxError};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::{oneshot, watch, Mutex};

use super::{AgentProcess, ExitReport, SandboxId, SandboxProvider};
use crate::options::{LaunchSpec, SandboxConfig};

const STDERR_HEAD_LINES: usize = 20;
const STDERR_TAIL_LINES: usize = 50;
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);
const DEFAULT_EXIT_GRACE: Duration = Duration::from_secs(1);

/// Runs the agent as a local child process. The sandbox is a fresh temporary
/// working directory, removed again on terminate.
#[derive(Debug)]
pub struct LocalProcessProvider {
    root: Option<PathBuf>,
    exit_grace: Duration,
    sandboxes: Mutex<HashMap<SandboxId, LocalSandbox>>,
}

#[derive(Debug)]
struct LocalSandbox {
    workdir: TempDir,
    env: BTreeMap<String, String>,
    created_at: Instant,
    process: Option<LocalChild>,
}

#[derive(Debug)]
struct LocalChild {
    pid: u32,
    kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

impl LocalChild {
    fn is_running(&self) -> bool {
        !*self.exited.borrow()
    }
}

impl Default for LocalProcessProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalProcessProvider {
    pub fn new() -> Self {
        Self {
            root: None,
            exit_grace: DEFAULT_EXIT_GRACE,
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Places sandbox directories under `root` instead of the system temp dir.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// How long `terminate` lets the agent exit on its own before killing it.
    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    pub async fn workdir(&self, id: &SandboxId) -> Option<PathBuf> {
        let sandboxes = self.sandboxes.lock().await;
        sandboxes.get(id).map(|sandbox| sandbox.workdir.path().to_path_buf())
    }

    async fn take_sandbox(&self, id: &SandboxId) -> Option<LocalSandbox> {
        self.sandboxes.lock().await.remove(id)
    }
}

#[async_trait]
impl SandboxProvider for LocalProcessProvider {
    async fn create(&self, config: &SandboxConfig) -> Result<SandboxId, SandboxError> {
        if config.image.is_some() || config.gpu.is_some() {
            tracing::warn!(
                image = ?config.image,
                gpu = ?config.gpu,
                "local process provider ignores image and gpu settings"
            );
        }

        let prefix = format!("{}-", config.app_name);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let workdir = match &self.root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|err| SandboxError::Provision {
            reason: ProvisionFailure::Allocation,
            message: format!("failed to create sandbox directory: {err}"),
        })?;

        let id = SandboxId::new(format!("local-{}", uuid::Uuid::new_v4()));
        tracing::info!(
            sandbox_id = %id,
            workdir = %workdir.path().display(),
            "local sandbox created"
        );

        self.sandboxes.lock().await.insert(
            id.clone(),
            LocalSandbox {
                workdir,
                env: config.env.clone(),
                created_at: Instant::now(),
                process: None,
            },
        );
        Ok(id)
    }

    async fn attach_io(
        &self,
        id: &SandboxId,
        launch: &LaunchSpec,
    ) -> Result<AgentProcess, SandboxError> {
        let mut sandboxes = self.sandboxes.lock().await;
        let sandbox = sandboxes.get_mut(id).ok_or(SandboxError::Closed)?;
        if sandbox.process.as_ref().is_some_and(LocalChild::is_running) {
            return Err(SandboxError::invalid_state(format!(
                "sandbox {id} already has a running agent process"
            )));
        }

        let spawn_start = Instant::now();
        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .current_dir(sandbox.workdir.path())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in sandbox.env.iter().chain(launch.env.iter()) {
            command.env(key, value);
        }

        tracing::info!(
            sandbox_id = %id,
            program = ?launch.program,
            args = launch.args.len(),
            "spawning agent process"
        );

        let mut child = command.spawn().map_err(|err| {
            tracing::error!(sandbox_id = %id, error = %err, "failed to spawn agent process");
            SandboxError::StreamError {
                message: format!("failed to spawn `{}`: {err}", launch.display()),
            }
        })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(
            sandbox_id = %id,
            pid = pid,
            elapsed_ms = spawn_start.elapsed().as_millis() as u64,
            sandbox_age_ms = sandbox.created_at.elapsed().as_millis() as u64,
            "agent process spawned"
        );

        let missing = |stream: &str| SandboxError::StreamError {
            message: format!("failed to capture agent {stream}"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let capture = Arc::new(std::sync::Mutex::new(StderrCapture::default()));
        let stderr_task = spawn_stderr_loop(id.clone(), stderr, capture.clone());

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exited_tx, exited_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = oneshot::channel();
        let sandbox_id = id.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    tracing::warn!(sandbox_id = %sandbox_id, pid = pid, "killing agent process");
                    if let Err(err) = child.start_kill() {
                        tracing::warn!(sandbox_id = %sandbox_id, error = %err, "kill failed");
                    }
                    child.wait().await
                }
            };

            let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, stderr_task).await;
            let stderr = capture.lock().ok().and_then(|capture| capture.snapshot());
            let code = match &status {
                Ok(status) => status.code(),
                Err(err) => {
                    tracing::error!(sandbox_id = %sandbox_id, error = %err, "failed to get exit status");
                    None
                }
            };
            tracing::info!(
                sandbox_id = %sandbox_id,
                pid = pid,
                code = ?code,
                "agent process exited"
            );

            let _ = exited_tx.send(true);
            let _ = exit_tx.send(ExitReport { code, stderr });
        });

        sandbox.process = Some(LocalChild {
            pid,
            kill: Some(kill_tx),
            exited: exited_rx,
        });

        Ok(AgentProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            exit: exit_rx,
        })
    }

    async fn terminate(&self, id: &SandboxId) -> Result<(), SandboxError> {
        let Some(mut sandbox) = self.take_sandbox(id).await else {
            return Ok(());
        };
        if let Some(process) = sandbox.process.as_mut() {
            let exited_on_its_own = tokio::time::timeout(
                self.exit_grace,
                process.exited.wait_for(|exited| *exited),
            )
            .await
            .is_ok();
            if !exited_on_its_own {
                stop_child(id, process).await;
            }
        }
        remove_workdir(id, sandbox.workdir);
        Ok(())
    }

    async fn force_terminate(&self, id: &SandboxId) -> Result<(), SandboxError> {
        let Some(mut sandbox) = self.take_sandbox(id).await else {
            return Ok(());
        };
        if let Some(process) = sandbox.process.as_mut() {
            stop_child(id, process).await;
        }
        remove_workdir(id, sandbox.workdir);
        Ok(())
    }
}

async fn stop_child(id: &SandboxId, process: &mut LocalChild) {
    tracing::info!(sandbox_id = %id, pid = process.pid, "stopping agent process");
    if let Some(kill) = process.kill.take() {
        let _ = kill.send(());
    }
    let _ = process.exited.wait_for(|exited| *exited).await;
}

fn remove_workdir(id: &SandboxId, workdir: TempDir) {
    let path = workdir.path().to_path_buf();
    if let Err(err) = workdir.close() {
        tracing::warn!(
            sandbox_id = %id,
            workdir = %path.display(),
            error = %err,
            "failed to remove sandbox directory"
        );
    }
}

fn spawn_stderr_loop(
    id: SandboxId,
    stderr: ChildStderr,
    capture: Arc<std::sync::Mutex<StderrCapture>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut line_count: u64 = 0;

        while let Ok(Some(line)) = lines.next_line().await {
            line_count += 1;
            tracing::debug!(sandbox_id = %id, line_number = line_count, "agent stderr: {}", line);
            if let Ok(mut capture) = capture.lock() {
                capture.record(line);
            }
        }

        tracing::debug!(sandbox_id = %id, total_lines = line_count, "agent stderr: stream ended");
    })
}

/// Keeps the first and last lines of stderr for error reports.
#[derive(Debug, Default)]
pub(crate) struct StderrCapture {
    total_lines: usize,
    head: Vec<String>,
    tail: VecDeque<String>,
}

impl StderrCapture {
    pub(crate) fn record(&mut self, line: String) {
        self.total_lines = self.total_lines.saturating_add(1);
        if self.head.len() < STDERR_HEAD_LINES {
            self.head.push(line);
            return;
        }
        self.tail.push_back(line);
        while self.tail.len() > STDERR_TAIL_LINES {
            self.tail.pop_front();
        }
    }

    pub(crate) fn snapshot(&self) -> Option<String> {
        if self.total_lines == 0 {
            return None;
        }
        let mut lines = self.head.clone();
        let kept = self.head.len() + self.tail.len();
        if self.total_lines > kept {
            lines.push(format!("... ({} lines omitted) ...", self.total_lines - kept));
        }
        lines.extend(self.tail.iter().cloned());
        Some(lines.join("\n"))
    }
}
