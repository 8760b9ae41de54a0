use std::fmt;

use async_trait::async_trait;
use sandbox_bridge_error::SandboxError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use crate::options::{LaunchSpec, SandboxConfig};

pub mod process;

pub use process::LocalProcessProvider;

/// Opaque handle naming one sandbox on its provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxId(String);

impl SandboxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the agent process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub stderr: Option<String>,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// The agent process attached to a sandbox: its stdio and a one-shot exit
/// notification.
pub struct AgentProcess {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub exit: oneshot::Receiver<ExitReport>,
}

impl fmt::Debug for AgentProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentProcess").finish_non_exhaustive()
    }
}

/// The compute platform that allocates sandboxes and runs the agent in them.
///
/// Every call may be slow and may fail. The lifecycle controller bounds each
/// of them with its own deadlines.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Allocates a sandbox. Fails with [`SandboxError::Provision`] when the
    /// platform cannot allocate it or build its image.
    async fn create(&self, config: &SandboxConfig) -> Result<SandboxId, SandboxError>;

    /// Starts the agent process inside the sandbox and attaches its stdio.
    async fn attach_io(
        &self,
        id: &SandboxId,
        launch: &LaunchSpec,
    ) -> Result<AgentProcess, SandboxError>;

    /// Requests teardown and waits for the platform to confirm it.
    async fn terminate(&self, id: &SandboxId) -> Result<(), SandboxError>;

    /// Teardown used when `terminate` did not finish within the grace period.
    async fn force_terminate(&self, id: &SandboxId) -> Result<(), SandboxError> {
        self.terminate(id).await
    }
}
