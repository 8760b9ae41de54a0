use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::{Duration, Instant};

use sandbox_bridge_error::{SandboxError, TimeoutPhase};
use sandbox_bridge_schema::{decode_line, encode_host_frame, AgentEvent, HostFrame, SandboxFrame};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use crate::bridge::CallBridge;
use crate::options::{BridgeOptions, LaunchSpec, SandboxConfig};
use crate::provider::{ExitReport, SandboxId, SandboxProvider};

const RAW_PREVIEW_BYTES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Created,
    Provisioning,
    Ready,
    Running,
    Draining,
    Terminated,
    Failed,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    fn can_transition_to(&self, next: SandboxState) -> bool {
        use SandboxState::*;
        match (self, next) {
            (Terminated | Failed, _) => false,
            (_, Failed) => true,
            (Created, Provisioning | Terminated) => true,
            (Provisioning, Ready | Terminated) => true,
            (Ready, Running | Draining | Terminated) => true,
            (Running, Draining | Terminated) => true,
            (Draining, Terminated) => true,
            _ => false,
        }
    }
}

/// What the output pump hands to the session, in arrival order.
#[derive(Debug, Clone)]
pub enum PumpEvent {
    Event(AgentEvent),
    /// The output stream ended after a clean exit, or before any exit status
    /// arrived.
    Closed(Option<ExitReport>),
    Failed(SandboxError),
    Cancelled,
}

/// Serializes every write onto the agent's input stream. A frame is written
/// and flushed while the lock is held, so frames never interleave.
pub struct FrameWriter {
    sink: Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    timeout: Duration,
}

impl FrameWriter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sink: Mutex::new(None),
            timeout,
        }
    }

    pub async fn attach(&self, sink: Box<dyn AsyncWrite + Send + Unpin>) {
        *self.sink.lock().await = Some(sink);
    }

    /// Drops the sink, which closes the agent's stdin.
    pub async fn detach(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.shutdown().await;
        }
    }

    pub async fn send(&self, frame: &HostFrame) -> Result<(), SandboxError> {
        let line = encode_host_frame(frame)
            .map_err(|err| SandboxError::protocol(format!("failed to encode frame: {err}")))?;

        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(SandboxError::Closed)?;
        let write = async {
            sink.write_all(line.as_bytes()).await?;
            sink.write_all(b"\n").await?;
            sink.flush().await
        };
        match tokio::time::timeout(self.timeout, write).await {
            Ok(Ok(())) => {
                tracing::debug!(bytes = line.len(), "stdin: write+flush complete");
                Ok(())
            }
            Ok(Err(err)) => {
                tracing::error!(error = %err, "stdin: write failed");
                Err(SandboxError::StreamError {
                    message: format!("failed to write agent stdin: {err}"),
                })
            }
            Err(_) => {
                tracing::error!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "stdin: write timed out"
                );
                Err(SandboxError::Timeout {
                    phase: TimeoutPhase::Write,
                    message: Some(format!(
                        "agent did not accept input within {}ms",
                        self.timeout.as_millis()
                    )),
                })
            }
        }
    }
}

/// Owns one sandbox: provisioning, the agent process, the output pump and
/// teardown. Terminated and Failed are absorbing.
pub struct SandboxController {
    provider: Arc<dyn SandboxProvider>,
    config: SandboxConfig,
    options: BridgeOptions,
    bridge: Arc<CallBridge>,
    writer: Arc<FrameWriter>,
    state: watch::Sender<SandboxState>,
    handle: Mutex<Option<SandboxId>>,
    label: std::sync::Mutex<String>,
    failure: std::sync::Mutex<Option<SandboxError>>,
    events: Mutex<Option<mpsc::UnboundedSender<PumpEvent>>>,
    closing: AtomicBool,
    line_count: AtomicU64,
    created_at: Instant,
}

impl SandboxController {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        config: SandboxConfig,
        options: BridgeOptions,
        bridge: Arc<CallBridge>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SandboxState::Created);
        Arc::new(Self {
            provider,
            config,
            writer: bridge.writer(),
            options,
            bridge,
            state,
            handle: Mutex::new(None),
            label: std::sync::Mutex::new("unallocated".to_string()),
            failure: std::sync::Mutex::new(None),
            events: Mutex::new(None),
            closing: AtomicBool::new(false),
            line_count: AtomicU64::new(0),
            created_at: Instant::now(),
        })
    }

    pub fn state(&self) -> SandboxState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SandboxState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn bridge(&self) -> &Arc<CallBridge> {
        &self.bridge
    }

    /// First fatal error recorded for this sandbox.
    pub fn failure(&self) -> Option<SandboxError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn sandbox_id(&self) -> Option<SandboxId> {
        self.handle.lock().await.clone()
    }

    fn label(&self) -> String {
        self.label
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn transition(&self, next: SandboxState) -> bool {
        let mut from = None;
        let changed = self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                from = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        if let Some(from) = from {
            tracing::info!(
                sandbox_id = %self.label(),
                from = from.as_str(),
                to = next.as_str(),
                age_ms = self.created_at.elapsed().as_millis() as u64,
                "sandbox state transition"
            );
        }
        changed
    }

    /// Error describing why the sandbox cannot accept more work.
    fn unavailable(&self) -> SandboxError {
        match self.state() {
            SandboxState::Failed => self.failure().unwrap_or(SandboxError::Closed),
            SandboxState::Terminated | SandboxState::Draining => SandboxError::Closed,
            state => SandboxError::invalid_state(format!("sandbox is {}", state.as_str())),
        }
    }

    /// Allocates the sandbox and arms the overall execution deadline.
    pub async fn start(self: &Arc<Self>) -> Result<(), SandboxError> {
        if !self.transition(SandboxState::Provisioning) {
            return Err(self.unavailable());
        }

        let started = Instant::now();
        let timeout = self.config.provisioning_timeout();
        let created = tokio::time::timeout(timeout, self.provider.create(&self.config)).await;
        let id = match created {
            Ok(Ok(id)) => id,
            Ok(Err(err)) => {
                self.fail(err.clone()).await;
                return Err(err);
            }
            Err(_) => {
                let err = SandboxError::Timeout {
                    phase: TimeoutPhase::Provisioning,
                    message: Some(format!("sandbox not ready after {}s", timeout.as_secs())),
                };
                self.fail(err.clone()).await;
                return Err(err);
            }
        };

        *self.label.lock().unwrap_or_else(PoisonError::into_inner) = id.to_string();
        *self.handle.lock().await = Some(id.clone());
        if !self.transition(SandboxState::Ready) {
            // Closed while provisioning: release what we just got.
            self.teardown().await;
            return Err(self.unavailable());
        }

        tracing::info!(
            sandbox_id = %id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sandbox ready"
        );
        self.arm_execution_deadline();
        Ok(())
    }

    fn arm_execution_deadline(self: &Arc<Self>) {
        let deadline = self.config.execution_timeout();
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut state_rx = self.state.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {}
                _ = wait_terminal(&mut state_rx) => return,
            }
            let Some(controller) = weak.upgrade() else {
                return;
            };
            controller
                .fail(SandboxError::Timeout {
                    phase: TimeoutPhase::Execution,
                    message: Some(format!(
                        "sandbox exceeded its {}s execution timeout",
                        deadline.as_secs()
                    )),
                })
                .await;
        });
    }

    /// Starts the agent process and the output pump. Only one process may be
    /// attached to the sandbox.
    pub async fn launch(
        self: &Arc<Self>,
        launch: &LaunchSpec,
    ) -> Result<mpsc::UnboundedReceiver<PumpEvent>, SandboxError> {
        if self.state() != SandboxState::Ready {
            return Err(self.unavailable());
        }
        let id = self.sandbox_id().await.ok_or(SandboxError::Closed)?;

        let attach = tokio::time::timeout(
            self.config.provisioning_timeout(),
            self.provider.attach_io(&id, launch),
        )
        .await;
        let process = match attach {
            Ok(Ok(process)) => process,
            Ok(Err(err)) => {
                self.fail(err.clone()).await;
                return Err(err);
            }
            Err(_) => {
                let err = SandboxError::Timeout {
                    phase: TimeoutPhase::Provisioning,
                    message: Some("agent process did not attach in time".to_string()),
                };
                self.fail(err.clone()).await;
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let faults = self.bridge.subscribe_faults();
        self.writer.attach(process.stdin).await;
        *self.events.lock().await = Some(tx);
        if !self.transition(SandboxState::Running) {
            self.writer.detach().await;
            self.events.lock().await.take();
            return Err(self.unavailable());
        }

        let controller = self.clone();
        tokio::spawn(async move {
            controller.run_pump(process.stdout, process.exit, faults).await;
        });
        Ok(rx)
    }

    /// Writes a frame after checking the sandbox still runs. A failed write is
    /// fatal.
    pub async fn write_frame(self: &Arc<Self>, frame: &HostFrame) -> Result<(), SandboxError> {
        if self.state() != SandboxState::Running {
            return Err(self.unavailable());
        }
        match self.writer.send(frame).await {
            Ok(()) => Ok(()),
            Err(SandboxError::Closed) => Err(self.unavailable()),
            Err(err) => {
                self.fail(err.clone()).await;
                Err(err)
            }
        }
    }

    async fn publish(&self, event: PumpEvent) {
        if let Some(tx) = self.events.lock().await.as_ref() {
            let _ = tx.send(event);
        }
    }

    async fn run_pump(
        self: Arc<Self>,
        stdout: Box<dyn AsyncRead + Send + Unpin>,
        exit: oneshot::Receiver<ExitReport>,
        mut faults: mpsc::UnboundedReceiver<SandboxError>,
    ) {
        let mut lines = BufReader::new(stdout).lines();
        let mut state_rx = self.state.subscribe();
        let label = self.label();

        loop {
            let next = tokio::select! {
                biased;
                _ = wait_terminal(&mut state_rx) => {
                    tracing::debug!(sandbox_id = %label, "output pump stopped");
                    return;
                }
                Some(err) = faults.recv() => {
                    self.fail(err).await;
                    return;
                }
                line = lines.next_line() => line,
            };

            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => {
                    if !self.closing.load(Ordering::SeqCst) {
                        self.handle_end_of_stream(exit).await;
                    }
                    return;
                }
                Err(err) => {
                    if !self.closing.load(Ordering::SeqCst) {
                        self.fail(SandboxError::StreamError {
                            message: format!("failed to read agent output: {err}"),
                        })
                        .await;
                    }
                    return;
                }
            };

            let line_number = self.line_count.fetch_add(1, Ordering::Relaxed) + 1;
            match decode_line(&line) {
                Ok(None) => {}
                Ok(Some(SandboxFrame::Event(event))) => {
                    tracing::debug!(
                        sandbox_id = %label,
                        line_number = line_number,
                        kind = event.kind(),
                        "agent stdout: event"
                    );
                    if event.is_result() {
                        self.bridge.settle_observers().await;
                    }
                    self.publish(PumpEvent::Event(event)).await;
                }
                Ok(Some(SandboxFrame::Control(frame))) => {
                    if let Err(err) = self.bridge.dispatch(frame).await {
                        self.fail(err).await;
                        return;
                    }
                }
                Ok(Some(SandboxFrame::Observation(notice))) => {
                    self.bridge.observe(notice);
                }
                Err(err) => {
                    tracing::warn!(
                        sandbox_id = %label,
                        line_number = line_number,
                        error = %err,
                        raw = %preview(&line),
                        "agent stdout: undecodable line"
                    );
                    self.fail(err.into()).await;
                    return;
                }
            }
        }
    }

    async fn handle_end_of_stream(self: &Arc<Self>, exit: oneshot::Receiver<ExitReport>) {
        let report = tokio::time::timeout(self.options.close_grace(), exit)
            .await
            .ok()
            .and_then(Result::ok);
        tracing::info!(
            sandbox_id = %self.label(),
            total_lines = self.line_count.load(Ordering::Relaxed),
            exit_code = ?report.as_ref().and_then(|report| report.code),
            "agent stdout: stream ended"
        );

        match report {
            Some(report) if !report.success() => {
                self.fail(SandboxError::Terminated {
                    exit_code: report.code,
                    stderr: report.stderr,
                })
                .await;
            }
            report => {
                self.transition(SandboxState::Draining);
                self.publish(PumpEvent::Closed(report)).await;
            }
        }
    }

    /// Records a fatal error, moves to Failed and tears the sandbox down.
    /// Only the first failure is kept.
    pub(crate) async fn fail(self: &Arc<Self>, err: SandboxError) {
        {
            let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
            if failure.is_some() || self.state().is_terminal() {
                return;
            }
            *failure = Some(err.clone());
        }
        if !self.transition(SandboxState::Failed) {
            return;
        }
        tracing::error!(
            sandbox_id = %self.label(),
            error = %err,
            error_type = err.error_type().as_str(),
            "sandbox failed"
        );

        self.bridge.shutdown().await;
        self.writer.detach().await;
        self.publish(PumpEvent::Failed(err)).await;
        self.teardown().await;
    }

    /// Releases the sandbox on the provider, falling back to a forced
    /// termination when the provider does not confirm within the grace period.
    async fn teardown(&self) {
        let Some(id) = self.handle.lock().await.take() else {
            return;
        };
        let grace = self.options.close_grace();
        match tokio::time::timeout(grace, self.provider.terminate(&id)).await {
            Ok(Ok(())) => {
                tracing::info!(sandbox_id = %id, "sandbox terminated");
                return;
            }
            Ok(Err(err)) => {
                tracing::warn!(sandbox_id = %id, error = %err, "terminate failed, forcing");
            }
            Err(_) => {
                tracing::warn!(
                    sandbox_id = %id,
                    grace_ms = grace.as_millis() as u64,
                    "terminate not confirmed in time, forcing"
                );
            }
        }

        match tokio::time::timeout(grace, self.provider.force_terminate(&id)).await {
            Ok(Ok(())) => tracing::info!(sandbox_id = %id, "sandbox force terminated"),
            Ok(Err(err)) => {
                tracing::error!(sandbox_id = %id, error = %err, "force terminate failed")
            }
            Err(_) => tracing::error!(sandbox_id = %id, "force terminate timed out"),
        }
    }

    /// Cancels the pump, closes the agent's input and tears the sandbox down.
    /// Safe to call any number of times.
    pub async fn close(self: &Arc<Self>) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(
            sandbox_id = %self.label(),
            state = self.state().as_str(),
            age_ms = self.created_at.elapsed().as_millis() as u64,
            "closing sandbox"
        );

        self.bridge.shutdown().await;
        if let Some(tx) = self.events.lock().await.take() {
            let _ = tx.send(PumpEvent::Cancelled);
        }
        self.transition(SandboxState::Draining);
        self.writer.detach().await;
        self.teardown().await;
        self.transition(SandboxState::Terminated);
    }
}

async fn wait_terminal(state_rx: &mut watch::Receiver<SandboxState>) {
    let _ = state_rx.wait_for(SandboxState::is_terminal).await;
}

fn preview(line: &str) -> String {
    let trimmed = line.trim();
    if trimmed.len() <= RAW_PREVIEW_BYTES {
        return trimmed.to_string();
    }
    let mut end = RAW_PREVIEW_BYTES;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}
