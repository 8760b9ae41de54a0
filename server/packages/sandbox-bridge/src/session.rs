use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use sandbox_bridge_error::{ErrorReport, SandboxError};
use sandbox_bridge_schema::{AgentEvent, HostFrame, PromptFrame, ResultEvent};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::bridge::CallBridge;
use crate::capabilities::Capabilities;
use crate::lifecycle::{PumpEvent, SandboxController, SandboxState};
use crate::options::{AgentOptions, SessionOptions};
use crate::provider::SandboxProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Unopened,
    Open,
    Closed,
}

/// One completed prompt-to-result cycle.
#[derive(Debug, Clone, Serialize)]
pub struct TurnRecord {
    pub prompt: String,
    /// Every visible event of the turn, the result included.
    pub events: Vec<AgentEvent>,
    pub result: ResultEvent,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ErrorReport>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct InFlightTurn {
    prompt: String,
    events: Vec<AgentEvent>,
    started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct SessionState {
    status: SessionStatus,
    opening: bool,
    events: Option<mpsc::UnboundedReceiver<PumpEvent>>,
    turn: Option<InFlightTurn>,
    history: Vec<TurnRecord>,
    resume: Option<String>,
}

struct SessionInner {
    id: String,
    agent: AgentOptions,
    controller: Arc<SandboxController>,
    state: Mutex<SessionState>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let status = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .status;
        let sandbox = self.controller.state();
        if status == SessionStatus::Closed
            || sandbox == SandboxState::Created
            || sandbox.is_terminal()
        {
            return;
        }

        // Dropped without close, possibly while opening: release the sandbox.
        let controller = self.controller.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::info!(
                    session_id = %self.id,
                    sandbox_state = sandbox.as_str(),
                    "session dropped while open, releasing sandbox"
                );
                handle.spawn(async move { controller.close().await });
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %self.id,
                    "session dropped outside a runtime, sandbox not released"
                );
            }
        }
    }
}

/// A conversation with one agent in one sandbox. Turns run strictly one after
/// another. Cloning shares the same session. Dropping the last clone without
/// [`Session::close`] still releases the sandbox in the background.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .field("sandbox_state", &self.sandbox_state())
            .finish()
    }
}

impl Session {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        options: SessionOptions,
        capabilities: Capabilities,
    ) -> Result<Self, SandboxError> {
        options.validate()?;
        let SessionOptions {
            sandbox,
            agent,
            bridge,
        } = options;

        let call_bridge = CallBridge::new(Arc::new(capabilities), bridge.clone());
        let controller = SandboxController::new(provider, sandbox, bridge, call_bridge);
        let id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(session_id = %id, "session created");

        Ok(Self {
            inner: Arc::new(SessionInner {
                id,
                state: Mutex::new(SessionState {
                    status: SessionStatus::Unopened,
                    opening: false,
                    events: None,
                    turn: None,
                    history: Vec::new(),
                    resume: agent.resume.clone(),
                }),
                agent,
                controller,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    pub fn sandbox_state(&self) -> SandboxState {
        self.inner.controller.state()
    }

    pub fn controller(&self) -> &Arc<SandboxController> {
        &self.inner.controller
    }

    /// Session id the next prompt will resume.
    pub fn resume_id(&self) -> Option<String> {
        self.lock().resume.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_open(&self, state: &SessionState) -> Result<(), SandboxError> {
        match state.status {
            SessionStatus::Open => Ok(()),
            SessionStatus::Closed => Err(SandboxError::Closed),
            SessionStatus::Unopened => match self.inner.controller.failure() {
                Some(err) => Err(err),
                None => Err(SandboxError::invalid_state("session is not open")),
            },
        }
    }

    /// Provisions the sandbox and launches the agent. Calling it on an open
    /// session does nothing.
    pub async fn open(&self) -> Result<(), SandboxError> {
        {
            let mut state = self.lock();
            match state.status {
                SessionStatus::Open => return Ok(()),
                SessionStatus::Closed => return Err(SandboxError::Closed),
                SessionStatus::Unopened if state.opening => {
                    return Err(SandboxError::invalid_state("session is already opening"))
                }
                SessionStatus::Unopened => {
                    if let Some(err) = self.inner.controller.failure() {
                        return Err(err);
                    }
                    state.opening = true;
                }
            }
        }

        let controller = &self.inner.controller;
        let launch = self
            .inner
            .agent
            .launch_command(controller.bridge().capabilities());
        let opened = async {
            controller.start().await?;
            controller.launch(&launch).await
        }
        .await;

        let mut state = self.lock();
        state.opening = false;
        let events = opened?;
        if state.status == SessionStatus::Closed {
            return Err(SandboxError::Closed);
        }
        state.events = Some(events);
        state.status = SessionStatus::Open;
        tracing::info!(session_id = %self.inner.id, "session open");
        Ok(())
    }

    /// Sends a prompt. Fails with [`SandboxError::TurnInProgress`] while the
    /// previous turn has not produced its result.
    pub async fn send_turn(&self, prompt: impl Into<String>) -> Result<(), SandboxError> {
        let prompt = prompt.into();
        let resume = {
            let mut state = self.lock();
            self.check_open(&state)?;
            if state.turn.is_some() {
                return Err(SandboxError::TurnInProgress);
            }
            state.turn = Some(InFlightTurn {
                prompt: prompt.clone(),
                events: Vec::new(),
                started_at: Utc::now(),
            });
            state.resume.clone()
        };

        tracing::info!(
            session_id = %self.inner.id,
            prompt_bytes = prompt.len(),
            resume = ?resume,
            "sending turn"
        );
        let frame = HostFrame::Prompt(PromptFrame { prompt, resume });
        if let Err(err) = self.inner.controller.write_frame(&frame).await {
            self.lock().turn = None;
            return Err(err);
        }
        Ok(())
    }

    /// Events of the turn in flight, ending with its result. Dropping the
    /// stream early keeps the turn; calling this again resumes it.
    pub fn stream_turn(&self) -> Result<TurnStream, SandboxError> {
        let mut state = self.lock();
        self.check_open(&state)?;
        if state.turn.is_none() {
            return Err(SandboxError::invalid_state("no turn in progress"));
        }
        let events = state
            .events
            .take()
            .ok_or_else(|| SandboxError::invalid_state("turn is already being streamed"))?;
        Ok(TurnStream {
            session: self.clone(),
            events: Some(UnboundedReceiverStream::new(events)),
            finished: false,
            warnings: Vec::new(),
        })
    }

    /// `send_turn` followed by `stream_turn`.
    pub async fn run_turn(&self, prompt: impl Into<String>) -> Result<TurnStream, SandboxError> {
        self.send_turn(prompt).await?;
        self.stream_turn()
    }

    /// Tears the sandbox down. A turn being streamed ends with
    /// [`SandboxError::Cancelled`]. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.lock();
            if state.status == SessionStatus::Closed {
                return;
            }
            state.status = SessionStatus::Closed;
            state.turn = None;
        }
        tracing::info!(session_id = %self.inner.id, "closing session");
        self.inner.controller.close().await;
    }

    /// Copy of the completed turns, oldest first.
    pub fn history(&self) -> Vec<TurnRecord> {
        self.lock().history.clone()
    }

    pub fn export_history(&self) -> Result<String, SandboxError> {
        let history = self.history();
        serde_json::to_string_pretty(&history).map_err(|err| {
            SandboxError::invalid_state(format!("failed to serialize history: {err}"))
        })
    }

    /// Forgets completed turns and the resume id, so the next prompt starts a
    /// fresh conversation in the same sandbox.
    pub fn clear_history(&self) {
        let mut state = self.lock();
        state.history.clear();
        state.resume = None;
    }

    fn record_event(&self, event: &AgentEvent) -> Option<Vec<ErrorReport>> {
        let mut state = self.lock();
        let turn = state.turn.as_mut()?;
        turn.events.push(event.clone());
        let AgentEvent::Result(result) = event else {
            return None;
        };

        let turn = state.turn.take()?;
        let warnings = self.inner.controller.bridge().take_warnings();
        for warning in &warnings {
            tracing::warn!(
                session_id = %self.inner.id,
                warning = %warning.message,
                "capability warning during turn"
            );
        }
        if !result.session_id.is_empty() {
            state.resume = Some(result.session_id.clone());
        }
        state.history.push(TurnRecord {
            prompt: turn.prompt,
            events: turn.events,
            result: result.clone(),
            warnings: warnings.clone(),
            started_at: turn.started_at,
            completed_at: Utc::now(),
        });
        tracing::info!(
            session_id = %self.inner.id,
            turns = state.history.len(),
            is_error = result.is_error,
            "turn complete"
        );
        Some(warnings)
    }

    fn abandon_turn(&self) {
        self.lock().turn = None;
    }

    fn return_events(&self, events: mpsc::UnboundedReceiver<PumpEvent>) {
        let mut state = self.lock();
        if state.status == SessionStatus::Open {
            state.events = Some(events);
        }
    }
}

/// Visible events of one turn. Control frames never appear here; the stream
/// ends right after the result event.
pub struct TurnStream {
    session: Session,
    events: Option<UnboundedReceiverStream<PumpEvent>>,
    finished: bool,
    warnings: Vec<ErrorReport>,
}

impl TurnStream {
    /// Capability failures of this turn. Filled once the result arrived.
    ///
    /// This is where hook, tool and observer failures surface: they never end
    /// the turn or appear as events. Each one is also logged at warn level and
    /// kept on the turn's [`TurnRecord`].
    pub fn warnings(&self) -> &[ErrorReport] {
        &self.warnings
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn finish(&mut self, keep_receiver: bool) {
        self.finished = true;
        if let Some(events) = self.events.take() {
            if keep_receiver {
                self.session.return_events(events.into_inner());
            }
        }
    }
}

impl Stream for TurnStream {
    type Item = Result<AgentEvent, SandboxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }
        let Some(events) = this.events.as_mut() else {
            this.finished = true;
            return Poll::Ready(None);
        };

        match events.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(PumpEvent::Event(event))) => {
                if let Some(warnings) = this.session.record_event(&event) {
                    this.warnings = warnings;
                    this.finish(true);
                }
                Poll::Ready(Some(Ok(event)))
            }
            Poll::Ready(Some(PumpEvent::Closed(report))) => {
                this.session.abandon_turn();
                this.finish(false);
                let report = report.unwrap_or_default();
                Poll::Ready(Some(Err(SandboxError::Terminated {
                    exit_code: report.code,
                    stderr: report.stderr,
                })))
            }
            Poll::Ready(Some(PumpEvent::Failed(err))) => {
                this.session.abandon_turn();
                this.finish(false);
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(Some(PumpEvent::Cancelled)) | Poll::Ready(None) => {
                this.session.abandon_turn();
                this.finish(false);
                Poll::Ready(Some(Err(SandboxError::Cancelled)))
            }
        }
    }
}

impl Drop for TurnStream {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(true);
        }
    }
}
