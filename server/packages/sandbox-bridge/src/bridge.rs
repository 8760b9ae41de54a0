//! Routes control frames from the sandbox to controller-side capabilities and
//! writes exactly one correlated response for each of them.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use sandbox_bridge_error::{ErrorReport, SandboxError};
use sandbox_bridge_schema::{
    ControlFrame, ControlResponse, Decision, HookInvocation, HookResponse, PostToolUseNotice,
    ToolInvocation, ToolResponse,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};

use crate::capabilities::{normalize_tool_result, Capabilities, HookContext};
use crate::lifecycle::FrameWriter;
use crate::options::BridgeOptions;

pub const DEFAULT_DENY_REASON: &str = "Blocked by host hook";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Hook,
    Tool,
}

impl CallKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Hook => "hook",
            Self::Tool => "tool",
        }
    }
}

#[derive(Debug)]
struct PendingCall {
    kind: CallKind,
    tool_name: String,
    created_at: Instant,
    deadline: Instant,
    task: AbortHandle,
}

/// Snapshot of one in-flight call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCallInfo {
    pub request_id: String,
    pub kind: CallKind,
    pub tool_name: String,
    pub remaining: Duration,
}

pub struct CallBridge {
    capabilities: Arc<Capabilities>,
    options: BridgeOptions,
    writer: Arc<FrameWriter>,
    pending: Mutex<HashMap<String, PendingCall>>,
    warnings: std::sync::Mutex<Vec<ErrorReport>>,
    observers: std::sync::Mutex<Vec<ObserverRun>>,
    faults: std::sync::Mutex<Option<mpsc::UnboundedSender<SandboxError>>>,
    shutting_down: AtomicBool,
}

#[derive(Debug)]
struct ObserverRun {
    request_id: String,
    tool_name: String,
    task: JoinHandle<()>,
}

impl CallBridge {
    pub fn new(capabilities: Arc<Capabilities>, options: BridgeOptions) -> Arc<Self> {
        Arc::new(Self {
            capabilities,
            writer: Arc::new(FrameWriter::new(options.write_timeout())),
            options,
            pending: Mutex::new(HashMap::new()),
            warnings: std::sync::Mutex::new(Vec::new()),
            observers: std::sync::Mutex::new(Vec::new()),
            faults: std::sync::Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn capabilities(&self) -> &Arc<Capabilities> {
        &self.capabilities
    }

    pub(crate) fn writer(&self) -> Arc<FrameWriter> {
        self.writer.clone()
    }

    pub async fn pending_calls(&self) -> Vec<PendingCallInfo> {
        let now = Instant::now();
        let pending = self.pending.lock().await;
        let mut calls: Vec<_> = pending
            .iter()
            .map(|(request_id, call)| PendingCallInfo {
                request_id: request_id.clone(),
                kind: call.kind,
                tool_name: call.tool_name.clone(),
                remaining: call.deadline.saturating_duration_since(now),
            })
            .collect();
        calls.sort_by(|a, b| a.request_id.cmp(&b.request_id));
        calls
    }

    /// Response writes that failed. Each one leaves the agent waiting on an
    /// answer, so the receiver treats it as fatal. Replaces any earlier
    /// receiver.
    pub(crate) fn subscribe_faults(&self) -> mpsc::UnboundedReceiver<SandboxError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.faults.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    fn report_fault(&self, err: SandboxError) {
        if self.shutting_down.load(Ordering::SeqCst) || matches!(err, SandboxError::Closed) {
            return;
        }
        if let Some(tx) = self
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = tx.send(err);
        }
    }

    /// Capability failures recorded since the last call.
    pub fn take_warnings(&self) -> Vec<ErrorReport> {
        std::mem::take(&mut *self.warnings.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn warn(&self, request_id: &str, err: SandboxError) {
        tracing::warn!(request_id = %request_id, error = %err, "capability failed");
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(err.to_report());
    }

    /// Registers the call and starts evaluating it on its own task. Returns
    /// without waiting for the capability. A request id that is already
    /// pending is a protocol violation.
    pub async fn dispatch(self: &Arc<Self>, frame: ControlFrame) -> Result<(), SandboxError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            tracing::debug!(request_id = %frame.request_id(), "bridge shut down, dropping call");
            return Ok(());
        }

        let request_id = frame.request_id().to_string();
        let tool_name = frame.tool_name().to_string();
        let (kind, timeout) = match &frame {
            ControlFrame::Hook(_) => (CallKind::Hook, self.options.hook_timeout()),
            ControlFrame::Tool(_) => (CallKind::Tool, self.options.tool_timeout()),
        };

        let mut pending = self.pending.lock().await;
        if pending.contains_key(&request_id) {
            tracing::error!(
                request_id = %request_id,
                kind = kind.as_str(),
                "duplicate request id while a call is pending"
            );
            return Err(SandboxError::protocol(format!(
                "duplicate request_id '{request_id}' while a call with that id is pending"
            )));
        }

        tracing::info!(
            request_id = %request_id,
            kind = kind.as_str(),
            tool = %tool_name,
            pending_count = pending.len() + 1,
            timeout_ms = timeout.as_millis() as u64,
            "bridge: call received"
        );

        let bridge = self.clone();
        let task = tokio::spawn(async move {
            let response = match frame {
                ControlFrame::Hook(invocation) => {
                    ControlResponse::Hook(bridge.evaluate_hooks(invocation, timeout).await)
                }
                ControlFrame::Tool(invocation) => {
                    ControlResponse::Tool(bridge.run_tool(invocation, timeout).await)
                }
            };
            bridge.resolve(response).await;
        });

        let created_at = Instant::now();
        pending.insert(
            request_id,
            PendingCall {
                kind,
                tool_name,
                created_at,
                deadline: created_at + timeout,
                task: task.abort_handle(),
            },
        );
        Ok(())
    }

    /// Runs matching hooks in registration order. The first decision other than
    /// `allow` wins; an `allow` may rewrite the input seen by later hooks.
    async fn evaluate_hooks(&self, invocation: HookInvocation, timeout: Duration) -> HookResponse {
        let request_id = invocation.request_id.clone();
        let hooks: Vec<_> = self
            .capabilities
            .matching_hooks(&invocation.tool_name)
            .cloned()
            .collect();
        if hooks.is_empty() {
            return HookResponse::allow(request_id);
        }

        let original_input = invocation.tool_input.clone();
        let mut ctx = HookContext::from(&invocation);
        let mut current = String::new();
        let chain = async {
            for hook in &hooks {
                current = hook.name.clone();
                let outcome = hook.call(ctx.clone()).await.map_err(|failure| failure.message)?;
                match outcome.decision {
                    Decision::Allow => {
                        if let Some(updated) = outcome.updated_input {
                            ctx.tool_input = updated;
                        }
                    }
                    Decision::Deny => {
                        let reason = outcome
                            .reason
                            .unwrap_or_else(|| DEFAULT_DENY_REASON.to_string());
                        tracing::info!(
                            request_id = %request_id,
                            hook = %hook.name,
                            reason = %reason,
                            "bridge: hook denied tool call"
                        );
                        return Ok(HookResponse::deny(request_id.clone(), reason));
                    }
                    Decision::Ask => {
                        return Ok(HookResponse {
                            request_id: request_id.clone(),
                            decision: Decision::Ask,
                            reason: outcome.reason,
                            updated_input: None,
                        });
                    }
                }
            }

            let mut response = HookResponse::allow(request_id.clone());
            if ctx.tool_input != original_input {
                response.updated_input = Some(ctx.tool_input.clone());
            }
            Ok::<_, String>(response)
        };

        let outcome = tokio::time::timeout(timeout, AssertUnwindSafe(chain).catch_unwind()).await;
        let failure = match outcome {
            Ok(Ok(Ok(response))) => return response,
            Ok(Ok(Err(message))) => message,
            Ok(Err(_)) => "hook panicked".to_string(),
            Err(_) => format!("hook timed out after {}ms", timeout.as_millis()),
        };
        self.warn(
            &request_id,
            SandboxError::Capability {
                name: current.clone(),
                message: failure.clone(),
            },
        );
        HookResponse::deny(request_id, format!("hook '{current}' failed: {failure}"))
    }

    async fn run_tool(&self, invocation: ToolInvocation, timeout: Duration) -> ToolResponse {
        let request_id = invocation.request_id;
        let Some((server, tool)) = self
            .capabilities
            .find_tool(&invocation.server_name, &invocation.tool_name)
        else {
            tracing::warn!(
                request_id = %request_id,
                server = %invocation.server_name,
                tool = %invocation.tool_name,
                "bridge: no capability registered for tool"
            );
            return ToolResponse::error(
                request_id,
                format!(
                    "no capability registered for tool '{}' on server '{}'",
                    invocation.tool_name, invocation.server_name
                ),
            );
        };

        let name = format!("{}:{}", server.name, tool.name);
        let call = tool.call(invocation.tool_input);
        let outcome = tokio::time::timeout(timeout, AssertUnwindSafe(call).catch_unwind()).await;
        let failure = match outcome {
            Ok(Ok(Ok(value))) => {
                return ToolResponse {
                    request_id,
                    content: normalize_tool_result(value),
                    is_error: false,
                }
            }
            Ok(Ok(Err(failure))) => failure.message,
            Ok(Err(_)) => "tool panicked".to_string(),
            Err(_) => format!("tool timed out after {}ms", timeout.as_millis()),
        };
        self.warn(
            &request_id,
            SandboxError::Capability {
                name,
                message: failure.clone(),
            },
        );
        ToolResponse::error(request_id, format!("Error executing tool: {failure}"))
    }

    /// Writes the response if the call is still pending, then drops the entry.
    async fn resolve(&self, response: ControlResponse) {
        let request_id = response.request_id().to_string();
        let age_ms = {
            let pending = self.pending.lock().await;
            match pending.get(&request_id) {
                Some(call) => call.created_at.elapsed().as_millis() as u64,
                None => {
                    tracing::debug!(request_id = %request_id, "bridge: call no longer pending");
                    return;
                }
            }
        };

        let frame = response.into_frame();
        if let Err(err) = self.writer.send(&frame).await {
            tracing::error!(request_id = %request_id, error = %err, "bridge: failed to write response");
            self.report_fault(err);
        }

        let remaining = {
            let mut pending = self.pending.lock().await;
            pending.remove(&request_id);
            pending.len()
        };
        tracing::info!(
            request_id = %request_id,
            age_ms = age_ms,
            pending_count = remaining,
            "bridge: call resolved"
        );
    }

    /// Runs PostToolUse observers off the pump path. Nothing is written back.
    pub fn observe(self: &Arc<Self>, notice: PostToolUseNotice) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let observers: Vec<_> = self
            .capabilities
            .matching_observers(&notice.tool_name)
            .cloned()
            .collect();
        if observers.is_empty() {
            return;
        }

        let bridge = self.clone();
        let timeout = self.options.hook_timeout();
        let request_id = notice.request_id.clone();
        let tool_name = notice.tool_name.clone();
        let task = tokio::spawn(async move {
            for observer in observers {
                let call = AssertUnwindSafe(observer.call(notice.clone())).catch_unwind();
                let failure = match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(Ok(()))) => continue,
                    Ok(Ok(Err(failure))) => failure.message,
                    Ok(Err(_)) => "observer panicked".to_string(),
                    Err(_) => format!("observer timed out after {}ms", timeout.as_millis()),
                };
                bridge.warn(
                    &notice.request_id,
                    SandboxError::Capability {
                        name: observer.name.clone(),
                        message: failure,
                    },
                );
            }
        });

        let mut runs = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        runs.retain(|run| !run.task.is_finished());
        runs.push(ObserverRun {
            request_id,
            tool_name,
            task,
        });
    }

    fn take_observer_runs(&self) -> Vec<ObserverRun> {
        std::mem::take(&mut *self.observers.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Waits, up to the hook timeout, for observers still running, so their
    /// warnings land in the turn that triggered them. Stragglers are aborted
    /// and reported.
    pub(crate) async fn settle_observers(&self) {
        let mut runs = self.take_observer_runs();
        if runs.is_empty() {
            return;
        }
        let timeout = self.options.hook_timeout();
        let all = futures::future::join_all(runs.iter_mut().map(|run| &mut run.task));
        if tokio::time::timeout(timeout, all).await.is_ok() {
            return;
        }
        for run in runs.into_iter().filter(|run| !run.task.is_finished()) {
            run.task.abort();
            self.warn(
                &run.request_id,
                SandboxError::Capability {
                    name: format!("observers of {}", run.tool_name),
                    message: format!(
                        "still running {}ms after the turn ended",
                        timeout.as_millis()
                    ),
                },
            );
        }
    }

    /// Cancels every in-flight call and refuses new ones.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            tracing::info!(pending_count = pending.len(), "bridge: cancelling pending calls");
        }
        for (_, call) in pending.drain() {
            call.task.abort();
        }
        drop(pending);
        for run in self.take_observer_runs() {
            run.task.abort();
        }
    }
}
