//! In-memory sandbox provider driven by a scripted agent runtime.
//!
//! The runtime reacts to a handful of prompts:
//!
//! | prompt | behaviour |
//! |---|---|
//! | `list files` | `Bash` tool use, PreToolUse hook (when hooks are enabled), tool result, PostToolUse notice |
//! | `call server:tool {json}` | host tool request, answer echoed back |
//! | `parallel server:a server:b` | two host tool requests before waiting for either |
//! | `duplicate` | the same request id twice |
//! | `hang` | never finishes the turn |
//! | `crash` | exits with code 3 |
//! | `garbage` | writes a line that is not JSON |
//! | anything else | `echo: {prompt}` |

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sandbox_bridge_error::{ProvisionFailure, SandboxError};
use sandbox_bridge_schema::{
    decode_host_frame, ContentBlock, Decision, HostFrame, PromptFrame, ToolResponse,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::sync::oneshot;

use crate::options::{LaunchSpec, SandboxConfig};
use crate::provider::{AgentProcess, ExitReport, SandboxId, SandboxProvider};

const PIPE_CAPACITY: usize = 64 * 1024;
const CRASH_EXIT_CODE: i32 = 3;

#[derive(Debug, Clone, Default)]
struct Knobs {
    fail_allocation: bool,
    fail_image_build: bool,
    provision_delay: Option<Duration>,
    terminate_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct Recorded {
    created: Vec<SandboxId>,
    configs: Vec<SandboxConfig>,
    launches: Vec<LaunchSpec>,
    terminated: Vec<SandboxId>,
    force_terminated: Vec<SandboxId>,
    prompts: Vec<PromptFrame>,
    responses: Vec<HostFrame>,
}

#[derive(Debug, Default)]
struct Shared {
    knobs: Knobs,
    next_id: AtomicUsize,
    recorded: Mutex<Recorded>,
    runtimes: Mutex<HashMap<SandboxId, oneshot::Sender<()>>>,
}

impl Shared {
    fn record(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_runtime(&self, id: &SandboxId) {
        let stop = self
            .runtimes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
    }
}

/// A [`SandboxProvider`] whose sandboxes live in memory. Cheap to clone; all
/// clones share what they record.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProvider {
    shared: Arc<Shared>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_knobs(self, update: impl FnOnce(&mut Knobs)) -> Self {
        let mut knobs = self.shared.knobs.clone();
        update(&mut knobs);
        Self {
            shared: Arc::new(Shared {
                knobs,
                ..Shared::default()
            }),
        }
    }

    pub fn fail_allocation(self) -> Self {
        self.with_knobs(|knobs| knobs.fail_allocation = true)
    }

    pub fn fail_image_build(self) -> Self {
        self.with_knobs(|knobs| knobs.fail_image_build = true)
    }

    pub fn provision_delay(self, delay: Duration) -> Self {
        self.with_knobs(|knobs| knobs.provision_delay = Some(delay))
    }

    /// `terminate` takes this long, so short close grace periods fall back to
    /// `force_terminate`.
    pub fn slow_terminate(self, delay: Duration) -> Self {
        self.with_knobs(|knobs| knobs.terminate_delay = Some(delay))
    }

    pub fn created(&self) -> Vec<SandboxId> {
        self.shared.record().created.clone()
    }

    pub fn configs(&self) -> Vec<SandboxConfig> {
        self.shared.record().configs.clone()
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.shared.record().launches.clone()
    }

    pub fn terminated(&self) -> Vec<SandboxId> {
        self.shared.record().terminated.clone()
    }

    pub fn force_terminated(&self) -> Vec<SandboxId> {
        self.shared.record().force_terminated.clone()
    }

    /// Prompt frames the runtime received, in order.
    pub fn prompts(&self) -> Vec<PromptFrame> {
        self.shared.record().prompts.clone()
    }

    /// Hook and tool responses the runtime received, in order.
    pub fn responses(&self) -> Vec<HostFrame> {
        self.shared.record().responses.clone()
    }
}

#[async_trait]
impl SandboxProvider for ScriptedProvider {
    async fn create(&self, config: &SandboxConfig) -> Result<SandboxId, SandboxError> {
        let knobs = &self.shared.knobs;
        if let Some(delay) = knobs.provision_delay {
            tokio::time::sleep(delay).await;
        }
        if knobs.fail_allocation {
            return Err(SandboxError::Provision {
                reason: ProvisionFailure::Allocation,
                message: "no capacity in region".to_string(),
            });
        }
        if knobs.fail_image_build {
            return Err(SandboxError::Provision {
                reason: ProvisionFailure::ImageBuild,
                message: "step 3/5 exited with code 1".to_string(),
            });
        }

        let index = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = SandboxId::new(format!("scripted-{index}"));
        let mut recorded = self.shared.record();
        recorded.created.push(id.clone());
        recorded.configs.push(config.clone());
        Ok(id)
    }

    async fn attach_io(
        &self,
        id: &SandboxId,
        launch: &LaunchSpec,
    ) -> Result<AgentProcess, SandboxError> {
        {
            let runtimes = self.shared.runtimes.lock().unwrap_or_else(PoisonError::into_inner);
            if runtimes.contains_key(id) {
                return Err(SandboxError::invalid_state(format!(
                    "sandbox {id} already has a running agent process"
                )));
            }
        }
        self.shared.record().launches.push(launch.clone());

        let (host_stdin, agent_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (agent_stdout, host_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        self.shared
            .runtimes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), stop_tx);

        let runtime = ScriptedRuntime {
            shared: self.shared.clone(),
            input: BufReader::new(agent_stdin).lines(),
            output: agent_stdout,
            hooks_enabled: hooks_enabled(launch),
            session_id: format!("session-{id}"),
            next_request: 0,
            turns: 0,
        };
        tokio::spawn(async move {
            let report = tokio::select! {
                report = runtime.run() => report,
                _ = stop_rx => ExitReport { code: None, stderr: None },
            };
            let _ = exit_tx.send(report);
        });

        Ok(AgentProcess {
            stdin: Box::new(host_stdin),
            stdout: Box::new(host_stdout),
            exit: exit_rx,
        })
    }

    async fn terminate(&self, id: &SandboxId) -> Result<(), SandboxError> {
        if let Some(delay) = self.shared.knobs.terminate_delay {
            tokio::time::sleep(delay).await;
        }
        self.shared.stop_runtime(id);
        self.shared.record().terminated.push(id.clone());
        Ok(())
    }

    async fn force_terminate(&self, id: &SandboxId) -> Result<(), SandboxError> {
        self.shared.stop_runtime(id);
        self.shared.record().force_terminated.push(id.clone());
        Ok(())
    }
}

fn hooks_enabled(launch: &LaunchSpec) -> bool {
    launch
        .args
        .last()
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|options| options.get("_enable_hooks").and_then(Value::as_bool))
        .unwrap_or(false)
}

enum Reply {
    Hook {
        decision: Decision,
        reason: Option<String>,
        updated_input: Option<Value>,
    },
    Tool(ToolResponse),
}

struct ScriptedRuntime {
    shared: Arc<Shared>,
    input: Lines<BufReader<DuplexStream>>,
    output: DuplexStream,
    hooks_enabled: bool,
    session_id: String,
    next_request: usize,
    turns: u32,
}

type Step = Result<(), ExitReport>;

impl ScriptedRuntime {
    async fn run(mut self) -> ExitReport {
        loop {
            let frame = match self.next_frame().await {
                Ok(frame) => frame,
                Err(report) => return report,
            };
            let HostFrame::Prompt(prompt) = frame else {
                continue;
            };
            if let Some(resume) = &prompt.resume {
                self.session_id = resume.clone();
            }
            self.turns += 1;
            if let Err(report) = self.turn(prompt.prompt.trim()).await {
                return report;
            }
        }
    }

    /// Next frame from the controller. Responses are recorded as they arrive.
    async fn next_frame(&mut self) -> Result<HostFrame, ExitReport> {
        loop {
            let line = match self.input.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => return Err(ExitReport { code: Some(0), stderr: None }),
            };
            if line.trim().is_empty() {
                continue;
            }
            let Ok(frame) = decode_host_frame(&line) else {
                return Err(crashed("runtime received an undecodable frame"));
            };
            let mut recorded = self.shared.record();
            match &frame {
                HostFrame::Prompt(prompt) => recorded.prompts.push(prompt.clone()),
                other => recorded.responses.push(other.clone()),
            }
            drop(recorded);
            return Ok(frame);
        }
    }

    async fn wait_replies(&mut self, ids: &[String]) -> Result<HashMap<String, Reply>, ExitReport> {
        let mut waiting: HashSet<&String> = ids.iter().collect();
        let mut replies = HashMap::new();
        while !waiting.is_empty() {
            let (request_id, reply) = match self.next_frame().await? {
                HostFrame::HookResponse(response) => (
                    response.request_id,
                    Reply::Hook {
                        decision: response.decision,
                        reason: response.reason,
                        updated_input: response.updated_input,
                    },
                ),
                HostFrame::HostToolResponse(response) => {
                    (response.request_id.clone(), Reply::Tool(response))
                }
                HostFrame::Prompt(_) => return Err(crashed("prompt received mid-turn")),
            };
            if waiting.remove(&request_id) {
                replies.insert(request_id, reply);
            }
        }
        Ok(replies)
    }

    async fn wait_reply(&mut self, request_id: &str) -> Result<Reply, ExitReport> {
        let mut replies = self.wait_replies(&[request_id.to_string()]).await?;
        replies
            .remove(request_id)
            .ok_or_else(|| crashed("reply missing"))
    }

    fn request_id(&mut self) -> String {
        self.next_request += 1;
        format!("req-{}", self.next_request)
    }

    async fn emit(&mut self, value: Value) -> Step {
        self.emit_raw(&value.to_string()).await
    }

    async fn emit_raw(&mut self, line: &str) -> Step {
        let written = async {
            self.output.write_all(line.as_bytes()).await?;
            self.output.write_all(b"\n").await?;
            self.output.flush().await
        };
        written.await.map_err(|_| ExitReport { code: Some(0), stderr: None })
    }

    async fn assistant(&mut self, content: Value) -> Step {
        self.emit(json!({
            "_type": "message",
            "type": "assistant",
            "model": "scripted",
            "content": content,
        }))
        .await
    }

    async fn text(&mut self, text: &str) -> Step {
        self.assistant(json!([{ "type": "text", "text": text }])).await
    }

    async fn tool_result(&mut self, tool_use_id: &str, content: &str, is_error: bool) -> Step {
        self.emit(json!({
            "_type": "message",
            "type": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            }],
        }))
        .await
    }

    async fn result(&mut self, text: &str) -> Step {
        let value = json!({
            "_type": "message",
            "type": "result",
            "subtype": "success",
            "duration_ms": 12,
            "duration_api_ms": 8,
            "is_error": false,
            "num_turns": self.turns,
            "session_id": self.session_id,
            "total_cost_usd": 0.0,
            "result": text,
        });
        self.emit(value).await
    }

    async fn turn(&mut self, prompt: &str) -> Step {
        if self.turns == 1 {
            self.emit(json!({
                "type": "system",
                "subtype": "init",
                "data": { "session_id": self.session_id, "hooks": self.hooks_enabled },
            }))
            .await?;
        }

        match prompt {
            "list files" => self.list_files().await,
            "duplicate" => self.duplicate().await,
            "hang" => {
                self.text("Working on it...").await?;
                loop {
                    self.next_frame().await?;
                }
            }
            "crash" => {
                self.text("About to fail.").await?;
                Err(crashed("runner crashed: segmentation fault"))
            }
            "garbage" => {
                self.emit_raw("this is not json").await?;
                self.result("unreachable").await
            }
            _ => {
                if let Some(rest) = prompt.strip_prefix("call ") {
                    self.call_tool(rest).await
                } else if let Some(rest) = prompt.strip_prefix("parallel ") {
                    self.parallel(rest).await
                } else {
                    let reply = format!("echo: {prompt}");
                    self.text(&reply).await?;
                    self.result(&reply).await
                }
            }
        }
    }

    async fn list_files(&mut self) -> Step {
        let tool_use_id = format!("toolu_{}", self.turns);
        let mut input = json!({ "command": "ls" });
        self.assistant(json!([
            { "type": "text", "text": "Let me list the files." },
            { "type": "tool_use", "id": tool_use_id, "name": "Bash", "input": input },
        ]))
        .await?;

        if self.hooks_enabled {
            let request_id = self.request_id();
            self.emit(json!({
                "_type": "hook_request",
                "hook_event": "PreToolUse",
                "request_id": request_id,
                "tool_name": "Bash",
                "tool_input": input,
                "tool_use_id": tool_use_id,
                "session_id": self.session_id,
                "cwd": "/workspace",
            }))
            .await?;
            if let Reply::Hook {
                decision,
                reason,
                updated_input,
            } = self.wait_reply(&request_id).await?
            {
                if decision != Decision::Allow {
                    let reason = reason.unwrap_or_else(|| "denied".to_string());
                    let message = format!("Tool use denied: {reason}");
                    self.tool_result(&tool_use_id, &message, true).await?;
                    self.text("I was not allowed to run that command.").await?;
                    return self.result(&message).await;
                }
                if let Some(updated) = updated_input {
                    input = updated;
                }
            }
        }

        let command = input
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let listing = format!("$ {command}\nREADME.md\nsrc");
        self.tool_result(&tool_use_id, &listing, false).await?;

        if self.hooks_enabled {
            let request_id = self.request_id();
            self.emit(json!({
                "_type": "hook_request",
                "hook_event": "PostToolUse",
                "request_id": request_id,
                "tool_name": "Bash",
                "tool_input": input,
                "tool_result": listing,
                "is_error": false,
                "tool_use_id": tool_use_id,
                "session_id": self.session_id,
            }))
            .await?;
        }

        self.text("There are 2 entries: README.md and src.").await?;
        self.result("README.md, src").await
    }

    async fn call_tool(&mut self, spec: &str) -> Step {
        let (target, raw_args) = spec.split_once(' ').unwrap_or((spec, "{}"));
        let (server, tool) = target.split_once(':').unwrap_or(("", target));
        let args: Value = serde_json::from_str(raw_args).unwrap_or_else(|_| json!({}));
        let tool_use_id = format!("toolu_{}", self.turns);
        self.assistant(json!([{
            "type": "tool_use",
            "id": tool_use_id,
            "name": format!("mcp__{server}__{tool}"),
            "input": args,
        }]))
        .await?;

        let request_id = self.request_id();
        self.emit(json!({
            "_type": "host_tool_request",
            "request_id": request_id,
            "server_name": server,
            "tool_name": tool,
            "tool_input": args,
            "tool_use_id": tool_use_id,
        }))
        .await?;

        let (text, is_error) = match self.wait_reply(&request_id).await? {
            Reply::Tool(response) => (content_text(&response.content), response.is_error),
            Reply::Hook { .. } => ("unexpected hook response".to_string(), true),
        };
        self.tool_result(&tool_use_id, &text, is_error).await?;
        let summary = if is_error {
            format!("Tool failed: {text}")
        } else {
            format!("Tool returned: {text}")
        };
        self.text(&summary).await?;
        self.result(&summary).await
    }

    async fn parallel(&mut self, spec: &str) -> Step {
        let mut ids = Vec::new();
        for target in spec.split_whitespace() {
            let (server, tool) = target.split_once(':').unwrap_or(("", target));
            let request_id = self.request_id();
            self.emit(json!({
                "_type": "host_tool_request",
                "request_id": request_id,
                "server_name": server,
                "tool_name": tool,
                "tool_input": {},
            }))
            .await?;
            ids.push(request_id);
        }

        let replies = self.wait_replies(&ids).await?;
        let mut texts = Vec::new();
        for id in &ids {
            if let Some(Reply::Tool(response)) = replies.get(id) {
                texts.push(content_text(&response.content));
            }
        }
        let summary = texts.join(", ");
        self.text(&summary).await?;
        self.result(&summary).await
    }

    async fn duplicate(&mut self) -> Step {
        let request_id = self.request_id();
        for _ in 0..2 {
            self.emit(json!({
                "_type": "host_tool_request",
                "request_id": request_id,
                "server_name": "slow",
                "tool_name": "wait",
                "tool_input": {},
            }))
            .await?;
        }
        self.wait_reply(&request_id).await?;
        self.result("duplicate sent").await
    }
}

fn content_text(content: &[ContentBlock]) -> String {
    content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text(text) => Some(text.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

fn crashed(stderr: &str) -> ExitReport {
    ExitReport {
        code: Some(CRASH_EXIT_CODE),
        stderr: Some(stderr.to_string()),
    }
}
