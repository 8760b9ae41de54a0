use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{AgentEvent, ContentBlock};

/// A bridge request emitted by the sandbox. Exactly one response is owed for it.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    Hook(HookInvocation),
    Tool(ToolInvocation),
}

impl ControlFrame {
    pub fn request_id(&self) -> &str {
        match self {
            Self::Hook(hook) => &hook.request_id,
            Self::Tool(tool) => &tool.request_id,
        }
    }

    /// Name used when logging or matching capabilities.
    pub fn tool_name(&self) -> &str {
        match self {
            Self::Hook(hook) => &hook.tool_name,
            Self::Tool(tool) => &tool.tool_name,
        }
    }
}

/// PreToolUse: may the named tool call proceed?
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookInvocation {
    pub request_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// Run a host-side tool and send its result back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub request_id: String,
    #[serde(default)]
    pub server_name: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
}

/// PostToolUse notice. The sandbox does not wait for an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostToolUseNotice {
    #[serde(default)]
    pub request_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub tool_result: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
    Ask,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Ask => "ask",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookResponse {
    pub request_id: String,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
}

impl HookResponse {
    pub fn allow(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            decision: Decision::Allow,
            reason: None,
            updated_input: None,
        }
    }

    pub fn deny(request_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            decision: Decision::Deny,
            reason: Some(reason.into()),
            updated_input: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub request_id: String,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResponse {
    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            content: vec![ContentBlock::text(message)],
            is_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlResponse {
    Hook(HookResponse),
    Tool(ToolResponse),
}

impl ControlResponse {
    pub fn request_id(&self) -> &str {
        match self {
            Self::Hook(hook) => &hook.request_id,
            Self::Tool(tool) => &tool.request_id,
        }
    }

    pub fn into_frame(self) -> HostFrame {
        match self {
            Self::Hook(hook) => HostFrame::HookResponse(hook),
            Self::Tool(tool) => HostFrame::HostToolResponse(tool),
        }
    }
}

/// Starts a new turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptFrame {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<String>,
}

/// A line written by the controller onto the sandbox's input stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type", rename_all = "snake_case")]
pub enum HostFrame {
    Prompt(PromptFrame),
    HookResponse(HookResponse),
    HostToolResponse(ToolResponse),
}

/// A decoded line read from the sandbox's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxFrame {
    Event(AgentEvent),
    Control(ControlFrame),
    Observation(PostToolUseNotice),
}
