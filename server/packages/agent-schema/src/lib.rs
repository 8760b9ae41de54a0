//! Wire types shared by the controller and the agent runtime running inside a
//! sandbox, and the codec that turns output lines into typed frames.

pub mod codec;
pub mod control;
pub mod events;

pub use codec::{
    decode_event, decode_host_frame, decode_line, encode_host_frame, encode_sandbox_frame,
    DecodeError, TYPE_FIELD,
};
pub use control::{
    ControlFrame, ControlResponse, Decision, HookInvocation, HookResponse, HostFrame,
    PostToolUseNotice, PromptFrame, SandboxFrame, ToolInvocation, ToolResponse,
};
pub use events::{
    AgentEvent, AssistantEvent, ContentBlock, ResultEvent, StreamEvent, SystemEvent, TextBlock,
    ThinkingBlock, ToolResultBlock, ToolUseBlock, UserContent, UserEvent,
};
