//! Drives a coding agent running inside a remote sandbox: provisions the
//! sandbox, streams the agent's events back, and answers the hook and host
//! tool calls the agent makes while it works.

pub mod bridge;
pub mod capabilities;
pub mod cli;
pub mod lifecycle;
pub mod options;
pub mod provider;
pub mod query;
pub mod session;
pub mod testing;

pub use bridge::{CallBridge, CallKind, PendingCallInfo, DEFAULT_DENY_REASON};
pub use capabilities::{
    normalize_tool_result, Capabilities, CapabilitiesBuilder, Capability, CapabilityFailure,
    HookContext, HookOutcome, HookSpec, HostTool, HostToolServer, ObserverSpec, ToolFilter,
};
pub use lifecycle::{FrameWriter, PumpEvent, SandboxController, SandboxState};
pub use options::{
    AgentOptions, BridgeOptions, LaunchSpec, PermissionMode, SandboxConfig, SessionOptions,
};
pub use provider::{AgentProcess, ExitReport, LocalProcessProvider, SandboxId, SandboxProvider};
pub use query::{query, QueryStream};
pub use session::{Session, SessionStatus, TurnRecord, TurnStream};

pub use sandbox_bridge_error::{ErrorReport, ErrorType, SandboxError};
pub use sandbox_bridge_schema as schema;
