//! Controller-side hooks, observers and host tools.
//!
//! A [`Capabilities`] table is assembled once, before a session opens, and is
//! shared read-only with the call bridge afterwards. Nothing here is global.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use sandbox_bridge_error::SandboxError;
use sandbox_bridge_schema::{ContentBlock, Decision, HookInvocation, PostToolUseNotice};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;

/// Error raised by a capability callback. Converted into a default response by
/// the bridge and reported as a warning on the turn.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CapabilityFailure {
    pub message: String,
}

impl CapabilityFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for CapabilityFailure {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for CapabilityFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for CapabilityFailure {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// What a hook sees about the pending tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct HookContext {
    pub request_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub tool_use_id: Option<String>,
    pub session_id: Option<String>,
    pub cwd: Option<String>,
}

impl From<&HookInvocation> for HookContext {
    fn from(invocation: &HookInvocation) -> Self {
        Self {
            request_id: invocation.request_id.clone(),
            tool_name: invocation.tool_name.clone(),
            tool_input: invocation.tool_input.clone(),
            tool_use_id: invocation.tool_use_id.clone(),
            session_id: invocation.session_id.clone(),
            cwd: invocation.cwd.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HookOutcome {
    pub decision: Decision,
    pub reason: Option<String>,
    /// Replacement tool input. Only honored on `allow`.
    pub updated_input: Option<Value>,
}

impl HookOutcome {
    pub fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            reason: None,
            updated_input: None,
        }
    }

    pub fn allow_with_input(updated_input: Value) -> Self {
        Self {
            decision: Decision::Allow,
            reason: None,
            updated_input: Some(updated_input),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Deny,
            reason: Some(reason.into()),
            updated_input: None,
        }
    }

    pub fn ask(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Ask,
            reason: Some(reason.into()),
            updated_input: None,
        }
    }
}

type HookFn =
    Arc<dyn Fn(HookContext) -> BoxFuture<'static, Result<HookOutcome, CapabilityFailure>> + Send + Sync>;
type ObserverFn =
    Arc<dyn Fn(PostToolUseNotice) -> BoxFuture<'static, Result<(), CapabilityFailure>> + Send + Sync>;
type ToolFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, CapabilityFailure>> + Send + Sync>;

/// Regular expression matched against the whole tool name.
#[derive(Clone)]
pub struct ToolFilter {
    pattern: String,
    regex: Arc<regress::Regex>,
}

impl ToolFilter {
    pub fn new(pattern: &str) -> Result<Self, SandboxError> {
        let anchored = format!("^(?:{pattern})$");
        let regex = regress::Regex::new(&anchored).map_err(|err| SandboxError::InvalidConfig {
            message: format!("invalid tool filter '{pattern}': {err}"),
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex: Arc::new(regex),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, tool_name: &str) -> bool {
        self.regex.find(tool_name).is_some()
    }
}

impl fmt::Debug for ToolFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ToolFilter").field(&self.pattern).finish()
    }
}

/// A named PreToolUse hook, optionally restricted by a tool-name filter.
#[derive(Clone)]
pub struct HookSpec {
    name: String,
    filter: Option<String>,
    callback: HookFn,
}

impl HookSpec {
    pub fn new<F, Fut>(name: impl Into<String>, filter: Option<&str>, callback: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HookOutcome, CapabilityFailure>> + Send + 'static,
    {
        Self {
            name: name.into(),
            filter: filter.map(str::to_string),
            callback: Arc::new(move |ctx| callback(ctx).boxed()),
        }
    }
}

/// A named PostToolUse observer. Runs after the tool, cannot change anything.
#[derive(Clone)]
pub struct ObserverSpec {
    name: String,
    filter: Option<String>,
    callback: ObserverFn,
}

impl ObserverSpec {
    pub fn new<F, Fut>(name: impl Into<String>, filter: Option<&str>, callback: F) -> Self
    where
        F: Fn(PostToolUseNotice) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CapabilityFailure>> + Send + 'static,
    {
        Self {
            name: name.into(),
            filter: filter.map(str::to_string),
            callback: Arc::new(move |notice| callback(notice).boxed()),
        }
    }
}

#[derive(Clone)]
pub struct HostTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    handler: ToolFn,
}

impl HostTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CapabilityFailure>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler: Arc::new(move |args| handler(args).boxed()),
        }
    }

    /// Builds a tool whose arguments are deserialized into `A`; the input
    /// schema is derived from `A`.
    pub fn typed<A, F, Fut>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + JsonSchema + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CapabilityFailure>> + Send + 'static,
    {
        let schema = serde_json::to_value(schemars::schema_for!(A))
            .unwrap_or_else(|_| json!({ "type": "object" }));
        let handler = Arc::new(handler);
        Self::new(name, description, schema, move |args| {
            let handler = handler.clone();
            async move {
                let args: A = serde_json::from_value(args)
                    .map_err(|err| CapabilityFailure::new(format!("invalid arguments: {err}")))?;
                handler(args).await
            }
        })
    }

    pub fn definition(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.input_schema,
        })
    }

    pub(crate) fn call(&self, args: Value) -> BoxFuture<'static, Result<Value, CapabilityFailure>> {
        (self.handler)(args)
    }
}

impl fmt::Debug for HostTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Tools grouped under one server name, exposed to the agent as
/// `mcp__{server}__{tool}`.
#[derive(Debug, Clone)]
pub struct HostToolServer {
    pub name: String,
    pub version: String,
    pub tools: Vec<HostTool>,
}

impl HostToolServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            tools: Vec::new(),
        }
    }

    pub fn tool(mut self, tool: HostTool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn definition(&self) -> Value {
        json!({
            "name": self.name,
            "version": self.version,
            "tools": self.tools.iter().map(HostTool::definition).collect::<Vec<_>>(),
        })
    }
}

#[derive(Clone)]
pub(crate) struct RegisteredHook {
    pub name: String,
    filter: Option<ToolFilter>,
    callback: HookFn,
}

impl RegisteredHook {
    pub fn call(&self, ctx: HookContext) -> BoxFuture<'static, Result<HookOutcome, CapabilityFailure>> {
        (self.callback)(ctx)
    }
}

#[derive(Clone)]
pub(crate) struct RegisteredObserver {
    pub name: String,
    filter: Option<ToolFilter>,
    callback: ObserverFn,
}

impl RegisteredObserver {
    pub fn call(&self, notice: PostToolUseNotice) -> BoxFuture<'static, Result<(), CapabilityFailure>> {
        (self.callback)(notice)
    }
}

/// Anything that can be registered with [`Capabilities::register`].
pub enum Capability {
    Hook(HookSpec),
    Observer(ObserverSpec),
    ToolServer(HostToolServer),
}

/// Immutable table of everything the controller answers for.
#[derive(Clone, Default)]
pub struct Capabilities {
    hooks: Vec<RegisteredHook>,
    observers: Vec<RegisteredObserver>,
    servers: Vec<HostToolServer>,
}

impl Capabilities {
    pub fn builder() -> CapabilitiesBuilder {
        CapabilitiesBuilder::default()
    }

    /// Adds a capability. Hooks and observers keep registration order.
    pub fn register(&mut self, capability: Capability) -> Result<(), SandboxError> {
        match capability {
            Capability::Hook(spec) => {
                let filter = spec.filter.as_deref().map(ToolFilter::new).transpose()?;
                self.hooks.push(RegisteredHook {
                    name: spec.name,
                    filter,
                    callback: spec.callback,
                });
            }
            Capability::Observer(spec) => {
                let filter = spec.filter.as_deref().map(ToolFilter::new).transpose()?;
                self.observers.push(RegisteredObserver {
                    name: spec.name,
                    filter,
                    callback: spec.callback,
                });
            }
            Capability::ToolServer(server) => {
                if self.servers.iter().any(|existing| existing.name == server.name) {
                    return Err(SandboxError::InvalidConfig {
                        message: format!("host tool server '{}' registered twice", server.name),
                    });
                }
                self.servers.push(server);
            }
        }
        Ok(())
    }

    pub fn has_hooks(&self) -> bool {
        !self.hooks.is_empty() || !self.observers.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty() && self.observers.is_empty() && self.servers.is_empty()
    }

    pub(crate) fn matching_hooks<'a>(
        &'a self,
        tool_name: &'a str,
    ) -> impl Iterator<Item = &'a RegisteredHook> + 'a {
        self.hooks
            .iter()
            .filter(move |hook| hook.filter.as_ref().map_or(true, |filter| filter.matches(tool_name)))
    }

    pub(crate) fn matching_observers<'a>(
        &'a self,
        tool_name: &'a str,
    ) -> impl Iterator<Item = &'a RegisteredObserver> + 'a {
        self.observers
            .iter()
            .filter(move |observer| {
                observer.filter.as_ref().map_or(true, |filter| filter.matches(tool_name))
            })
    }

    /// Finds a host tool by server and tool name. `tool_name` may also be
    /// written `server:tool`; with no server given, a bare name matches when
    /// exactly one server provides it.
    pub fn find_tool(&self, server_name: &str, tool_name: &str) -> Option<(&HostToolServer, &HostTool)> {
        let (server_name, tool_name) = match tool_name.split_once(':') {
            Some((server, tool)) if server_name.is_empty() => (server, tool),
            _ => (server_name, tool_name),
        };

        if !server_name.is_empty() {
            let server = self.servers.iter().find(|server| server.name == server_name)?;
            let tool = server.tools.iter().find(|tool| tool.name == tool_name)?;
            return Some((server, tool));
        }

        let mut found = self.servers.iter().flat_map(|server| {
            server
                .tools
                .iter()
                .filter(move |tool| tool.name == tool_name)
                .map(move |tool| (server, tool))
        });
        let first = found.next()?;
        if found.next().is_some() {
            return None;
        }
        Some(first)
    }

    pub fn mcp_tool_names(&self) -> Vec<String> {
        self.servers
            .iter()
            .flat_map(|server| {
                server
                    .tools
                    .iter()
                    .map(move |tool| format!("mcp__{}__{}", server.name, tool.name))
            })
            .collect()
    }

    pub fn host_tool_definitions(&self) -> Vec<Value> {
        self.servers.iter().map(HostToolServer::definition).collect()
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("hooks", &self.hooks.iter().map(|hook| &hook.name).collect::<Vec<_>>())
            .field(
                "observers",
                &self.observers.iter().map(|observer| &observer.name).collect::<Vec<_>>(),
            )
            .field("servers", &self.servers)
            .finish()
    }
}

#[derive(Default)]
pub struct CapabilitiesBuilder {
    inner: Capabilities,
}

impl CapabilitiesBuilder {
    pub fn hook(mut self, spec: HookSpec) -> Result<Self, SandboxError> {
        self.inner.register(Capability::Hook(spec))?;
        Ok(self)
    }

    pub fn observer(mut self, spec: ObserverSpec) -> Result<Self, SandboxError> {
        self.inner.register(Capability::Observer(spec))?;
        Ok(self)
    }

    /// A duplicate server name is logged and the first server kept. Use
    /// [`Capabilities::register`] to get the error instead.
    pub fn tool_server(mut self, server: HostToolServer) -> Self {
        if let Err(err) = self.inner.register(Capability::ToolServer(server)) {
            tracing::warn!(error = %err, "ignoring duplicate host tool server");
        }
        self
    }

    pub fn build(self) -> Capabilities {
        self.inner
    }
}

/// Turns a tool handler's return value into response content blocks.
///
/// A string becomes one text block, an object with a `content` array is used
/// as-is, anything else is rendered as JSON text.
pub fn normalize_tool_result(value: Value) -> Vec<ContentBlock> {
    match value {
        Value::String(text) => vec![ContentBlock::text(text)],
        Value::Object(mut object) if object.get("content").is_some_and(Value::is_array) => {
            let content = object.remove("content").unwrap_or(Value::Null);
            match serde_json::from_value::<Vec<ContentBlock>>(content.clone()) {
                Ok(blocks) => blocks,
                Err(_) => vec![ContentBlock::text(content.to_string())],
            }
        }
        other => vec![ContentBlock::text(other.to_string())],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn echo_tool(name: &str) -> HostTool {
        HostTool::new(name, "echo", json!({ "type": "object" }), |args| async move { Ok(args) })
    }

    #[test]
    fn filters_match_the_whole_tool_name() {
        let filter = ToolFilter::new("Bash|Write").expect("valid filter");
        assert!(filter.matches("Bash"));
        assert!(filter.matches("Write"));
        assert!(!filter.matches("BashOutput"));
        assert!(!filter.matches("Read"));
        assert!(ToolFilter::new("(").is_err());
    }

    #[test]
    fn tools_resolve_by_qualified_or_unique_name() {
        let capabilities = Capabilities::builder()
            .tool_server(HostToolServer::new("alpha", "1.0.0").tool(echo_tool("lookup")).tool(echo_tool("ping")))
            .tool_server(HostToolServer::new("beta", "1.0.0").tool(echo_tool("lookup")))
            .build();

        let (server, tool) = capabilities.find_tool("beta", "lookup").expect("qualified");
        assert_eq!((server.name.as_str(), tool.name.as_str()), ("beta", "lookup"));
        let (server, _) = capabilities.find_tool("", "alpha:lookup").expect("colon form");
        assert_eq!(server.name, "alpha");
        assert!(capabilities.find_tool("", "ping").is_some());
        assert!(capabilities.find_tool("", "lookup").is_none(), "ambiguous bare name");
        assert!(capabilities.find_tool("gamma", "lookup").is_none());
    }

    #[test]
    fn tool_results_become_text_blocks() {
        assert_eq!(normalize_tool_result(json!("hi")), vec![ContentBlock::text("hi")]);
        assert_eq!(
            normalize_tool_result(json!({ "content": [{ "type": "text", "text": "x" }] })),
            vec![ContentBlock::text("x")]
        );
        assert_eq!(
            normalize_tool_result(json!({ "count": 2 })),
            vec![ContentBlock::text(r#"{"count":2}"#)]
        );
    }

    #[derive(Deserialize, JsonSchema)]
    struct LookupArgs {
        key: String,
    }

    #[tokio::test]
    async fn typed_tools_derive_schema_and_parse_arguments() {
        let tool = HostTool::typed("lookup", "Look up a key", |args: LookupArgs| async move {
            Ok(json!(format!("value-of-{}", args.key)))
        });
        assert_eq!(tool.input_schema["properties"]["key"]["type"], json!("string"));

        let value = tool.call(json!({ "key": "db" })).await.expect("valid args");
        assert_eq!(value, json!("value-of-db"));
        let err = tool.call(json!({ "nope": 1 })).await.expect_err("missing key");
        assert!(err.message.starts_with("invalid arguments"), "{}", err.message);
    }
}
