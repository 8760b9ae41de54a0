use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sandbox_bridge_error::SandboxError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::capabilities::Capabilities;

pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &["Read", "Write", "Edit", "Bash", "Glob", "Grep"];

/// Everything needed to open a session: where the sandbox runs, how the agent
/// inside it is configured, and how the bridge times its calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionOptions {
    pub sandbox: SandboxConfig,
    pub agent: AgentOptions,
    pub bridge: BridgeOptions,
}

impl SessionOptions {
    pub fn from_json_file(path: &Path) -> Result<Self, SandboxError> {
        let raw = std::fs::read_to_string(path).map_err(|err| SandboxError::InvalidConfig {
            message: format!("failed to read {}: {err}", path.display()),
        })?;
        serde_json::from_str(&raw).map_err(|err| SandboxError::InvalidConfig {
            message: format!("failed to parse {}: {err}", path.display()),
        })
    }

    pub fn validate(&self) -> Result<(), SandboxError> {
        self.sandbox.validate()?;
        self.agent.validate()?;
        Ok(())
    }
}

/// Resource and network configuration of the sandbox. Snapshotted when the
/// sandbox is created and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxConfig {
    pub image: Option<String>,
    pub gpu: Option<String>,
    pub cpu: Option<f64>,
    /// MiB.
    pub memory: Option<u32>,
    /// Mount path to volume name.
    pub volumes: BTreeMap<String, String>,
    pub network_file_systems: BTreeMap<String, String>,
    pub secrets: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub block_network: bool,
    pub cidr_allowlist: Vec<String>,
    pub cloud: Option<String>,
    pub region: Option<String>,
    pub app_name: String,
    pub timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
    pub provisioning_timeout_secs: u64,
    pub workdir: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: None,
            gpu: None,
            cpu: None,
            memory: None,
            volumes: BTreeMap::new(),
            network_file_systems: BTreeMap::new(),
            secrets: Vec::new(),
            env: BTreeMap::new(),
            block_network: false,
            cidr_allowlist: Vec::new(),
            cloud: None,
            region: None,
            app_name: "sandbox-bridge".to_string(),
            timeout_secs: 3600,
            idle_timeout_secs: None,
            provisioning_timeout_secs: 300,
            workdir: PathBuf::from("/workspace"),
        }
    }
}

impl SandboxConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_secs(self.provisioning_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.block_network {
            return Err(SandboxError::InvalidConfig {
                message: "block_network cannot be enabled: the agent needs network access to \
                          reach its model API; use cidr_allowlist to restrict egress instead"
                    .to_string(),
            });
        }
        if self.timeout_secs == 0 {
            return Err(SandboxError::InvalidConfig {
                message: "timeout_secs must be greater than zero".to_string(),
            });
        }
        if self.provisioning_timeout_secs == 0 {
            return Err(SandboxError::InvalidConfig {
                message: "provisioning_timeout_secs must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    #[default]
    AcceptEdits,
    BypassPermissions,
}

/// Command that starts the agent runtime inside the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl Default for LaunchSpec {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python"),
            args: vec!["-u".to_string(), "/opt/sandbox-bridge/runner.py".to_string()],
            env: HashMap::new(),
        }
    }
}

impl LaunchSpec {
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(shell_quote(self.program.to_string_lossy().as_ref()));
        for arg in &self.args {
            parts.push(shell_quote(arg));
        }
        parts.join(" ")
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentOptions {
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub mcp_servers: Map<String, Value>,
    pub max_turns: Option<u32>,
    pub permission_mode: PermissionMode,
    pub model: Option<String>,
    pub output_format: Option<Value>,
    pub agents: Map<String, Value>,
    pub cwd: String,
    pub resume: Option<String>,
    pub launch: LaunchSpec,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            system_prompt: None,
            allowed_tools: DEFAULT_ALLOWED_TOOLS.iter().map(|tool| tool.to_string()).collect(),
            disallowed_tools: Vec::new(),
            mcp_servers: Map::new(),
            max_turns: None,
            permission_mode: PermissionMode::default(),
            model: None,
            output_format: None,
            agents: Map::new(),
            cwd: "/workspace".to_string(),
            resume: None,
            launch: LaunchSpec::default(),
        }
    }
}

impl AgentOptions {
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.launch.program.as_os_str().is_empty() {
            return Err(SandboxError::InvalidConfig {
                message: "agent launch program must not be empty".to_string(),
            });
        }
        if self.max_turns == Some(0) {
            return Err(SandboxError::InvalidConfig {
                message: "max_turns must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Options document handed to the runtime inside the sandbox.
    pub fn runner_options(&self, capabilities: &Capabilities) -> Value {
        let mut allowed_tools = self.allowed_tools.clone();
        for name in capabilities.mcp_tool_names() {
            if !allowed_tools.contains(&name) {
                allowed_tools.push(name);
            }
        }

        let mut options = Map::new();
        options.insert("cwd".to_string(), Value::from(self.cwd.clone()));
        options.insert("allowed_tools".to_string(), json!(allowed_tools));
        options.insert("permission_mode".to_string(), json!(self.permission_mode));
        if let Some(system_prompt) = &self.system_prompt {
            options.insert("system_prompt".to_string(), Value::from(system_prompt.clone()));
        }
        if !self.disallowed_tools.is_empty() {
            options.insert("disallowed_tools".to_string(), json!(self.disallowed_tools));
        }
        if let Some(max_turns) = self.max_turns {
            options.insert("max_turns".to_string(), Value::from(max_turns));
        }
        if let Some(model) = &self.model {
            options.insert("model".to_string(), Value::from(model.clone()));
        }
        if !self.mcp_servers.is_empty() {
            options.insert("mcp_servers".to_string(), Value::Object(self.mcp_servers.clone()));
        }
        if let Some(output_format) = &self.output_format {
            options.insert("output_format".to_string(), output_format.clone());
        }
        if !self.agents.is_empty() {
            options.insert("agents".to_string(), Value::Object(self.agents.clone()));
        }
        if let Some(resume) = &self.resume {
            options.insert("resume".to_string(), Value::from(resume.clone()));
        }
        if capabilities.has_hooks() {
            options.insert("_enable_hooks".to_string(), Value::Bool(true));
        }
        let host_tools = capabilities.host_tool_definitions();
        if !host_tools.is_empty() {
            options.insert("_host_tools".to_string(), Value::Array(host_tools));
        }
        Value::Object(options)
    }

    /// Launch command with the runner options appended as the final argument.
    pub fn launch_command(&self, capabilities: &Capabilities) -> LaunchSpec {
        let mut launch = self.launch.clone();
        launch.args.push(self.runner_options(capabilities).to_string());
        launch
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeOptions {
    pub call_timeout_ms: u64,
    pub tool_timeout_ms: u64,
    pub close_grace_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            tool_timeout_ms: 60_000,
            close_grace_ms: 2_000,
            write_timeout_ms: 30_000,
        }
    }
}

impl BridgeOptions {
    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{HookOutcome, HookSpec, HostTool, HostToolServer};
    use sandbox_bridge_error::ErrorType;

    #[test]
    fn partial_json_keeps_defaults() {
        let options: SessionOptions = serde_json::from_value(json!({
            "sandbox": { "image": "python:3.12", "timeoutSecs": 60 },
            "agent": { "model": "claude-sonnet" }
        }))
        .expect("parse options");
        assert_eq!(options.sandbox.timeout_secs, 60);
        assert_eq!(options.sandbox.provisioning_timeout_secs, 300);
        assert_eq!(options.agent.cwd, "/workspace");
        assert_eq!(options.agent.permission_mode, PermissionMode::AcceptEdits);
        assert_eq!(options.agent.allowed_tools.len(), DEFAULT_ALLOWED_TOOLS.len());
        assert_eq!(options.bridge.tool_timeout_ms, 60_000);
    }

    #[test]
    fn block_network_is_rejected() {
        let mut options = SessionOptions::default();
        options.sandbox.block_network = true;
        let err = options.validate().expect_err("block_network must be rejected");
        assert_eq!(err.error_type(), ErrorType::InvalidConfig);
    }

    #[test]
    fn empty_launch_program_is_rejected() {
        let mut options = SessionOptions::default();
        options.agent.launch.program = PathBuf::new();
        assert!(options.validate().is_err());
    }

    #[test]
    fn runner_options_advertise_capabilities() {
        let capabilities = Capabilities::builder()
            .hook(HookSpec::new("allow-all", None, |_ctx| async {
                Ok(HookOutcome::allow())
            }))
            .expect("valid hook")
            .tool_server(HostToolServer::new("secrets", "1.0.0").tool(HostTool::new(
                "lookup",
                "Look up a secret",
                json!({ "type": "object" }),
                |_args| async { Ok(json!("value")) },
            )))
            .build();

        let options = AgentOptions::default().runner_options(&capabilities);
        assert_eq!(options["_enable_hooks"], json!(true));
        assert_eq!(options["permission_mode"], json!("acceptEdits"));
        let allowed = options["allowed_tools"].as_array().expect("allowed tools");
        assert!(allowed.contains(&json!("mcp__secrets__lookup")));
        assert_eq!(options["_host_tools"][0]["name"], json!("secrets"));
        assert_eq!(options["_host_tools"][0]["tools"][0]["name"], json!("lookup"));

        let bare = AgentOptions::default().runner_options(&Capabilities::default());
        assert!(bare.get("_enable_hooks").is_none());
        assert!(bare.get("_host_tools").is_none());
    }
}
