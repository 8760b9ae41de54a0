use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Provision,
    Timeout,
    Terminated,
    Protocol,
    Capability,
    StreamError,
    Closed,
    TurnInProgress,
    InvalidState,
    Cancelled,
    InvalidConfig,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Timeout => "timeout",
            Self::Terminated => "terminated",
            Self::Protocol => "protocol",
            Self::Capability => "capability",
            Self::StreamError => "stream_error",
            Self::Closed => "closed",
            Self::TurnInProgress => "turn_in_progress",
            Self::InvalidState => "invalid_state",
            Self::Cancelled => "cancelled",
            Self::InvalidConfig => "invalid_config",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Provision => "Provision Failed",
            Self::Timeout => "Timeout",
            Self::Terminated => "Sandbox Terminated",
            Self::Protocol => "Protocol Violation",
            Self::Capability => "Capability Failed",
            Self::StreamError => "Stream Error",
            Self::Closed => "Sandbox Closed",
            Self::TurnInProgress => "Turn In Progress",
            Self::InvalidState => "Invalid State",
            Self::Cancelled => "Cancelled",
            Self::InvalidConfig => "Invalid Configuration",
        }
    }

    /// Whether an error of this type ends the session it happened in.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Provision | Self::Timeout | Self::Terminated | Self::Protocol | Self::StreamError
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionFailure {
    Allocation,
    ImageBuild,
}

impl std::fmt::Display for ProvisionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allocation => f.write_str("allocation failed"),
            Self::ImageBuild => f.write_str("image build failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPhase {
    Provisioning,
    Execution,
    Write,
    Close,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => f.write_str("provisioning"),
            Self::Execution => f.write_str("execution"),
            Self::Write => f.write_str("write"),
            Self::Close => f.write_str("close"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    #[serde(rename = "type")]
    pub type_: ErrorType,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SandboxError {
    #[error("sandbox provisioning failed ({reason}): {message}")]
    Provision {
        reason: ProvisionFailure,
        message: String,
    },
    #[error("{phase} deadline exceeded")]
    Timeout {
        phase: TimeoutPhase,
        message: Option<String>,
    },
    #[error("sandbox terminated unexpectedly{}", format_exit_code(.exit_code))]
    Terminated {
        exit_code: Option<i32>,
        stderr: Option<String>,
    },
    #[error("protocol error: {message}")]
    Protocol { message: String },
    #[error("capability '{name}' failed: {message}")]
    Capability { name: String, message: String },
    #[error("stream error: {message}")]
    StreamError { message: String },
    #[error("sandbox closed")]
    Closed,
    #[error("turn already in progress")]
    TurnInProgress,
    #[error("invalid state: {message}")]
    InvalidState { message: String },
    #[error("cancelled")]
    Cancelled,
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
}

fn format_exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" (exit code {code})"),
        None => String::new(),
    }
}

impl SandboxError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Provision { .. } => ErrorType::Provision,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::Terminated { .. } => ErrorType::Terminated,
            Self::Protocol { .. } => ErrorType::Protocol,
            Self::Capability { .. } => ErrorType::Capability,
            Self::StreamError { .. } => ErrorType::StreamError,
            Self::Closed => ErrorType::Closed,
            Self::TurnInProgress => ErrorType::TurnInProgress,
            Self::InvalidState { .. } => ErrorType::InvalidState,
            Self::Cancelled => ErrorType::Cancelled,
            Self::InvalidConfig { .. } => ErrorType::InvalidConfig,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.error_type().is_fatal()
    }

    pub fn to_report(&self) -> ErrorReport {
        let details = match self {
            Self::Provision { reason, .. } => {
                let mut map = Map::new();
                map.insert(
                    "reason".to_string(),
                    serde_json::to_value(reason).unwrap_or(Value::Null),
                );
                Some(Value::Object(map))
            }
            Self::Timeout { phase, message } => {
                let mut map = Map::new();
                map.insert(
                    "phase".to_string(),
                    Value::String(phase.to_string()),
                );
                if let Some(message) = message {
                    map.insert("message".to_string(), Value::String(message.clone()));
                }
                Some(Value::Object(map))
            }
            Self::Terminated { exit_code, stderr } => {
                let mut map = Map::new();
                if let Some(code) = exit_code {
                    map.insert(
                        "exitCode".to_string(),
                        Value::Number(serde_json::Number::from(*code as i64)),
                    );
                }
                if let Some(stderr) = stderr {
                    map.insert("stderr".to_string(), Value::String(stderr.clone()));
                }
                if map.is_empty() {
                    None
                } else {
                    Some(Value::Object(map))
                }
            }
            Self::Capability { name, .. } => {
                let mut map = Map::new();
                map.insert("capability".to_string(), Value::String(name.clone()));
                Some(Value::Object(map))
            }
            Self::Protocol { .. }
            | Self::StreamError { .. }
            | Self::Closed
            | Self::TurnInProgress
            | Self::InvalidState { .. }
            | Self::Cancelled
            | Self::InvalidConfig { .. } => None,
        };

        ErrorReport {
            type_: self.error_type(),
            title: self.error_type().title().to_string(),
            message: self.to_string(),
            details,
        }
    }
}

impl From<SandboxError> for ErrorReport {
    fn from(value: SandboxError) -> Self {
        value.to_report()
    }
}

impl From<&SandboxError> for ErrorReport {
    fn from(value: &SandboxError) -> Self {
        value.to_report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminated_message_includes_exit_code() {
        let err = SandboxError::Terminated {
            exit_code: Some(137),
            stderr: None,
        };
        assert_eq!(err.to_string(), "sandbox terminated unexpectedly (exit code 137)");

        let err = SandboxError::Terminated {
            exit_code: None,
            stderr: None,
        };
        assert_eq!(err.to_string(), "sandbox terminated unexpectedly");
    }

    #[test]
    fn report_carries_type_and_details() {
        let err = SandboxError::Provision {
            reason: ProvisionFailure::ImageBuild,
            message: "layer 3 failed".to_string(),
        };
        let report = err.to_report();
        assert_eq!(report.type_, ErrorType::Provision);
        assert_eq!(report.title, "Provision Failed");
        assert_eq!(
            report.details.as_ref().and_then(|d| d.get("reason")),
            Some(&Value::String("image_build".to_string()))
        );

        let value = serde_json::to_value(&report).expect("serialize report");
        assert_eq!(value.get("type"), Some(&Value::String("provision".to_string())));
    }

    #[test]
    fn only_sandbox_ending_errors_are_fatal() {
        assert!(SandboxError::protocol("duplicate id").is_fatal());
        assert!(SandboxError::Timeout {
            phase: TimeoutPhase::Execution,
            message: None,
        }
        .is_fatal());
        assert!(!SandboxError::TurnInProgress.is_fatal());
        assert!(!SandboxError::Closed.is_fatal());
        assert!(!SandboxError::Capability {
            name: "audit".to_string(),
            message: "boom".to_string(),
        }
        .is_fatal());
    }
}
