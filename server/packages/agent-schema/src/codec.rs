use sandbox_bridge_error::SandboxError;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::control::{
    ControlFrame, HookInvocation, HostFrame, PostToolUseNotice, SandboxFrame, ToolInvocation,
};
use crate::events::{AgentEvent, EVENT_TYPES};

pub const TYPE_FIELD: &str = "_type";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("expected a json object, got {0}")]
    NotAnObject(&'static str),
    #[error("unknown frame discriminant '{0}'")]
    UnknownDiscriminant(String),
    #[error("unknown agent event type '{0}'")]
    UnknownEventType(String),
    #[error("unknown hook event '{0}'")]
    UnknownHookEvent(String),
    #[error("malformed {kind}: {message}")]
    Malformed { kind: &'static str, message: String },
    #[error("unexpected '{0}' from sandbox")]
    UnexpectedResponse(String),
}

impl From<DecodeError> for SandboxError {
    fn from(value: DecodeError) -> Self {
        SandboxError::protocol(value.to_string())
    }
}

/// Decodes one line of sandbox output.
///
/// Blank lines decode to `None`. Every other line yields exactly one frame or
/// an error; nothing is skipped silently.
pub fn decode_line(line: &str) -> Result<Option<SandboxFrame>, DecodeError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value: Value =
        serde_json::from_str(trimmed).map_err(|err| DecodeError::InvalidJson(err.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(DecodeError::NotAnObject(json_kind(&value)));
    };

    let discriminant = match object.remove(TYPE_FIELD) {
        None | Some(Value::Null) => None,
        Some(Value::String(kind)) => Some(kind),
        Some(other) => {
            return Err(DecodeError::Malformed {
                kind: "frame",
                message: format!("{TYPE_FIELD} must be a string, got {}", json_kind(&other)),
            })
        }
    };

    match discriminant.as_deref() {
        None | Some("message") => decode_event(object).map(|event| Some(SandboxFrame::Event(event))),
        Some("hook_request") => decode_hook_request(object).map(Some),
        Some("host_tool_request") => {
            let invocation: ToolInvocation = from_object("host_tool_request", object)?;
            Ok(Some(SandboxFrame::Control(ControlFrame::Tool(invocation))))
        }
        Some(kind @ ("hook_response" | "host_tool_response" | "prompt")) => {
            Err(DecodeError::UnexpectedResponse(kind.to_string()))
        }
        Some(other) => Err(DecodeError::UnknownDiscriminant(other.to_string())),
    }
}

pub fn decode_event(object: Map<String, Value>) -> Result<AgentEvent, DecodeError> {
    let event_type = match object.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(other) => return Err(DecodeError::UnknownEventType(other.to_string())),
        None => {
            return Err(DecodeError::Malformed {
                kind: "message",
                message: "missing field `type`".to_string(),
            })
        }
    };
    if !EVENT_TYPES.contains(&event_type.as_str()) {
        return Err(DecodeError::UnknownEventType(event_type));
    }
    from_object("message", object)
}

fn decode_hook_request(object: Map<String, Value>) -> Result<SandboxFrame, DecodeError> {
    let hook_event = object
        .get("hook_event")
        .and_then(Value::as_str)
        .unwrap_or("PreToolUse")
        .to_string();
    match hook_event.as_str() {
        "PreToolUse" => {
            let invocation: HookInvocation = from_object("hook_request", object)?;
            Ok(SandboxFrame::Control(ControlFrame::Hook(invocation)))
        }
        "PostToolUse" => {
            let notice: PostToolUseNotice = from_object("hook_request", object)?;
            Ok(SandboxFrame::Observation(notice))
        }
        _ => Err(DecodeError::UnknownHookEvent(hook_event)),
    }
}

fn from_object<T: serde::de::DeserializeOwned>(
    kind: &'static str,
    object: Map<String, Value>,
) -> Result<T, DecodeError> {
    serde_json::from_value(Value::Object(object)).map_err(|err| DecodeError::Malformed {
        kind,
        message: err.to_string(),
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Encodes a frame the way the sandbox runtime writes it. Used by scripted
/// runtimes and tests.
pub fn encode_sandbox_frame(frame: &SandboxFrame) -> Result<String, serde_json::Error> {
    let value = match frame {
        SandboxFrame::Event(event) => tagged("message", event)?,
        SandboxFrame::Control(ControlFrame::Hook(hook)) => {
            let mut value = tagged("hook_request", hook)?;
            value.insert("hook_event".to_string(), Value::from("PreToolUse"));
            value
        }
        SandboxFrame::Control(ControlFrame::Tool(tool)) => tagged("host_tool_request", tool)?,
        SandboxFrame::Observation(notice) => {
            let mut value = tagged("hook_request", notice)?;
            value.insert("hook_event".to_string(), Value::from("PostToolUse"));
            value
        }
    };
    serde_json::to_string(&Value::Object(value))
}

fn tagged<T: Serialize>(kind: &str, payload: &T) -> Result<Map<String, Value>, serde_json::Error> {
    let mut object = match serde_json::to_value(payload)? {
        Value::Object(object) => object,
        other => {
            let mut object = Map::new();
            object.insert("data".to_string(), other);
            object
        }
    };
    object.insert(TYPE_FIELD.to_string(), Value::from(kind));
    Ok(object)
}

/// Encodes a controller frame as a single line, without the trailing newline.
pub fn encode_host_frame(frame: &HostFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

pub fn decode_host_frame(line: &str) -> Result<HostFrame, DecodeError> {
    serde_json::from_str(line.trim()).map_err(|err| DecodeError::Malformed {
        kind: "host frame",
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{Decision, HookResponse};
    use crate::events::ContentBlock;

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(decode_line("").expect("blank"), None);
        assert_eq!(decode_line("   \r").expect("whitespace"), None);
    }

    #[test]
    fn missing_discriminant_is_an_agent_event() {
        let frame = decode_line(r#"{"type":"system","subtype":"init","data":{"model":"m"}}"#)
            .expect("decode")
            .expect("frame");
        match frame {
            SandboxFrame::Event(AgentEvent::System(system)) => assert_eq!(system.subtype, "init"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_discriminants_are_errors() {
        assert_eq!(
            decode_line(r#"{"_type":"telemetry"}"#),
            Err(DecodeError::UnknownDiscriminant("telemetry".to_string()))
        );
        assert_eq!(
            decode_line(r#"{"_type":"message","type":"banner"}"#),
            Err(DecodeError::UnknownEventType("banner".to_string()))
        );
        assert_eq!(
            decode_line(r#"{"_type":"hook_request","hook_event":"Stop","request_id":"r","tool_name":"x"}"#),
            Err(DecodeError::UnknownHookEvent("Stop".to_string()))
        );
        assert!(matches!(decode_line("not json"), Err(DecodeError::InvalidJson(_))));
        assert_eq!(decode_line("[1,2]"), Err(DecodeError::NotAnObject("array")));
    }

    #[test]
    fn responses_from_sandbox_are_rejected() {
        let err = decode_line(r#"{"_type":"hook_response","request_id":"r","decision":"allow"}"#)
            .expect_err("response from sandbox");
        assert_eq!(err, DecodeError::UnexpectedResponse("hook_response".to_string()));
        let sandbox_err: SandboxError = err.into();
        assert_eq!(sandbox_err.error_type().as_str(), "protocol");
    }

    #[test]
    fn post_tool_use_is_an_observation() {
        let frame = decode_line(
            r#"{"_type":"hook_request","hook_event":"PostToolUse","request_id":"r9","tool_name":"Bash","tool_input":{"command":"ls"},"tool_result":"a.txt"}"#,
        )
        .expect("decode")
        .expect("frame");
        match frame {
            SandboxFrame::Observation(notice) => {
                assert_eq!(notice.tool_name, "Bash");
                assert_eq!(notice.tool_result, "a.txt");
                assert!(!notice.is_error);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn hook_response_wire_shape() {
        let frame = HostFrame::HookResponse(HookResponse {
            request_id: "req-1".to_string(),
            decision: Decision::Deny,
            reason: Some("no shell".to_string()),
            updated_input: None,
        });
        insta::assert_snapshot!(
            encode_host_frame(&frame).expect("encode"),
            @r#"{"_type":"hook_response","request_id":"req-1","decision":"deny","reason":"no shell"}"#
        );
    }

    #[test]
    fn tool_response_wire_shape() {
        let frame = HostFrame::HostToolResponse(crate::control::ToolResponse {
            request_id: "req-2".to_string(),
            content: vec![ContentBlock::text("42")],
            is_error: false,
        });
        insta::assert_snapshot!(
            encode_host_frame(&frame).expect("encode"),
            @r#"{"_type":"host_tool_response","request_id":"req-2","content":[{"type":"text","text":"42"}],"is_error":false}"#
        );
        assert_eq!(
            decode_host_frame(&encode_host_frame(&frame).expect("encode")).expect("decode"),
            frame
        );
    }
}
