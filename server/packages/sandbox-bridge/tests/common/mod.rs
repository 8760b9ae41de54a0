#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sandbox_bridge::schema::{AgentEvent, ContentBlock, ToolResultBlock, ToolUseBlock, UserContent};
use sandbox_bridge::testing::ScriptedProvider;
use sandbox_bridge::{
    Capabilities, SandboxError, SandboxState, Session, SessionOptions, TurnStream,
};

pub const TEST_DEADLINE: Duration = Duration::from_secs(10);

/// Options with bridge timeouts short enough for tests.
pub fn test_options() -> SessionOptions {
    let mut options = SessionOptions::default();
    options.bridge.call_timeout_ms = 2_000;
    options.bridge.tool_timeout_ms = 2_000;
    options.bridge.close_grace_ms = 500;
    options.bridge.write_timeout_ms = 2_000;
    options
}

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_DEADLINE, future)
        .await
        .expect("test step timed out")
}

pub async fn open_session(provider: &ScriptedProvider, capabilities: Capabilities) -> Session {
    open_session_with(provider, test_options(), capabilities).await
}

pub async fn open_session_with(
    provider: &ScriptedProvider,
    options: SessionOptions,
    capabilities: Capabilities,
) -> Session {
    let session = Session::new(Arc::new(provider.clone()), options, capabilities)
        .expect("create session");
    within(session.open()).await.expect("open session");
    session
}

/// Drains a turn stream. Returns the events seen and the error that ended it,
/// if any.
pub async fn drain(mut stream: TurnStream) -> (Vec<AgentEvent>, Option<SandboxError>) {
    let mut events = Vec::new();
    let collected = within(async {
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => events.push(event),
                Err(err) => return Some(err),
            }
        }
        None
    })
    .await;
    (events, collected)
}

pub async fn run_turn(session: &Session, prompt: &str) -> Vec<AgentEvent> {
    let stream = within(session.run_turn(prompt)).await.expect("send turn");
    let (events, err) = drain(stream).await;
    assert!(err.is_none(), "turn failed: {err:?}");
    events
}

pub async fn wait_for_state(session: &Session, state: SandboxState) {
    let mut rx = session.controller().subscribe_state();
    within(rx.wait_for(|current| *current == state))
        .await
        .expect("state channel closed");
}

pub fn tool_uses(events: &[AgentEvent]) -> Vec<ToolUseBlock> {
    events
        .iter()
        .filter_map(|event| match event {
            AgentEvent::Assistant(assistant) => Some(assistant.tool_uses().cloned().collect::<Vec<_>>()),
            _ => None,
        })
        .flatten()
        .collect()
}

pub fn tool_results(events: &[AgentEvent]) -> Vec<ToolResultBlock> {
    events
        .iter()
        .filter_map(|event| match event {
            AgentEvent::User(user) => match &user.content {
                UserContent::Blocks(blocks) => Some(blocks.clone()),
                UserContent::Text(_) => None,
            },
            _ => None,
        })
        .flatten()
        .filter_map(|block| match block {
            ContentBlock::ToolResult(result) => Some(result),
            _ => None,
        })
        .collect()
}

pub fn result_text(events: &[AgentEvent]) -> Option<String> {
    events
        .iter()
        .find_map(AgentEvent::as_result)
        .and_then(|result| result.result.clone())
}

pub fn result_count(events: &[AgentEvent]) -> usize {
    events.iter().filter(|event| event.is_result()).count()
}

/// Polls `condition` until it holds. For effects that finish in the background
/// after a state change, like provider teardown.
pub async fn eventually(condition: impl Fn() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}
