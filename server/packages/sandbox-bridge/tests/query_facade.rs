mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use futures::StreamExt;
use sandbox_bridge::testing::ScriptedProvider;
use sandbox_bridge::{
    query, AgentProcess, Capabilities, CapabilityFailure, HookSpec, LaunchSpec, SandboxConfig,
    SandboxError, SandboxId, SandboxProvider, SandboxState, SessionStatus,
};

/// Scripted provider whose agent takes a while to attach.
struct SlowAttach {
    inner: ScriptedProvider,
    delay: Duration,
}

#[async_trait]
impl SandboxProvider for SlowAttach {
    async fn create(&self, config: &SandboxConfig) -> Result<SandboxId, SandboxError> {
        self.inner.create(config).await
    }

    async fn attach_io(
        &self,
        id: &SandboxId,
        launch: &LaunchSpec,
    ) -> Result<AgentProcess, SandboxError> {
        tokio::time::sleep(self.delay).await;
        self.inner.attach_io(id, launch).await
    }

    async fn terminate(&self, id: &SandboxId) -> Result<(), SandboxError> {
        self.inner.terminate(id).await
    }

    async fn force_terminate(&self, id: &SandboxId) -> Result<(), SandboxError> {
        self.inner.force_terminate(id).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_streams_one_turn_then_releases_sandbox() {
    let provider = ScriptedProvider::new();
    let stream = within(query(
        Arc::new(provider.clone()),
        "list files",
        test_options(),
        Capabilities::default(),
    ))
    .await
    .expect("query");
    let session = stream.session().clone();

    let events = within(stream.collect_events()).await.expect("events");

    assert_eq!(result_count(&events), 1);
    assert!(events.last().is_some_and(|event| event.is_result()));
    assert_eq!(tool_uses(&events).len(), 1);
    assert_eq!(provider.prompts().len(), 1);
    assert_eq!(provider.terminated(), provider.created());
    assert_eq!(session.status(), SessionStatus::Closed);
    assert_eq!(session.sandbox_state(), SandboxState::Terminated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_releases_sandbox_when_agent_crashes() {
    let provider = ScriptedProvider::new();
    let mut stream = within(query(
        Arc::new(provider.clone()),
        "crash",
        test_options(),
        Capabilities::default(),
    ))
    .await
    .expect("query");

    let mut failure = None;
    while let Some(item) = within(stream.next()).await {
        if let Err(err) = item {
            failure = Some(err);
        }
    }
    assert!(matches!(failure, Some(SandboxError::Terminated { exit_code: Some(3), .. })));
    assert_eq!(stream.session().status(), SessionStatus::Closed);
    eventually(|| provider.terminated().len() == 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_query_early_releases_sandbox() {
    let provider = ScriptedProvider::new();
    let mut stream = within(query(
        Arc::new(provider.clone()),
        "hang",
        test_options(),
        Capabilities::default(),
    ))
    .await
    .expect("query");

    let first = within(stream.next()).await.expect("first event");
    assert!(first.is_ok());
    drop(stream);

    eventually(|| provider.terminated().len() == 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_query_while_opening_releases_sandbox() {
    let provider = ScriptedProvider::new();
    let slow = SlowAttach {
        inner: provider.clone(),
        delay: Duration::from_millis(300),
    };

    let cancelled = tokio::time::timeout(
        Duration::from_millis(100),
        query(Arc::new(slow), "hello", test_options(), Capabilities::default()),
    )
    .await;
    assert!(cancelled.is_err(), "query should still be opening");

    assert_eq!(provider.created().len(), 1);
    eventually(|| provider.terminated() == provider.created()).await;
    assert!(provider.prompts().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_surfaces_provision_error() {
    let provider = ScriptedProvider::new().fail_allocation();
    let err = within(query(
        Arc::new(provider.clone()),
        "hello",
        test_options(),
        Capabilities::default(),
    ))
    .await
    .expect_err("query must fail");

    assert!(matches!(err, SandboxError::Provision { .. }), "{err:?}");
    assert!(provider.created().is_empty());
    assert!(provider.prompts().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_rejects_blocked_network() {
    let provider = ScriptedProvider::new();
    let mut options = test_options();
    options.sandbox.block_network = true;

    let err = within(query(
        Arc::new(provider.clone()),
        "hello",
        options,
        Capabilities::default(),
    ))
    .await
    .expect_err("invalid config");

    assert!(matches!(err, SandboxError::InvalidConfig { .. }), "{err:?}");
    assert!(provider.created().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_keeps_turn_warnings() {
    let provider = ScriptedProvider::new();
    let capabilities = Capabilities::builder()
        .hook(HookSpec::new("flaky", Some("Bash"), |_ctx| async {
            Err(CapabilityFailure::new("backend down"))
        }))
        .expect("hook")
        .build();
    let mut stream = within(query(
        Arc::new(provider.clone()),
        "list files",
        test_options(),
        capabilities,
    ))
    .await
    .expect("query");

    while let Some(item) = within(stream.next()).await {
        item.expect("event");
    }
    assert_eq!(stream.warnings().len(), 1);
    assert!(stream.warnings()[0].message.contains("backend down"));
}
