mod common;

use std::time::Duration;

use common::*;
use futures::StreamExt;
use sandbox_bridge::schema::AgentEvent;
use sandbox_bridge::testing::ScriptedProvider;
use sandbox_bridge::{Capabilities, SandboxError, SandboxState, Session, SessionStatus};
use sandbox_bridge_error::TimeoutPhase;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_files_without_capabilities_completes_turn() {
    let provider = ScriptedProvider::new();
    let session = open_session(&provider, Capabilities::default()).await;
    assert_eq!(session.sandbox_state(), SandboxState::Running);

    let events = run_turn(&session, "list files").await;

    let uses = tool_uses(&events);
    assert_eq!(uses.len(), 1, "one tool use expected: {events:?}");
    assert_eq!(uses[0].name, "Bash");
    assert!(events.last().is_some_and(AgentEvent::is_result));
    assert_eq!(result_count(&events), 1);

    let history = session.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].prompt, "list files");
    assert_eq!(history[0].events, events);

    // Hooks are off, so the runtime never asked the controller anything.
    assert!(provider.responses().is_empty());
    within(session.close()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_turns_accumulate_history_and_resume() {
    let provider = ScriptedProvider::new();
    let session = open_session(&provider, Capabilities::default()).await;

    let first = run_turn(&session, "hello").await;
    let second = run_turn(&session, "again").await;

    assert_eq!(result_text(&first).as_deref(), Some("echo: hello"));
    assert_eq!(result_text(&second).as_deref(), Some("echo: again"));

    let history = session.history();
    assert_eq!(
        history.iter().map(|turn| turn.prompt.as_str()).collect::<Vec<_>>(),
        vec!["hello", "again"]
    );
    assert_eq!(history[0].result.result.as_deref(), Some("echo: hello"));
    assert_eq!(history[1].result.result.as_deref(), Some("echo: again"));
    assert!(history[0].completed_at <= history[1].started_at);

    let prompts = provider.prompts();
    assert_eq!(prompts.len(), 2);
    assert_eq!(prompts[0].resume, None);
    let session_id = history[0].result.session_id.clone();
    assert!(!session_id.is_empty());
    assert_eq!(prompts[1].resume.as_deref(), Some(session_id.as_str()));
    assert_eq!(session.resume_id(), Some(session_id));

    // Same sandbox for both turns.
    assert_eq!(provider.created().len(), 1);
    assert_eq!(provider.launches().len(), 1);
    within(session.close()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn history_snapshot_is_detached() {
    let provider = ScriptedProvider::new();
    let session = open_session(&provider, Capabilities::default()).await;
    run_turn(&session, "hello").await;

    let mut snapshot = session.history();
    snapshot.clear();
    assert_eq!(session.history().len(), 1);

    let exported: serde_json::Value =
        serde_json::from_str(&session.export_history().expect("export")).expect("valid json");
    assert_eq!(exported[0]["prompt"], "hello");
    assert_eq!(exported[0]["result"]["result"], "echo: hello");

    session.clear_history();
    assert!(session.history().is_empty());
    assert_eq!(session.resume_id(), None);

    run_turn(&session, "fresh").await;
    let prompts = provider.prompts();
    assert_eq!(prompts.last().and_then(|prompt| prompt.resume.clone()), None);
    within(session.close()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resume_option_is_sent_with_first_prompt() {
    let provider = ScriptedProvider::new();
    let mut options = test_options();
    options.agent.resume = Some("prior-session".to_string());
    let session = open_session_with(&provider, options, Capabilities::default()).await;

    let events = run_turn(&session, "continue").await;
    let result = events.iter().find_map(AgentEvent::as_result).expect("result");
    assert_eq!(result.session_id, "prior-session");
    assert_eq!(
        provider.prompts()[0].resume.as_deref(),
        Some("prior-session")
    );
    within(session.close()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_turn_is_rejected() {
    let provider = ScriptedProvider::new();
    let session = open_session(&provider, Capabilities::default()).await;

    within(session.send_turn("hang")).await.expect("first turn");
    let err = within(session.send_turn("second"))
        .await
        .expect_err("second turn must be rejected");
    assert_eq!(err, SandboxError::TurnInProgress);
    eventually(|| provider.prompts().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(provider.prompts().len(), 1);
    within(session.close()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_stream_resumes_same_turn() {
    let provider = ScriptedProvider::new();
    let session = open_session(&provider, Capabilities::default()).await;

    let mut stream = within(session.run_turn("list files")).await.expect("send");
    let first = within(stream.next()).await.expect("event").expect("ok");
    drop(stream);

    let rest = session.stream_turn().expect("resume stream");
    let (events, err) = drain(rest).await;
    assert!(err.is_none());
    assert!(events.last().is_some_and(AgentEvent::is_result));

    let history = session.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].events[0], first);
    assert_eq!(history[0].events.len(), events.len() + 1);
    within(session.close()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_mid_turn_cancels_stream() {
    let provider = ScriptedProvider::new();
    let session = open_session(&provider, Capabilities::default()).await;

    let stream = within(session.run_turn("hang")).await.expect("send");
    let closer = session.clone();
    let consumer = tokio::spawn(drain(stream));

    tokio::time::sleep(Duration::from_millis(50)).await;
    within(closer.close()).await;

    let (events, err) = within(consumer).await.expect("consumer task");
    assert_eq!(err, Some(SandboxError::Cancelled));
    assert_eq!(result_count(&events), 0);

    let err = within(session.send_turn("after close"))
        .await
        .expect_err("closed session");
    assert_eq!(err, SandboxError::Closed);
    assert_eq!(session.status(), SessionStatus::Closed);
    assert_eq!(session.sandbox_state(), SandboxState::Terminated);
    assert!(session.history().is_empty());
    assert_eq!(provider.terminated().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_is_idempotent() {
    let provider = ScriptedProvider::new();
    let session = open_session(&provider, Capabilities::default()).await;

    within(session.close()).await;
    within(session.close()).await;
    within(session.controller().close()).await;

    assert_eq!(provider.terminated().len(), 1);
    assert!(provider.force_terminated().is_empty());
    assert_eq!(
        within(session.open()).await.expect_err("reopen"),
        SandboxError::Closed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_open_session_releases_sandbox() {
    let provider = ScriptedProvider::new();
    let session = open_session(&provider, Capabilities::default()).await;
    within(session.send_turn("hang")).await.expect("send");

    drop(session);

    eventually(|| provider.terminated().len() == 1).await;
    assert_eq!(provider.terminated(), provider.created());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_terminate_falls_back_to_force() {
    let provider = ScriptedProvider::new().slow_terminate(Duration::from_secs(5));
    let session = open_session(&provider, Capabilities::default()).await;

    within(session.close()).await;

    assert!(provider.terminated().is_empty());
    assert_eq!(provider.force_terminated(), provider.created());
    assert_eq!(session.sandbox_state(), SandboxState::Terminated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn allocation_failure_leaves_controller_failed() {
    let provider = ScriptedProvider::new().fail_allocation();
    let session = Session::new(
        std::sync::Arc::new(provider.clone()),
        test_options(),
        Capabilities::default(),
    )
    .expect("session");

    let err = within(session.open()).await.expect_err("open must fail");
    assert!(matches!(err, SandboxError::Provision { .. }), "{err:?}");
    assert_eq!(session.sandbox_state(), SandboxState::Failed);
    assert_eq!(session.status(), SessionStatus::Unopened);

    // The recorded failure is returned again.
    assert_eq!(within(session.open()).await.expect_err("still failed"), err);
    assert_eq!(
        within(session.send_turn("hi")).await.expect_err("not open"),
        err
    );
    assert!(provider.created().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn image_build_failure_is_distinct() {
    let provider = ScriptedProvider::new().fail_image_build();
    let session = Session::new(
        std::sync::Arc::new(provider),
        test_options(),
        Capabilities::default(),
    )
    .expect("session");

    let err = within(session.open()).await.expect_err("open must fail");
    let report = err.to_report();
    assert_eq!(report.type_.as_str(), "provision");
    let reason = report
        .details
        .as_ref()
        .and_then(|details| details.get("reason"))
        .and_then(|reason| reason.as_str());
    assert_eq!(reason, Some("image_build"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn provisioning_deadline_times_out() {
    let provider = ScriptedProvider::new().provision_delay(Duration::from_secs(30));
    let mut options = test_options();
    options.sandbox.provisioning_timeout_secs = 1;
    let session = Session::new(std::sync::Arc::new(provider), options, Capabilities::default())
        .expect("session");

    let err = within(session.open()).await.expect_err("open must time out");
    assert!(
        matches!(err, SandboxError::Timeout { phase: TimeoutPhase::Provisioning, .. }),
        "{err:?}"
    );
    assert_eq!(session.sandbox_state(), SandboxState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_crash_surfaces_exit_status() {
    let provider = ScriptedProvider::new();
    let session = open_session(&provider, Capabilities::default()).await;

    let stream = within(session.run_turn("crash")).await.expect("send");
    let (events, err) = drain(stream).await;
    assert_eq!(events.len(), 2, "system init and assistant text: {events:?}");
    match err {
        Some(SandboxError::Terminated { exit_code, stderr }) => {
            assert_eq!(exit_code, Some(3));
            assert!(stderr.unwrap_or_default().contains("segmentation fault"));
        }
        other => panic!("expected terminated error, got {other:?}"),
    }
    wait_for_state(&session, SandboxState::Failed).await;
    assert!(session.history().is_empty());
    eventually(|| provider.terminated().len() == 1).await;

    let err = within(session.send_turn("retry")).await.expect_err("failed");
    assert!(matches!(err, SandboxError::Terminated { .. }));
    within(session.close()).await;
    assert_eq!(session.sandbox_state(), SandboxState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undecodable_line_fails_session() {
    let provider = ScriptedProvider::new();
    let session = open_session(&provider, Capabilities::default()).await;

    let stream = within(session.run_turn("garbage")).await.expect("send");
    let (_, err) = drain(stream).await;
    let err = err.expect("protocol error");
    assert!(matches!(err, SandboxError::Protocol { .. }), "{err:?}");
    assert_eq!(session.sandbox_state(), SandboxState::Failed);
    assert_eq!(session.controller().failure(), Some(err));
    within(session.close()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn execution_deadline_fails_running_sandbox() {
    let provider = ScriptedProvider::new();
    let mut options = test_options();
    options.sandbox.timeout_secs = 1;
    let session = open_session_with(&provider, options, Capabilities::default()).await;

    let stream = within(session.run_turn("hang")).await.expect("send");
    let (_, err) = drain(stream).await;
    assert!(
        matches!(err, Some(SandboxError::Timeout { phase: TimeoutPhase::Execution, .. })),
        "{err:?}"
    );
    assert_eq!(session.sandbox_state(), SandboxState::Failed);
    eventually(|| provider.terminated().len() == 1).await;
    within(session.close()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn launch_passes_runner_options() {
    let provider = ScriptedProvider::new();
    let mut options = test_options();
    options.agent.model = Some("sonnet".to_string());
    options.sandbox.image = Some("python:3.12".to_string());
    let session = open_session_with(&provider, options, Capabilities::default()).await;

    let launches = provider.launches();
    assert_eq!(launches.len(), 1);
    let runner: serde_json::Value =
        serde_json::from_str(launches[0].args.last().expect("options arg")).expect("json");
    assert_eq!(runner["model"], "sonnet");
    assert_eq!(runner["cwd"], "/workspace");
    assert!(runner.get("_enable_hooks").is_none());
    assert_eq!(provider.configs()[0].image.as_deref(), Some("python:3.12"));
    assert!(provider.prompts().is_empty());
    within(session.close()).await;
}
