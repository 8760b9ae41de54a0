use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use sandbox_bridge_error::SandboxError;
use sandbox_bridge_schema::{decode_line, encode_sandbox_frame, AgentEvent};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::capabilities::{Capabilities, HookOutcome, HookSpec};
use crate::options::SessionOptions;
use crate::provider::{LocalProcessProvider, SandboxProvider};
use crate::query::query;
use crate::session::Session;
use crate::testing::ScriptedProvider;

const CLEAR_COMMAND: &str = "/clear";
const EXIT_COMMAND: &str = "/exit";

#[derive(Parser, Debug)]
#[command(name = "sandbox-bridge", bin_name = "sandbox-bridge")]
#[command(about = "Run a coding agent inside a sandbox", version)]
#[command(arg_required_else_help = true)]
pub struct SandboxBridgeCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one prompt in a fresh sandbox and print its events.
    Query(QueryArgs),
    /// Multi-turn conversation; one prompt per stdin line.
    Chat(ChatArgs),
    /// Decode agent output lines from stdin and print the typed frames.
    Decode,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// Local working directory, agent spawned as a child process.
    Local,
    /// In-memory scripted agent.
    Scripted,
}

#[derive(Args, Debug)]
pub struct SessionArgs {
    /// JSON file with `sandbox`, `agent` and `bridge` sections.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ProviderKind::Local)]
    provider: ProviderKind,

    /// Parent directory for local sandbox working directories.
    #[arg(long)]
    sandbox_root: Option<PathBuf>,

    /// Agent runtime program.
    #[arg(long)]
    program: Option<PathBuf>,

    /// Agent runtime argument; replaces the configured arguments.
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    #[arg(long, short = 'm')]
    model: Option<String>,

    #[arg(long)]
    system_prompt: Option<String>,

    #[arg(long)]
    max_turns: Option<u32>,

    #[arg(long = "allowed-tool")]
    allowed_tools: Vec<String>,

    #[arg(long)]
    cwd: Option<String>,

    /// Agent session id to resume.
    #[arg(long, short = 'r')]
    resume: Option<String>,

    /// Deny every tool call whose name matches this regex.
    #[arg(long = "deny-tool")]
    deny_tools: Vec<String>,
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    #[command(flatten)]
    session: SessionArgs,

    prompt: String,
}

#[derive(Args, Debug)]
pub struct ChatArgs {
    #[command(flatten)]
    session: SessionArgs,

    /// Write the conversation history to this file on exit.
    #[arg(long)]
    export_history: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("{0} lines failed to decode")]
    Decode(usize),
    #[error("runtime error: {0}")]
    Runtime(String),
}

pub fn run_sandbox_bridge() -> Result<(), CliError> {
    let cli = SandboxBridgeCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Query(args) => block_on(run_query(args)),
        Command::Chat(args) => block_on(run_chat(args)),
        Command::Decode => run_decode(),
    }
}

fn block_on<F>(future: F) -> Result<(), CliError>
where
    F: std::future::Future<Output = Result<(), CliError>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Runtime(err.to_string()))?;
    runtime.block_on(future)
}

impl SessionArgs {
    fn options(&self) -> Result<SessionOptions, CliError> {
        let mut options = match &self.config {
            Some(path) => SessionOptions::from_json_file(path)?,
            None => SessionOptions::default(),
        };

        let agent = &mut options.agent;
        if let Some(program) = &self.program {
            agent.launch.program = program.clone();
        }
        if !self.args.is_empty() {
            agent.launch.args = self.args.clone();
        }
        if let Some(model) = &self.model {
            agent.model = Some(model.clone());
        }
        if let Some(system_prompt) = &self.system_prompt {
            agent.system_prompt = Some(system_prompt.clone());
        }
        if let Some(max_turns) = self.max_turns {
            agent.max_turns = Some(max_turns);
        }
        if !self.allowed_tools.is_empty() {
            agent.allowed_tools = self.allowed_tools.clone();
        }
        if let Some(cwd) = &self.cwd {
            agent.cwd = cwd.clone();
        }
        if let Some(resume) = &self.resume {
            agent.resume = Some(resume.clone());
        }
        Ok(options)
    }

    fn provider(&self) -> Arc<dyn SandboxProvider> {
        match self.provider {
            ProviderKind::Local => {
                let mut provider = LocalProcessProvider::new();
                if let Some(root) = &self.sandbox_root {
                    provider = provider.with_root(root.clone());
                }
                Arc::new(provider)
            }
            ProviderKind::Scripted => Arc::new(ScriptedProvider::new()),
        }
    }

    fn capabilities(&self) -> Result<Capabilities, CliError> {
        let mut builder = Capabilities::builder();
        for pattern in &self.deny_tools {
            let spec = HookSpec::new(format!("deny-tool:{pattern}"), Some(pattern.as_str()), |ctx| {
                let reason = format!("{} is blocked by --deny-tool", ctx.tool_name);
                async move { Ok(HookOutcome::deny(reason)) }
            });
            builder = builder.hook(spec)?;
        }
        Ok(builder.build())
    }
}

async fn run_query(args: &QueryArgs) -> Result<(), CliError> {
    let session_args = &args.session;
    let options = session_args.options()?;
    let capabilities = session_args.capabilities()?;
    let mut stream = query(
        session_args.provider(),
        args.prompt.clone(),
        options,
        capabilities,
    )
    .await
    .map_err(report_error)?;

    while let Some(item) = stream.next().await {
        let event = item.map_err(report_error)?;
        write_event(&event)?;
    }
    for warning in stream.warnings() {
        write_stderr_line(&serde_json::to_string(warning)?)?;
    }
    Ok(())
}

async fn run_chat(args: &ChatArgs) -> Result<(), CliError> {
    let session_args = &args.session;
    let session = Session::new(
        session_args.provider(),
        session_args.options()?,
        session_args.capabilities()?,
    )?;

    let outcome = tokio::select! {
        outcome = chat_loop(&session) => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            Ok(())
        }
    };
    session.close().await;

    if let Some(path) = &args.export_history {
        let history = session.export_history()?;
        std::fs::write(path, history)?;
        tracing::info!(path = %path.display(), "history exported");
    }
    outcome
}

async fn chat_loop(session: &Session) -> Result<(), CliError> {
    session.open().await.map_err(report_error)?;
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let prompt = line.trim();
        match prompt {
            "" => continue,
            EXIT_COMMAND => break,
            CLEAR_COMMAND => {
                session.clear_history();
                tracing::info!("history cleared");
                continue;
            }
            _ => {}
        }

        let mut turn = session.run_turn(prompt).await.map_err(report_error)?;
        while let Some(item) = turn.next().await {
            match item {
                Ok(event) => write_event(&event)?,
                Err(err) if err.is_fatal() => return Err(report_error(err)),
                Err(err) => {
                    let _ = report_error(err);
                    break;
                }
            }
        }
        for warning in turn.warnings() {
            write_stderr_line(&serde_json::to_string(warning)?)?;
        }
    }
    Ok(())
}

fn run_decode() -> Result<(), CliError> {
    let stdin = std::io::stdin();
    let mut failures = 0;
    for (index, line) in stdin.lock().lines().enumerate() {
        let line = line?;
        match decode_line(&line) {
            Ok(Some(frame)) => write_stdout_line(&encode_sandbox_frame(&frame)?)?,
            Ok(None) => {}
            Err(err) => {
                failures += 1;
                let report = json!({ "line": index + 1, "error": err.to_string() });
                write_stderr_line(&report.to_string())?;
            }
        }
    }
    if failures > 0 {
        return Err(CliError::Decode(failures));
    }
    Ok(())
}

fn report_error(err: SandboxError) -> CliError {
    if let Ok(report) = serde_json::to_string(&err.to_report()) {
        let _ = write_stderr_line(&report);
    }
    CliError::Sandbox(err)
}

fn write_event(event: &AgentEvent) -> Result<(), CliError> {
    write_json_line(event)
}

fn write_json_line<T: Serialize>(value: &T) -> Result<(), CliError> {
    let line = serde_json::to_string(value)?;
    write_stdout_line(&line)
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_stderr_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stderr();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_with_overrides() {
        let cli = SandboxBridgeCli::try_parse_from([
            "sandbox-bridge",
            "query",
            "--provider",
            "scripted",
            "--model",
            "sonnet",
            "--deny-tool",
            "Bash",
            "--arg",
            "-u",
            "--arg",
            "runner.py",
            "list files",
        ])
        .expect("parse");
        let Command::Query(args) = cli.command else {
            panic!("expected query");
        };
        assert_eq!(args.prompt, "list files");
        assert_eq!(args.session.provider, ProviderKind::Scripted);

        let options = args.session.options().expect("options");
        assert_eq!(options.agent.model.as_deref(), Some("sonnet"));
        assert_eq!(options.agent.launch.args, vec!["-u", "runner.py"]);
        assert_eq!(options.agent.cwd, "/workspace");

        let capabilities = args.session.capabilities().expect("capabilities");
        assert!(capabilities.has_hooks());
    }

    #[test]
    fn rejects_invalid_deny_pattern() {
        let cli = SandboxBridgeCli::try_parse_from([
            "sandbox-bridge",
            "chat",
            "--deny-tool",
            "(unclosed",
        ])
        .expect("parse");
        let Command::Chat(args) = cli.command else {
            panic!("expected chat");
        };
        let err = args.session.capabilities().expect_err("bad regex");
        assert!(matches!(
            err,
            CliError::Sandbox(SandboxError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn config_file_is_loaded_before_flags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.json");
        std::fs::write(
            &path,
            r#"{"agent":{"model":"haiku","maxTurns":4},"bridge":{"callTimeoutMs":500}}"#,
        )
        .expect("write config");

        let cli = SandboxBridgeCli::try_parse_from([
            "sandbox-bridge",
            "chat",
            "--config",
            path.to_str().expect("utf8 path"),
            "--model",
            "opus",
        ])
        .expect("parse");
        let Command::Chat(args) = cli.command else {
            panic!("expected chat");
        };
        let options = args.session.options().expect("options");
        assert_eq!(options.agent.model.as_deref(), Some("opus"));
        assert_eq!(options.agent.max_turns, Some(4));
        assert_eq!(options.bridge.call_timeout_ms, 500);
    }
}
