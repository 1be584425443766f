use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use finops_agent::anthropic::AnthropicClient;
use finops_agent::{
    register_available, AgentRuntime, CodeSandbox, Collaborators, ExecutorSettings,
    HistoryManager, RuntimeSettings, SandboxSettings, SessionHub, ToolExecutor, ToolRegistry,
    TurnStatus,
};
use finops_core::config::AppConfig;
use finops_core::domain::context::ContextId;
use finops_core::domain::conversation::SessionId;
use finops_core::events::{EventSink, TurnEvent};
use finops_db::{
    connect_with_settings, migrations, KpiRepository, SqlContextRepository, SqlKpiRepository,
    SqlWorkflowRepository, WorkflowRepository,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::info;

use crate::commands::{build_runtime, load_config, CommandResult};
use crate::logging;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatInput {
    Exit,
    Clear,
    History,
    Blank,
    Message(String),
}

pub fn parse_input(line: &str) -> ChatInput {
    let trimmed = line.trim();
    match trimmed {
        "" => ChatInput::Blank,
        "exit" | "quit" | "/exit" | "/quit" => ChatInput::Exit,
        "/clear" => ChatInput::Clear,
        "/history" => ChatInput::History,
        _ => ChatInput::Message(trimmed.to_string()),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChatSummary {
    pub turns: usize,
    pub aborted: usize,
}

pub fn run(session: Option<String>, contexts: Vec<String>) -> CommandResult {
    let config = match load_config("chat") {
        Ok(config) => config,
        Err(result) => return result,
    };
    logging::init(&config);
    let runtime = match build_runtime("chat", true) {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    runtime.block_on(async {
        let hub = match open_hub(&config).await {
            Ok(hub) => hub,
            Err(error) => {
                return CommandResult::failure("chat", "startup", format!("{error:#}"), 4);
            }
        };
        let session_id = session.map(SessionId).unwrap_or_else(SessionId::generate);
        let contexts: Vec<ContextId> = contexts.into_iter().map(ContextId).collect();
        let input = BufReader::new(tokio::io::stdin());
        let mut output = std::io::stdout();

        let driven = tokio::select! {
            driven = drive(&hub, &session_id, &contexts, input, &mut output) => driven,
            _ = tokio::signal::ctrl_c() => Ok(ChatSummary::default()),
        };
        hub.close(&session_id).await;

        match driven {
            Ok(summary) => CommandResult::success(
                "chat",
                format!(
                    "session {session_id} ended after {} turns ({} aborted)",
                    summary.turns, summary.aborted
                ),
            ),
            Err(error) => CommandResult::failure("chat", "io", error.to_string(), 1),
        }
    })
}

/// Wires the completion client, storage and sandbox into a session hub.
pub async fn open_hub(config: &AppConfig) -> anyhow::Result<SessionHub> {
    let client = AnthropicClient::from_config(&config.llm).context("completion client")?;
    let pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .context("database connection")?;
    migrations::run_pending(&pool).await.context("database migrations")?;

    let kpis: Arc<dyn KpiRepository> = Arc::new(SqlKpiRepository::new(pool.clone()));
    let seeded = kpis.seed_defaults().await.context("seeding default KPIs")?;
    let workflows: Arc<dyn WorkflowRepository> = Arc::new(SqlWorkflowRepository::new(pool.clone()));
    let contexts = Arc::new(SqlContextRepository::new(pool));
    let collaborators = Collaborators {
        sandbox: Some(Arc::new(CodeSandbox::new(SandboxSettings::from_config(
            &config.sandbox,
            &config.cloud,
        )))),
        workflows: Some(workflows),
        kpis: Some(kpis),
        ..Collaborators::default()
    };

    let mut registry = ToolRegistry::new();
    let bound = register_available(&mut registry, &collaborators).context("tool registration")?;
    info!(
        event_name = "cli.chat.ready",
        model = client.model(),
        tools = bound.len(),
        seeded_kpis = seeded,
        "chat runtime ready"
    );

    let executor = ToolExecutor::new(Arc::new(registry), ExecutorSettings::from(&config.orchestration));
    let runtime = AgentRuntime::new(
        Arc::new(client),
        Arc::new(executor),
        HistoryManager::new(config.orchestration.history_exchanges),
        RuntimeSettings::from_config(config),
    )
    .with_event_sink(Arc::new(ConsoleEventSink));

    Ok(SessionHub::new(Arc::new(runtime))
        .with_context_store(contexts)
        .with_idle_timeout(Duration::from_secs(config.orchestration.session_idle_secs)))
}

/// Reads lines until `exit` or end of input, submitting each message as one turn
/// with `contexts` attached.
pub async fn drive<R, W>(
    hub: &SessionHub,
    session_id: &SessionId,
    contexts: &[ContextId],
    input: R,
    output: &mut W,
) -> std::io::Result<ChatSummary>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut summary = ChatSummary::default();
    let mut lines = input.lines();

    loop {
        write!(output, "you> ")?;
        output.flush()?;
        let Some(line) = lines.next_line().await? else {
            writeln!(output)?;
            break;
        };

        match parse_input(&line) {
            ChatInput::Blank => continue,
            ChatInput::Exit => break,
            ChatInput::Clear => {
                hub.reset(session_id).await.map_err(std::io::Error::other)?;
                writeln!(output, "history cleared")?;
            }
            ChatInput::History => {
                let snapshot = hub.snapshot(session_id).await.map_err(std::io::Error::other)?;
                if snapshot.exchanges.is_empty() {
                    writeln!(output, "no exchanges yet")?;
                }
                for exchange in &snapshot.exchanges {
                    writeln!(output, "[turn {}] you: {}", exchange.turn, exchange.user)?;
                    writeln!(output, "[turn {}] assistant: {}", exchange.turn, exchange.assistant)?;
                }
            }
            ChatInput::Message(text) => {
                let outcome = hub
                    .submit_with_context(session_id, text, contexts)
                    .await
                    .map_err(std::io::Error::other)?;
                summary.turns += 1;
                if outcome.status == TurnStatus::Aborted {
                    summary.aborted += 1;
                }
                writeln!(output, "assistant> {}", outcome.reply)?;
            }
        }
    }

    Ok(summary)
}

/// Tool progress on stderr, so replies on stdout stay readable.
struct ConsoleEventSink;

impl EventSink for ConsoleEventSink {
    fn emit(&self, event: TurnEvent) {
        match event {
            TurnEvent::ToolStarted { tool_name, .. } => eprintln!("  .. {tool_name}"),
            TurnEvent::ToolFinished { tool_name, status, elapsed_ms, .. } => {
                eprintln!("  .. {tool_name} {} in {elapsed_ms} ms", status.as_str());
            }
            _ => {}
        }
    }
}
