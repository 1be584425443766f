use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use finops_agent::{
    register_available, AgentRuntime, Collaborators, CompletionClient, CompletionError,
    CompletionRequest, CompletionResponse, ExecutorSettings, HistoryManager, RuntimeSettings,
    SessionHub, ToolExecutor, ToolRegistry,
};
use finops_cli::commands::chat::{drive, ChatSummary};
use finops_core::domain::context::{ContextId, NewContextDocument};
use finops_core::domain::conversation::{CallId, SessionId, ToolCall};
use finops_db::{ContextRepository, InMemoryContextRepository, InMemoryWorkflowRepository};

struct ScriptedClient {
    replies: Mutex<VecDeque<Result<CompletionResponse, CompletionError>>>,
    systems: Mutex<Vec<String>>,
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        self.systems.lock().expect("systems lock").push(request.system.clone());
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or_else(|| Ok(CompletionResponse::text("script exhausted")))
    }
}

fn hub(replies: Vec<Result<CompletionResponse, CompletionError>>) -> SessionHub {
    hub_with_client(scripted(replies))
}

fn scripted(replies: Vec<Result<CompletionResponse, CompletionError>>) -> Arc<ScriptedClient> {
    Arc::new(ScriptedClient { replies: Mutex::new(replies.into()), systems: Mutex::new(Vec::new()) })
}

fn hub_with_client(client: Arc<ScriptedClient>) -> SessionHub {
    let collaborators = Collaborators {
        workflows: Some(Arc::new(InMemoryWorkflowRepository::default())),
        ..Collaborators::default()
    };
    let mut registry = ToolRegistry::new();
    register_available(&mut registry, &collaborators).expect("register");

    let executor = Arc::new(ToolExecutor::new(Arc::new(registry), ExecutorSettings::default()));
    let runtime = AgentRuntime::new(
        client,
        executor,
        HistoryManager::new(10),
        RuntimeSettings::default(),
    );
    SessionHub::new(Arc::new(runtime))
}

async fn transcript(hub: &SessionHub, input: &str) -> (ChatSummary, String) {
    let mut output = Vec::new();
    let summary = drive(hub, &SessionId::generate(), &[], input.as_bytes(), &mut output)
        .await
        .expect("drive chat");
    (summary, String::from_utf8(output).expect("utf8 transcript"))
}

#[tokio::test]
async fn replies_and_history_are_printed() {
    let hub = hub(vec![
        Ok(CompletionResponse {
            text: Some("Checking your saved workflows.".to_string()),
            tool_calls: vec![ToolCall {
                id: CallId("toolu_1".to_string()),
                tool_name: "list_workflows".to_string(),
                arguments: json!({}),
            }],
        }),
        Ok(CompletionResponse::text("You have no saved workflows yet.")),
    ]);

    let (summary, output) =
        transcript(&hub, "list my workflows\n/history\nexit\nnever sent\n").await;

    assert_eq!(summary, ChatSummary { turns: 1, aborted: 0 });
    assert!(output.contains("assistant> You have no saved workflows yet."));
    assert!(output.contains("[turn 1] you: list my workflows"));
    assert!(output.contains("[turn 1] assistant: You have no saved workflows yet."));
    assert!(!output.contains("never sent"));
}

#[tokio::test]
async fn clear_empties_the_history() {
    let hub = hub(vec![Ok(CompletionResponse::text("Hello."))]);

    let (_, output) = transcript(&hub, "hi\n/clear\n/history\n").await;

    assert!(output.contains("history cleared"));
    assert!(output.contains("no exchanges yet"));
}

#[tokio::test]
async fn failed_turns_are_counted_and_end_of_input_stops_the_loop() {
    let hub = hub(vec![Err(CompletionError::Rejected("invalid x-api-key".to_string()))]);

    let (summary, output) = transcript(&hub, "\n\nwhat did S3 cost?").await;

    assert_eq!(summary, ChatSummary { turns: 1, aborted: 1 });
    assert!(output.contains("assistant> "));
}

#[tokio::test]
async fn attached_contexts_reach_every_turn() {
    let store = Arc::new(InMemoryContextRepository::default());
    let budgets = store
        .add(NewContextDocument {
            name: "Budgets".to_string(),
            description: String::new(),
            content: "payments-prod: $40k per month".to_string(),
        })
        .await
        .expect("add context");
    let client = scripted(vec![
        Ok(CompletionResponse::text("Within budget.")),
        Ok(CompletionResponse::text("Still within budget.")),
    ]);
    let hub = hub_with_client(client.clone()).with_context_store(store);

    let mut output = Vec::new();
    let summary = drive(
        &hub,
        &SessionId::generate(),
        &[budgets.id.clone()],
        "are we on budget?\nand now?\n".as_bytes(),
        &mut output,
    )
    .await
    .expect("drive chat");

    assert_eq!(summary, ChatSummary { turns: 2, aborted: 0 });
    let systems = client.systems.lock().expect("systems lock").clone();
    assert_eq!(systems.len(), 2);
    assert!(systems.iter().all(|system| system.contains("payments-prod: $40k per month")));
}

#[tokio::test]
async fn unknown_context_ids_end_the_chat() {
    let hub = hub(vec![]).with_context_store(Arc::new(InMemoryContextRepository::default()));
    let mut output = Vec::new();

    let driven = drive(
        &hub,
        &SessionId::generate(),
        &[ContextId("ctx_nope".to_string())],
        "hello\n".as_bytes(),
        &mut output,
    )
    .await;

    let error = driven.expect_err("unknown context should fail");
    assert!(error.to_string().contains("ctx_nope"));
}

