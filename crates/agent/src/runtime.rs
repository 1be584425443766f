use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use finops_core::config::AppConfig;
use finops_core::domain::context::ContextDocument;
use finops_core::domain::conversation::{
    ConversationSession, HistoryViolation, SessionId, ToolCall,
};
use finops_core::errors::TurnError;
use finops_core::events::{preview, EventSink, NullEventSink, TurnEvent};

use crate::executor::{all_concurrent, Dispatched, ToolExecutor};
use crate::history::HistoryManager;
use crate::llm::{
    complete_with_retry, CompletionClient, CompletionRequest, CompletionResponse, RetryPolicy,
};
use crate::prompt::system_prompt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub max_iterations: u32,
    pub max_tokens: u32,
    pub event_preview_chars: usize,
    pub retry: RetryPolicy,
}

impl RuntimeSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_iterations: config.orchestration.max_iterations,
            max_tokens: config.llm.max_tokens,
            event_preview_chars: config.orchestration.event_preview_chars,
            retry: RetryPolicy::from(&config.llm),
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    Aborted,
}

/// What a caller gets back from one turn. The session itself is updated in place.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TurnOutcome {
    pub reply: String,
    pub status: TurnStatus,
    pub iterations: u32,
    pub error: Option<TurnError>,
    pub events: Vec<TurnEvent>,
}

/// Forwards events to the sink and keeps a copy for the outcome.
struct TurnRecorder<'a> {
    sink: &'a dyn EventSink,
    session_id: SessionId,
    events: Vec<TurnEvent>,
}

impl TurnRecorder<'_> {
    fn emit(&mut self, event: TurnEvent) {
        self.sink.emit(event.clone());
        self.events.push(event);
    }
}

/// Runs the bounded request/response/tool loop for one user message.
pub struct AgentRuntime {
    client: Arc<dyn CompletionClient>,
    executor: Arc<ToolExecutor>,
    history: HistoryManager,
    settings: RuntimeSettings,
    sink: Arc<dyn EventSink>,
}

impl AgentRuntime {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        executor: Arc<ToolExecutor>,
        history: HistoryManager,
        settings: RuntimeSettings,
    ) -> Self {
        Self { client, executor, history, settings, sink: Arc::new(NullEventSink) }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    /// Never returns an error: failures end the turn with a synthesized reply
    /// and a `TurnError` event.
    pub async fn run_turn(&self, session: &mut ConversationSession, user_text: &str) -> TurnOutcome {
        self.run_turn_with_context(session, user_text, &[]).await
    }

    /// Like [`run_turn`](Self::run_turn), with reference documents added to this
    /// turn's system prompt. They are not written to the session history.
    pub async fn run_turn_with_context(
        &self,
        session: &mut ConversationSession,
        user_text: &str,
        contexts: &[ContextDocument],
    ) -> TurnOutcome {
        let mut recorder = TurnRecorder {
            sink: self.sink.as_ref(),
            session_id: session.id().clone(),
            events: Vec::new(),
        };

        if session.is_turn_active() {
            // A previous turn never reached a boundary; its state cannot be trusted.
            warn!(event_name = "agent.turn.stale", session_id = %session.id(), "discarding unfinished turn");
            self.history.reset(session);
        }
        let turn = match session.begin_turn().and_then(|turn| {
            session.append_user_text(user_text)?;
            Ok(turn)
        }) {
            Ok(turn) => turn,
            Err(violation) => return self.fail_history(session, &mut recorder, violation),
        };

        info!(
            event_name = "agent.turn.started",
            session_id = %session.id(),
            turn,
            max_iterations = self.settings.max_iterations,
            contexts = contexts.len(),
            "turn started"
        );

        let catalogue = self.executor.registry().catalogue();
        let system = system_prompt(Utc::now().date_naive(), &catalogue, contexts);

        while session.iteration() < self.settings.max_iterations {
            let iteration = session.record_iteration();
            if let Err(violation) = session.verify_pairing() {
                return self.fail_history(session, &mut recorder, violation);
            }

            let request = CompletionRequest {
                system: system.clone(),
                messages: session.messages().to_vec(),
                tools: catalogue.clone(),
                max_tokens: self.settings.max_tokens,
            };
            let response =
                match complete_with_retry(self.client.as_ref(), &request, &self.settings.retry).await {
                    Ok(response) => response,
                    Err(error) => {
                        let error = TurnError::CompletionService(error.to_string());
                        return self.fail_turn(session, &mut recorder, error);
                    }
                };

            if response.is_terminal() {
                return self.finish(session, &mut recorder, response, iteration);
            }

            if let Some(text) = response.text.as_deref().filter(|text| !text.trim().is_empty()) {
                if let Err(violation) = session.append_assistant_text(text) {
                    return self.fail_history(session, &mut recorder, violation);
                }
                recorder.emit(TurnEvent::AssistantText {
                    session_id: recorder.session_id.clone(),
                    text: text.to_string(),
                    occurred_at: Utc::now(),
                });
            }

            if let Err(violation) = self.run_tool_calls(session, &mut recorder, &response.tool_calls).await {
                return self.fail_history(session, &mut recorder, violation);
            }
        }

        let error = TurnError::IterationCapExceeded(self.settings.max_iterations);
        self.fail_turn(session, &mut recorder, error)
    }

    /// Appends and dispatches calls in order. Runs of consecutive
    /// side-effect-free calls are dispatched together.
    async fn run_tool_calls(
        &self,
        session: &mut ConversationSession,
        recorder: &mut TurnRecorder<'_>,
        calls: &[ToolCall],
    ) -> Result<(), HistoryViolation> {
        let mut index = 0;
        while index < calls.len() {
            let mut end = index + 1;
            if all_concurrent(&self.executor, &calls[index..end]) {
                while end < calls.len() && all_concurrent(&self.executor, &calls[end..=end]) {
                    end += 1;
                }
            }
            let group = &calls[index..end];

            for call in group {
                session.append_tool_call(call.clone())?;
                recorder.emit(TurnEvent::ToolStarted {
                    session_id: recorder.session_id.clone(),
                    call_id: call.id.clone(),
                    tool_name: call.tool_name.clone(),
                    arguments: call.arguments.clone(),
                    occurred_at: Utc::now(),
                });
            }

            let dispatched = if group.len() == 1 {
                vec![self.executor.dispatch(&group[0], session.id()).await]
            } else {
                self.executor.dispatch_batch(group, session.id()).await
            };

            for (call, Dispatched { result, elapsed }) in group.iter().zip(dispatched) {
                let status = result.status;
                let preview_text = preview(&result.payload, self.settings.event_preview_chars);
                session.append_tool_result(result)?;
                recorder.emit(TurnEvent::ToolFinished {
                    session_id: recorder.session_id.clone(),
                    call_id: call.id.clone(),
                    tool_name: call.tool_name.clone(),
                    status,
                    preview: preview_text,
                    elapsed_ms: elapsed.as_millis() as u64,
                    occurred_at: Utc::now(),
                });
            }
            index = end;
        }
        Ok(())
    }

    fn finish(
        &self,
        session: &mut ConversationSession,
        recorder: &mut TurnRecorder<'_>,
        response: CompletionResponse,
        iterations: u32,
    ) -> TurnOutcome {
        let reply = response.text.unwrap_or_default();
        if let Err(violation) = session
            .append_assistant_text(reply.clone())
            .and_then(|()| session.complete_turn())
        {
            return self.fail_history(session, recorder, violation);
        }

        recorder.emit(TurnEvent::AssistantText {
            session_id: recorder.session_id.clone(),
            text: reply.clone(),
            occurred_at: Utc::now(),
        });
        recorder.emit(TurnEvent::TurnComplete {
            session_id: recorder.session_id.clone(),
            turn: session.turn(),
            iterations,
            occurred_at: Utc::now(),
        });
        info!(
            event_name = "agent.turn.completed",
            session_id = %session.id(),
            turn = session.turn(),
            iterations,
            "turn completed"
        );
        self.prune(session);

        TurnOutcome {
            reply,
            status: TurnStatus::Completed,
            iterations,
            error: None,
            events: std::mem::take(&mut recorder.events),
        }
    }

    /// Ends the turn with the synthesized reply appended as the assistant's answer.
    fn fail_turn(
        &self,
        session: &mut ConversationSession,
        recorder: &mut TurnRecorder<'_>,
        error: TurnError,
    ) -> TurnOutcome {
        let reply = error.user_reply();
        if let Err(violation) = session.append_assistant_text(reply.clone()) {
            return self.fail_history(session, recorder, violation);
        }
        session.abort_turn();
        let iterations = session.iteration();
        self.report_failure(session, recorder, &error);
        self.prune(session);

        TurnOutcome {
            reply,
            status: TurnStatus::Aborted,
            iterations,
            error: Some(error),
            events: std::mem::take(&mut recorder.events),
        }
    }

    /// The log can no longer be trusted: clear it and end the turn.
    fn fail_history(
        &self,
        session: &mut ConversationSession,
        recorder: &mut TurnRecorder<'_>,
        violation: HistoryViolation,
    ) -> TurnOutcome {
        let iterations = session.iteration();
        self.history.reset(session);
        let error = TurnError::HistoryInvariantViolation(violation.to_string());
        self.report_failure(session, recorder, &error);

        TurnOutcome {
            reply: error.user_reply(),
            status: TurnStatus::Aborted,
            iterations,
            error: Some(error),
            events: std::mem::take(&mut recorder.events),
        }
    }

    fn report_failure(
        &self,
        session: &ConversationSession,
        recorder: &mut TurnRecorder<'_>,
        error: &TurnError,
    ) {
        warn!(
            event_name = "agent.turn.failed",
            session_id = %session.id(),
            turn = session.turn(),
            code = error.code(),
            error = %error,
            "turn ended without an answer"
        );
        recorder.emit(TurnEvent::TurnError {
            session_id: recorder.session_id.clone(),
            turn: session.turn(),
            error: error.clone(),
            occurred_at: Utc::now(),
        });
    }

    fn prune(&self, session: &mut ConversationSession) {
        if let Err(violation) = self.history.prune(session) {
            warn!(event_name = "agent.history.prune_failed", session_id = %session.id(), error = %violation, "history prune failed");
        }
    }
}
