//! One worker task per session. A worker owns its [`ConversationSession`] and
//! processes commands strictly in arrival order, so turns of one session never
//! interleave while distinct sessions run independently.
//!
//! Workers live until [`SessionHub::close`] or, when an idle timeout is set,
//! until no command arrives for that long. An evicted session loses its
//! history; the next command for its id starts a fresh one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};

use finops_core::domain::context::{ContextDocument, ContextId};
use finops_core::domain::conversation::{ConversationSession, SessionId};
use finops_db::ContextRepository;

use crate::history::HistorySnapshot;
use crate::runtime::{AgentRuntime, TurnOutcome};

const QUEUE_DEPTH: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("session `{0}` worker is no longer running")]
    WorkerGone(SessionId),
    #[error("context documents were requested but no context store is configured")]
    NoContextStore,
    #[error("unknown context document `{0}`")]
    UnknownContext(ContextId),
    #[error("context store failed: {0}")]
    ContextStore(String),
}

enum SessionCommand {
    Turn { text: String, contexts: Vec<ContextDocument>, reply: oneshot::Sender<TurnOutcome> },
    Snapshot { reply: oneshot::Sender<HistorySnapshot> },
    Reset { reply: oneshot::Sender<()> },
}

pub struct SessionHub {
    runtime: Arc<AgentRuntime>,
    contexts: Option<Arc<dyn ContextRepository>>,
    idle_timeout: Option<Duration>,
    workers: Mutex<HashMap<SessionId, mpsc::Sender<SessionCommand>>>,
}

impl SessionHub {
    pub fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self { runtime, contexts: None, idle_timeout: None, workers: Mutex::new(HashMap::new()) }
    }

    /// Store that [`submit_with_context`](Self::submit_with_context) resolves ids against.
    pub fn with_context_store(mut self, store: Arc<dyn ContextRepository>) -> Self {
        self.contexts = Some(store);
        self
    }

    /// Evicts session workers that receive no command for `timeout`.
    /// A zero duration disables eviction.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Queues a user message and waits for the turn to finish.
    pub async fn submit(
        &self,
        session_id: &SessionId,
        text: impl Into<String>,
    ) -> Result<TurnOutcome, HubError> {
        self.submit_documents(session_id, text.into(), Vec::new()).await
    }

    /// Queues a user message whose turn sees the given context documents in its
    /// system prompt. Every id must exist in the context store.
    pub async fn submit_with_context(
        &self,
        session_id: &SessionId,
        text: impl Into<String>,
        context_ids: &[ContextId],
    ) -> Result<TurnOutcome, HubError> {
        let contexts = self.resolve_contexts(context_ids).await?;
        self.submit_documents(session_id, text.into(), contexts).await
    }

    pub async fn snapshot(&self, session_id: &SessionId) -> Result<HistorySnapshot, HubError> {
        let (reply, snapshot) = oneshot::channel();
        self.send(session_id, SessionCommand::Snapshot { reply }).await?;
        snapshot.await.map_err(|_| HubError::WorkerGone(session_id.clone()))
    }

    pub async fn reset(&self, session_id: &SessionId) -> Result<(), HubError> {
        let (reply, done) = oneshot::channel();
        self.send(session_id, SessionCommand::Reset { reply }).await?;
        done.await.map_err(|_| HubError::WorkerGone(session_id.clone()))
    }

    /// Stops the session's worker once its queued commands are drained.
    pub async fn close(&self, session_id: &SessionId) -> bool {
        let removed = self.workers.lock().await.remove(session_id).is_some();
        if removed {
            info!(event_name = "agent.session.closed", session_id = %session_id, "session closed");
        }
        removed
    }

    /// Sessions with a live worker. Evicted workers are pruned first.
    pub async fn session_count(&self) -> usize {
        let mut workers = self.workers.lock().await;
        workers.retain(|_, sender| !sender.is_closed());
        workers.len()
    }

    async fn submit_documents(
        &self,
        session_id: &SessionId,
        text: String,
        contexts: Vec<ContextDocument>,
    ) -> Result<TurnOutcome, HubError> {
        let (reply, outcome) = oneshot::channel();
        self.send(session_id, SessionCommand::Turn { text, contexts, reply }).await?;
        outcome.await.map_err(|_| HubError::WorkerGone(session_id.clone()))
    }

    async fn resolve_contexts(&self, ids: &[ContextId]) -> Result<Vec<ContextDocument>, HubError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let store = self.contexts.as_ref().ok_or(HubError::NoContextStore)?;
        let documents =
            store.resolve(ids).await.map_err(|error| HubError::ContextStore(error.to_string()))?;
        if let Some(missing) =
            ids.iter().find(|id| !documents.iter().any(|document| &document.id == *id))
        {
            return Err(HubError::UnknownContext(missing.clone()));
        }
        Ok(documents)
    }

    async fn send(&self, session_id: &SessionId, command: SessionCommand) -> Result<(), HubError> {
        // A worker can hit its idle timeout between lookup and send; retry once on a fresh one.
        let mut command = command;
        for _ in 0..2 {
            let sender = self.worker(session_id).await;
            match sender.send(command).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => command = returned,
            }
        }
        Err(HubError::WorkerGone(session_id.clone()))
    }

    async fn worker(&self, session_id: &SessionId) -> mpsc::Sender<SessionCommand> {
        let mut workers = self.workers.lock().await;
        workers.retain(|_, sender| !sender.is_closed());
        if let Some(sender) = workers.get(session_id) {
            return sender.clone();
        }
        let sender = spawn_worker(Arc::clone(&self.runtime), session_id.clone(), self.idle_timeout);
        workers.insert(session_id.clone(), sender.clone());
        sender
    }
}

fn spawn_worker(
    runtime: Arc<AgentRuntime>,
    session_id: SessionId,
    idle_timeout: Option<Duration>,
) -> mpsc::Sender<SessionCommand> {
    let (sender, mut commands) = mpsc::channel::<SessionCommand>(QUEUE_DEPTH);
    info!(event_name = "agent.session.opened", session_id = %session_id, "session worker started");

    tokio::spawn(async move {
        let mut session = ConversationSession::new(session_id);
        let mut idle_timeout = idle_timeout;
        loop {
            let next = match idle_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, commands.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        info!(
                            event_name = "agent.session.evicted",
                            session_id = %session.id(),
                            idle_secs = timeout.as_secs(),
                            "idle session evicted"
                        );
                        // Refuse new commands, then drain whatever raced in before the close.
                        commands.close();
                        idle_timeout = None;
                        continue;
                    }
                },
                None => commands.recv().await,
            };
            let Some(command) = next else { break };

            match command {
                SessionCommand::Turn { text, contexts, reply } => {
                    let outcome = runtime.run_turn_with_context(&mut session, &text, &contexts).await;
                    // The caller may have stopped waiting; the session is updated regardless.
                    let _ = reply.send(outcome);
                }
                SessionCommand::Snapshot { reply } => {
                    let _ = reply.send(runtime.history().snapshot(&session));
                }
                SessionCommand::Reset { reply } => {
                    runtime.history().reset(&mut session);
                    let _ = reply.send(());
                }
            }
        }
        debug!(event_name = "agent.session.worker_stopped", session_id = %session.id(), "session worker stopped");
    });
    sender
}
