use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    pub fn generate() -> Self {
        Self(format!("call_{}", Uuid::new_v4().simple()))
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: CallId,
    pub tool_name: String,
    pub arguments: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: CallId,
    pub status: ToolStatus,
    pub payload: String,
    pub truncated: bool,
}

impl ToolResult {
    pub fn success(call_id: CallId, payload: impl Into<String>) -> Self {
        Self { call_id, status: ToolStatus::Success, payload: payload.into(), truncated: false }
    }

    pub fn error(call_id: CallId, payload: impl Into<String>) -> Self {
        Self { call_id, status: ToolStatus::Error, payload: payload.into(), truncated: false }
    }

    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: String },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
}

/// One immutable entry of the conversation log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sequence: u64,
    pub turn: u64,
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn tool_call(&self) -> Option<&ToolCall> {
        match &self.content {
            MessageContent::ToolCall(call) => Some(call),
            _ => None,
        }
    }

    pub fn tool_result(&self) -> Option<&ToolResult> {
        match &self.content {
            MessageContent::ToolResult(result) => Some(result),
            _ => None,
        }
    }

    pub fn is_tool_traffic(&self) -> bool {
        matches!(self.content, MessageContent::ToolCall(_) | MessageContent::ToolResult(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HistoryViolation {
    #[error("tool result references unknown call `{0}`")]
    UnknownCall(CallId),
    #[error("tool call `{0}` already has a result")]
    DuplicateResult(CallId),
    #[error("tool call id `{0}` was already used in this session")]
    DuplicateCall(CallId),
    #[error("tool calls awaiting results: {}", join_call_ids(.0))]
    UnmatchedCalls(Vec<CallId>),
    #[error("no turn is active in this session")]
    TurnNotActive,
    #[error("a turn is still in progress in this session")]
    TurnInProgress,
}

fn join_call_ids(ids: &[CallId]) -> String {
    ids.iter().map(|id| id.0.as_str()).collect::<Vec<_>>().join(", ")
}

/// A completed turn as retained by history: the user's message and the final reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub turn: u64,
    pub user: String,
    pub assistant: String,
}

/// Append-only conversation log for one session.
///
/// A fresh session reports [`SessionState::Completed`]: no turn is in flight.
/// Every mutation goes through an `append_*` method that enforces the 1:1
/// pairing between tool calls and tool results.
#[derive(Clone, Debug)]
pub struct ConversationSession {
    id: SessionId,
    messages: Vec<Message>,
    state: SessionState,
    iteration: u32,
    turn: u64,
    next_sequence: u64,
    open_calls: Vec<CallId>,
    seen_calls: BTreeSet<CallId>,
}

impl ConversationSession {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            messages: Vec::new(),
            state: SessionState::Completed,
            iteration: 0,
            turn: 0,
            next_sequence: 0,
            open_calls: Vec::new(),
            seen_calls: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn is_turn_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn pending_calls(&self) -> &[CallId] {
        &self.open_calls
    }

    pub fn begin_turn(&mut self) -> Result<u64, HistoryViolation> {
        if self.is_turn_active() {
            return Err(HistoryViolation::TurnInProgress);
        }
        self.turn += 1;
        self.iteration = 0;
        self.state = SessionState::Active;
        Ok(self.turn)
    }

    /// Counts one request/response round of the active turn and returns the new count.
    pub fn record_iteration(&mut self) -> u32 {
        self.iteration += 1;
        self.iteration
    }

    pub fn append_user_text(&mut self, text: impl Into<String>) -> Result<(), HistoryViolation> {
        self.ensure_at_boundary()?;
        self.push(Role::User, MessageContent::Text { text: text.into() });
        Ok(())
    }

    pub fn append_assistant_text(
        &mut self,
        text: impl Into<String>,
    ) -> Result<(), HistoryViolation> {
        self.ensure_at_boundary()?;
        self.push(Role::Assistant, MessageContent::Text { text: text.into() });
        Ok(())
    }

    pub fn append_tool_call(&mut self, call: ToolCall) -> Result<(), HistoryViolation> {
        self.ensure_active()?;
        if !self.seen_calls.insert(call.id.clone()) {
            return Err(HistoryViolation::DuplicateCall(call.id));
        }
        self.open_calls.push(call.id.clone());
        self.push(Role::Assistant, MessageContent::ToolCall(call));
        Ok(())
    }

    pub fn append_tool_result(&mut self, result: ToolResult) -> Result<(), HistoryViolation> {
        self.ensure_active()?;
        let Some(position) = self.open_calls.iter().position(|id| id == &result.call_id) else {
            if self.seen_calls.contains(&result.call_id) {
                return Err(HistoryViolation::DuplicateResult(result.call_id));
            }
            return Err(HistoryViolation::UnknownCall(result.call_id));
        };
        self.open_calls.remove(position);
        self.push(Role::Tool, MessageContent::ToolResult(result));
        Ok(())
    }

    pub fn complete_turn(&mut self) -> Result<(), HistoryViolation> {
        self.ensure_at_boundary()?;
        self.state = SessionState::Completed;
        Ok(())
    }

    pub fn abort_turn(&mut self) {
        self.state = SessionState::Aborted;
    }

    /// Scans the whole log and checks the tool-call/tool-result pairing.
    pub fn verify_pairing(&self) -> Result<(), HistoryViolation> {
        verify_messages(&self.messages)
    }

    /// Drops every message while keeping turn and sequence counters monotonic.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.open_calls.clear();
        self.seen_calls.clear();
        self.iteration = 0;
        if self.state == SessionState::Active {
            self.state = SessionState::Aborted;
        }
    }

    /// Swaps in a pruned history. Only allowed between turns and only for logs
    /// that satisfy the pairing invariant.
    pub fn replace_history(&mut self, messages: Vec<Message>) -> Result<(), HistoryViolation> {
        if self.is_turn_active() {
            return Err(HistoryViolation::TurnInProgress);
        }
        verify_messages(&messages)?;
        self.seen_calls = messages
            .iter()
            .filter_map(|message| message.tool_call().map(|call| call.id.clone()))
            .collect();
        self.open_calls.clear();
        self.messages = messages;
        Ok(())
    }

    /// Exchanges of turns that have finished, in turn order.
    pub fn exchanges(&self) -> Vec<Exchange> {
        let mut exchanges: Vec<Exchange> = Vec::new();
        let mut current: Option<(u64, String, Option<String>)> = None;

        for message in &self.messages {
            if self.is_turn_active() && message.turn == self.turn {
                break;
            }
            let Some(text) = message.text() else {
                continue;
            };
            match message.role {
                Role::User => {
                    if let Some((turn, user, Some(assistant))) = current.take() {
                        exchanges.push(Exchange { turn, user, assistant });
                    }
                    current = Some((message.turn, text.to_string(), None));
                }
                Role::Assistant => {
                    if let Some((turn, _, assistant)) = current.as_mut() {
                        if *turn == message.turn {
                            *assistant = Some(text.to_string());
                        }
                    }
                }
                Role::Tool => {}
            }
        }

        if let Some((turn, user, Some(assistant))) = current {
            exchanges.push(Exchange { turn, user, assistant });
        }
        exchanges
    }

    fn ensure_active(&self) -> Result<(), HistoryViolation> {
        if self.is_turn_active() {
            Ok(())
        } else {
            Err(HistoryViolation::TurnNotActive)
        }
    }

    fn ensure_at_boundary(&self) -> Result<(), HistoryViolation> {
        self.ensure_active()?;
        if self.open_calls.is_empty() {
            Ok(())
        } else {
            Err(HistoryViolation::UnmatchedCalls(self.open_calls.clone()))
        }
    }

    fn push(&mut self, role: Role, content: MessageContent) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.messages.push(Message { sequence, turn: self.turn, role, content });
    }
}

fn verify_messages(messages: &[Message]) -> Result<(), HistoryViolation> {
    let mut open: Vec<&CallId> = Vec::new();
    let mut seen: BTreeSet<&CallId> = BTreeSet::new();

    for message in messages {
        match &message.content {
            MessageContent::ToolCall(call) => {
                if !seen.insert(&call.id) {
                    return Err(HistoryViolation::DuplicateCall(call.id.clone()));
                }
                open.push(&call.id);
            }
            MessageContent::ToolResult(result) => {
                match open.iter().position(|id| *id == &result.call_id) {
                    Some(position) => {
                        open.remove(position);
                    }
                    None if seen.contains(&result.call_id) => {
                        return Err(HistoryViolation::DuplicateResult(result.call_id.clone()));
                    }
                    None => return Err(HistoryViolation::UnknownCall(result.call_id.clone())),
                }
            }
            MessageContent::Text { .. } => {}
        }
    }

    if open.is_empty() {
        Ok(())
    } else {
        Err(HistoryViolation::UnmatchedCalls(open.into_iter().cloned().collect()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        CallId, ConversationSession, HistoryViolation, SessionId, SessionState, ToolCall,
        ToolResult,
    };

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: CallId(id.to_string()),
            tool_name: "list_workflows".to_string(),
            arguments: json!({}),
        }
    }

    fn session() -> ConversationSession {
        ConversationSession::new(SessionId("s-1".to_string()))
    }

    #[test]
    fn fresh_session_has_no_active_turn() {
        let session = session();
        assert_eq!(session.state(), SessionState::Completed);
        assert!(session.messages().is_empty());
        assert_eq!(session.turn(), 0);
    }

    #[test]
    fn appends_outside_turn_are_rejected() {
        let mut session = session();
        assert_eq!(session.append_user_text("hi"), Err(HistoryViolation::TurnNotActive));
    }

    #[test]
    fn tool_result_must_match_an_open_call() {
        let mut session = session();
        session.begin_turn().expect("begin turn");
        session.append_user_text("list workflows").expect("user");

        let orphan = ToolResult::success(CallId("missing".to_string()), "{}");
        assert_eq!(
            session.append_tool_result(orphan),
            Err(HistoryViolation::UnknownCall(CallId("missing".to_string())))
        );

        session.append_tool_call(call("c1")).expect("call");
        session.append_tool_result(ToolResult::success(CallId("c1".to_string()), "[]")).expect("result");

        let duplicate = ToolResult::success(CallId("c1".to_string()), "[]");
        assert_eq!(
            session.append_tool_result(duplicate),
            Err(HistoryViolation::DuplicateResult(CallId("c1".to_string())))
        );
        assert!(session.verify_pairing().is_ok());
    }

    #[test]
    fn text_cannot_be_appended_while_calls_are_open() {
        let mut session = session();
        session.begin_turn().expect("begin turn");
        session.append_user_text("question").expect("user");
        session.append_tool_call(call("c1")).expect("call");

        assert_eq!(
            session.append_assistant_text("answer"),
            Err(HistoryViolation::UnmatchedCalls(vec![CallId("c1".to_string())]))
        );
        assert!(matches!(session.verify_pairing(), Err(HistoryViolation::UnmatchedCalls(_))));
        assert!(session.complete_turn().is_err());
    }

    #[test]
    fn duplicate_call_ids_are_rejected() {
        let mut session = session();
        session.begin_turn().expect("begin turn");
        session.append_tool_call(call("c1")).expect("call");
        assert_eq!(
            session.append_tool_call(call("c1")),
            Err(HistoryViolation::DuplicateCall(CallId("c1".to_string())))
        );
    }

    #[test]
    fn exchanges_pair_user_text_with_final_reply() {
        let mut session = session();
        session.begin_turn().expect("turn 1");
        session.append_user_text("first").expect("user");
        session.append_assistant_text("looking it up").expect("narration");
        session.append_tool_call(call("c1")).expect("call");
        session.append_tool_result(ToolResult::success(CallId("c1".to_string()), "ok")).expect("result");
        session.append_assistant_text("first answer").expect("reply");
        session.complete_turn().expect("complete");

        session.begin_turn().expect("turn 2");
        session.append_user_text("second").expect("user");

        let exchanges = session.exchanges();
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].user, "first");
        assert_eq!(exchanges[0].assistant, "first answer");
    }

    #[test]
    fn sequence_numbers_are_monotonic_across_reset() {
        let mut session = session();
        session.begin_turn().expect("turn");
        session.append_user_text("one").expect("user");
        session.append_assistant_text("two").expect("assistant");
        session.complete_turn().expect("complete");
        let last = session.messages().last().map(|m| m.sequence).unwrap_or_default();

        session.reset();
        session.begin_turn().expect("turn");
        session.append_user_text("three").expect("user");

        assert_eq!(session.messages().len(), 1);
        assert!(session.messages()[0].sequence > last);
    }

    #[test]
    fn replace_history_is_refused_mid_turn() {
        let mut session = session();
        session.begin_turn().expect("turn");
        assert_eq!(session.replace_history(Vec::new()), Err(HistoryViolation::TurnInProgress));
    }
}
