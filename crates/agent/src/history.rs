use std::collections::BTreeSet;

use serde::Serialize;
use tracing::debug;

use finops_core::domain::conversation::{
    ConversationSession, Exchange, HistoryViolation, Message, Role, SessionId, SessionState,
};

/// Read-only view of a session for display.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HistorySnapshot {
    pub session_id: SessionId,
    pub state: SessionState,
    pub turn: u64,
    pub message_count: usize,
    pub exchanges: Vec<Exchange>,
}

/// Bounds a session to its most recent exchanges once a turn has ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryManager {
    max_exchanges: usize,
}

impl HistoryManager {
    pub fn new(max_exchanges: usize) -> Self {
        Self { max_exchanges }
    }

    pub fn max_exchanges(&self) -> usize {
        self.max_exchanges
    }

    /// Keeps the user message and final assistant text of the last
    /// `max_exchanges` finished turns; everything else is dropped. Returns the
    /// number of removed messages.
    pub fn prune(&self, session: &mut ConversationSession) -> Result<usize, HistoryViolation> {
        if session.is_turn_active() {
            return Err(HistoryViolation::TurnInProgress);
        }

        let exchanges = session.exchanges();
        let skip = exchanges.len().saturating_sub(self.max_exchanges);
        let kept_turns: BTreeSet<u64> = exchanges[skip..].iter().map(|exchange| exchange.turn).collect();

        let retained = retain_exchanges(session.messages(), &kept_turns);
        let removed = session.messages().len() - retained.len();
        session.replace_history(retained)?;

        if removed > 0 {
            debug!(
                event_name = "agent.history.pruned",
                session_id = %session.id(),
                removed,
                kept_exchanges = kept_turns.len(),
                "history pruned"
            );
        }
        Ok(removed)
    }

    pub fn reset(&self, session: &mut ConversationSession) {
        session.reset();
        debug!(event_name = "agent.history.reset", session_id = %session.id(), "history cleared");
    }

    pub fn snapshot(&self, session: &ConversationSession) -> HistorySnapshot {
        HistorySnapshot {
            session_id: session.id().clone(),
            state: session.state(),
            turn: session.turn(),
            message_count: session.messages().len(),
            exchanges: session.exchanges(),
        }
    }
}

fn retain_exchanges(messages: &[Message], turns: &BTreeSet<u64>) -> Vec<Message> {
    let mut retained = Vec::with_capacity(turns.len() * 2);
    for &turn in turns {
        let in_turn = || messages.iter().filter(move |m| m.turn == turn && m.text().is_some());
        if let Some(user) = in_turn().find(|m| m.role == Role::User) {
            retained.push(user.clone());
        }
        if let Some(reply) = in_turn().filter(|m| m.role == Role::Assistant).last() {
            retained.push(reply.clone());
        }
    }
    retained.sort_by_key(|message| message.sequence);
    retained
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use finops_core::domain::conversation::{
        CallId, ConversationSession, HistoryViolation, SessionId, ToolCall, ToolResult,
    };

    use super::HistoryManager;

    fn run_turn(session: &mut ConversationSession, n: u64) {
        session.begin_turn().expect("begin");
        session.append_user_text(format!("question {n}")).expect("user");
        session.append_assistant_text("let me check").expect("narration");
        let id = CallId(format!("call_{n}"));
        session
            .append_tool_call(ToolCall { id: id.clone(), tool_name: "list_kpis".into(), arguments: json!({}) })
            .expect("call");
        session.append_tool_result(ToolResult::success(id, "[]")).expect("result");
        session.append_assistant_text(format!("answer {n}")).expect("reply");
        session.complete_turn().expect("complete");
    }

    #[test]
    fn prune_keeps_the_last_exchanges_without_tool_traffic() {
        let mut session = ConversationSession::new(SessionId("s".into()));
        for n in 1..=5 {
            run_turn(&mut session, n);
        }

        let manager = HistoryManager::new(2);
        let removed = manager.prune(&mut session).expect("prune");
        assert_eq!(removed, 25 - 4);

        let texts: Vec<&str> = session.messages().iter().filter_map(|m| m.text()).collect();
        assert_eq!(texts, vec!["question 4", "answer 4", "question 5", "answer 5"]);
        assert!(session.messages().iter().all(|m| !m.is_tool_traffic()));
        assert!(session.verify_pairing().is_ok());
    }

    #[test]
    fn prune_refuses_a_turn_in_progress() {
        let mut session = ConversationSession::new(SessionId("s".into()));
        session.begin_turn().expect("begin");
        session.append_user_text("hello").expect("user");
        let manager = HistoryManager::new(1);
        assert_eq!(manager.prune(&mut session), Err(HistoryViolation::TurnInProgress));
    }

    #[test]
    fn snapshot_reports_exchanges() {
        let mut session = ConversationSession::new(SessionId("s".into()));
        run_turn(&mut session, 1);
        let manager = HistoryManager::new(10);
        let snapshot = manager.snapshot(&session);
        assert_eq!(snapshot.exchanges.len(), 1);
        assert_eq!(snapshot.exchanges[0].assistant, "answer 1");
        assert_eq!(snapshot.message_count, 5);

        manager.reset(&mut session);
        assert_eq!(manager.snapshot(&session).message_count, 0);
    }
}
