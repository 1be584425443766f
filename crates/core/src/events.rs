use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::conversation::{CallId, SessionId, ToolStatus};
use crate::errors::TurnError;

/// Observer notifications produced while a turn runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    ToolStarted {
        session_id: SessionId,
        call_id: CallId,
        tool_name: String,
        arguments: Value,
        occurred_at: DateTime<Utc>,
    },
    ToolFinished {
        session_id: SessionId,
        call_id: CallId,
        tool_name: String,
        status: ToolStatus,
        /// Result payload cut to the configured preview length.
        preview: String,
        elapsed_ms: u64,
        occurred_at: DateTime<Utc>,
    },
    AssistantText {
        session_id: SessionId,
        text: String,
        occurred_at: DateTime<Utc>,
    },
    TurnComplete {
        session_id: SessionId,
        turn: u64,
        iterations: u32,
        occurred_at: DateTime<Utc>,
    },
    TurnError {
        session_id: SessionId,
        turn: u64,
        error: TurnError,
        occurred_at: DateTime<Utc>,
    },
}

impl TurnEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::ToolStarted { session_id, .. }
            | Self::ToolFinished { session_id, .. }
            | Self::AssistantText { session_id, .. }
            | Self::TurnComplete { session_id, .. }
            | Self::TurnError { session_id, .. } => session_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ToolStarted { .. } => "tool_started",
            Self::ToolFinished { .. } => "tool_finished",
            Self::AssistantText { .. } => "assistant_text",
            Self::TurnComplete { .. } => "turn_complete",
            Self::TurnError { .. } => "turn_error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnComplete { .. } | Self::TurnError { .. })
    }
}

/// Cuts `text` to at most `limit` characters, marking the cut with an ellipsis.
pub fn preview(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((byte_index, _)) => format!("{}…", &text[..byte_index]),
        None => text.to_owned(),
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: TurnEvent);
}

/// Drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: TurnEvent) {}
}

#[derive(Clone, Default)]
pub struct InMemoryEventSink {
    events: Arc<Mutex<Vec<TurnEvent>>>,
}

impl InMemoryEventSink {
    pub fn events(&self) -> Vec<TurnEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn clear(&self) {
        match self.events.lock() {
            Ok(mut events) => events.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

impl EventSink for InMemoryEventSink {
    fn emit(&self, event: TurnEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::domain::conversation::SessionId;
    use crate::errors::TurnError;
    use crate::events::{preview, EventSink, InMemoryEventSink, TurnEvent};

    #[test]
    fn in_memory_sink_records_events_in_order() {
        let sink = InMemoryEventSink::default();
        let session_id = SessionId("s-42".to_owned());
        sink.emit(TurnEvent::AssistantText {
            session_id: session_id.clone(),
            text: "checking costs".to_owned(),
            occurred_at: Utc::now(),
        });
        sink.emit(TurnEvent::TurnError {
            session_id: session_id.clone(),
            turn: 1,
            error: TurnError::IterationCapExceeded(2),
            occurred_at: Utc::now(),
        });

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "assistant_text");
        assert!(events[1].is_terminal());
        assert_eq!(events[1].session_id(), &session_id);
    }

    #[test]
    fn preview_respects_char_boundaries() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("€€€€", 2), "€€…");
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = TurnEvent::TurnComplete {
            session_id: SessionId("s-1".to_owned()),
            turn: 3,
            iterations: 2,
            occurred_at: Utc::now(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "turn_complete");
        assert_eq!(json["iterations"], 2);
    }
}
