pub mod config;
pub mod domain;
pub mod errors;
pub mod events;

pub use config::{AppConfig, ConfigError, LoadOptions, LogFormat};
pub use domain::conversation::{
    CallId, ConversationSession, Exchange, HistoryViolation, Message, MessageContent, Role,
    SessionId, SessionState, ToolCall, ToolResult, ToolStatus,
};
pub use domain::kpi::{Kpi, KpiFormat, KpiId, KpiPatch, KpiQueryType, KpiTrend, NewKpi};
pub use domain::sandbox::{Language, SandboxExecution, SandboxOutcome};
pub use domain::workflow::{NewWorkflow, Workflow, WorkflowId, WorkflowPatch, WorkflowSummary};
pub use errors::{ApplicationError, DomainError, InterfaceError, TurnError};
pub use events::{EventSink, InMemoryEventSink, NullEventSink, TurnEvent};
