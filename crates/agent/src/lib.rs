//! Agent Runtime - bounded LLM tool orchestration for cost analysis
//!
//! This crate drives a conversation between a user, a completion service and
//! a fixed catalogue of FinOps tools:
//! - Submits the session history and tool catalogue to the model
//! - Dispatches the tool calls it asks for, including sandboxed code runs
//! - Feeds results back until the model answers or the iteration cap hits
//!
//! # Architecture
//!
//! 1. **Completion** (`llm`, `anthropic`) - request/response model and HTTP client
//! 2. **Catalogue** (`tools`, `handlers`) - closed tool enum bound to collaborators
//! 3. **Dispatch** (`executor`) - schema checks, timeouts, truncation
//! 4. **Sandbox** (`sandbox`) - arena-scoped interpreter runs
//! 5. **Loop** (`runtime`) - one turn, appended message by message
//! 6. **Hosting** (`sessions`, `history`) - per-session workers and pruning
//!
//! # Safety Principle
//!
//! Tool failures never end a turn. Every call gets exactly one result, and
//! only history that satisfies that pairing is ever sent back to the model.

pub mod anthropic;
pub mod collaborators;
pub mod executor;
pub mod handlers;
pub mod history;
pub mod llm;
pub mod prompt;
pub mod runtime;
pub mod sandbox;
pub mod sessions;
pub mod tools;

pub use executor::{ExecutorSettings, ToolExecutor};
pub use handlers::{register_available, Collaborators};
pub use history::{HistoryManager, HistorySnapshot};
pub use llm::{CompletionClient, CompletionError, CompletionRequest, CompletionResponse};
pub use runtime::{AgentRuntime, RuntimeSettings, TurnOutcome, TurnStatus};
pub use sandbox::{CodeSandbox, SandboxRequest, SandboxSettings};
pub use sessions::{HubError, SessionHub};
pub use tools::{DispatchMode, ToolError, ToolKind, ToolRegistry};
