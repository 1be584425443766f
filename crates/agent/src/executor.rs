//! Dispatches tool calls against the registry and turns every outcome,
//! including panics and timeouts, into a [`ToolResult`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use finops_core::config::{AppConfig, OrchestrationConfig};
use finops_core::domain::conversation::{SessionId, ToolCall, ToolResult, ToolStatus};

use crate::tools::{DispatchMode, ToolContext, ToolError, ToolOutput, ToolRegistry};

/// Time a cancelled handler gets to release its resources before it is dropped.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub tool_timeout: Duration,
    pub result_char_limit: usize,
    pub max_concurrent: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default().orchestration)
    }
}

impl From<&OrchestrationConfig> for ExecutorSettings {
    fn from(config: &OrchestrationConfig) -> Self {
        Self {
            tool_timeout: Duration::from_secs(config.tool_timeout_secs),
            result_char_limit: config.result_char_limit,
            max_concurrent: config.max_concurrent_tools.max(1),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Dispatched {
    pub result: ToolResult,
    pub elapsed: Duration,
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    settings: ExecutorSettings,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, settings: ExecutorSettings) -> Self {
        Self { registry, settings }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Unknown tools count as sequential.
    pub fn dispatch_mode(&self, tool_name: &str) -> DispatchMode {
        self.registry
            .get(tool_name)
            .map_or(DispatchMode::Sequential, |tool| tool.kind().dispatch_mode())
    }

    pub async fn dispatch(&self, call: &ToolCall, session_id: &SessionId) -> Dispatched {
        let started = Instant::now();
        let outcome = self.run(call, session_id).await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(output) => self.to_result(call, output),
            Err(error) => {
                warn!(
                    event_name = "agent.tool.failed",
                    session_id = %session_id,
                    call_id = %call.id,
                    tool = %call.tool_name,
                    code = error.code(),
                    error = %error,
                    "tool call failed"
                );
                let payload = error_payload(&call.tool_name, error.code(), Value::String(error.to_string()));
                self.bounded(call, ToolStatus::Error, payload)
            }
        };

        info!(
            event_name = "agent.tool.finished",
            session_id = %session_id,
            call_id = %call.id,
            tool = %call.tool_name,
            status = result.status.as_str(),
            truncated = result.truncated,
            elapsed_ms = elapsed.as_millis() as u64,
            "tool call finished"
        );
        Dispatched { result, elapsed }
    }

    /// Runs calls with at most `max_concurrent` in flight; results come back
    /// in request order.
    pub async fn dispatch_batch(&self, calls: &[ToolCall], session_id: &SessionId) -> Vec<Dispatched> {
        let pending: Vec<_> = calls.iter().map(|call| self.dispatch(call, session_id)).collect();
        futures::stream::iter(pending)
            .buffered(self.settings.max_concurrent)
            .collect()
            .await
    }

    async fn run(&self, call: &ToolCall, session_id: &SessionId) -> Result<ToolOutput, ToolError> {
        let Some(tool) = self.registry.get(&call.tool_name) else {
            return Err(ToolError::UnknownTool(call.tool_name.clone()));
        };
        tool.validate(&call.arguments)?;

        let cancel = CancellationToken::new();
        let context = ToolContext {
            session_id: session_id.clone(),
            call_id: call.id.clone(),
            cancel: cancel.clone(),
        };
        let handler = tool.handler();
        let invocation = AssertUnwindSafe(handler.call(call.arguments.clone(), &context)).catch_unwind();
        tokio::pin!(invocation);

        let timeout = self.settings.tool_timeout;
        let finished = tokio::select! {
            finished = &mut invocation => finished,
            _ = tokio::time::sleep(timeout) => {
                cancel.cancel();
                // Give the handler a chance to kill and reap what it started.
                let _ = tokio::time::timeout(CANCEL_GRACE, &mut invocation).await;
                return Err(ToolError::Timeout(timeout));
            }
        };

        match finished {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|text| (*text).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                Err(ToolError::Execution(format!("handler panicked: {message}")))
            }
        }
    }

    fn to_result(&self, call: &ToolCall, output: ToolOutput) -> ToolResult {
        match output.status {
            ToolStatus::Success => {
                let payload = match output.value {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                self.bounded(call, ToolStatus::Success, payload)
            }
            ToolStatus::Error => {
                let code = ToolError::Execution(String::new()).code();
                let payload = error_payload(&call.tool_name, code, output.value);
                self.bounded(call, ToolStatus::Error, payload)
            }
        }
    }

    fn bounded(&self, call: &ToolCall, status: ToolStatus, payload: String) -> ToolResult {
        let (payload, truncated) = truncate(payload, self.settings.result_char_limit);
        ToolResult { call_id: call.id.clone(), status, payload, truncated }
    }
}

pub fn error_payload(tool_name: &str, code: &str, details: Value) -> String {
    json!({ "error": code, "tool": tool_name, "details": details }).to_string()
}

/// Keeps the first `limit` characters and appends a marker when anything was cut.
pub fn truncate(payload: String, limit: usize) -> (String, bool) {
    let total = payload.chars().count();
    if total <= limit {
        return (payload, false);
    }
    let mut kept: String = payload.chars().take(limit).collect();
    kept.push_str(&format!("\n…[truncated: showing {limit} of {total} characters]"));
    (kept, true)
}

/// Whether every call in `calls` may share one concurrent batch.
pub fn all_concurrent(executor: &ToolExecutor, calls: &[ToolCall]) -> bool {
    calls.iter().all(|call| executor.dispatch_mode(&call.tool_name) == DispatchMode::Concurrent)
}
