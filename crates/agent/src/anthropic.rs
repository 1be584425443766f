//! [`CompletionClient`] over the Anthropic Messages API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Map, Value};
use tracing::debug;

use finops_core::config::LlmConfig;
use finops_core::domain::conversation::{CallId, Message, MessageContent, Role, ToolCall};

use crate::llm::{CompletionClient, CompletionError, CompletionRequest, CompletionResponse};

pub const API_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: Client,
    endpoint: String,
    api_key: SecretString,
    model: String,
}

impl AnthropicClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, CompletionError> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            CompletionError::Rejected("no API key configured (set FINOPS_LLM_API_KEY)".into())
        })?;
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| CompletionError::Rejected(format!("http client: {error}")))?;
        Ok(Self {
            http,
            endpoint: format!("{}/v1/messages", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl CompletionClient for AnthropicClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        let body = request_body(&self.model, request);
        let response = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() || error.is_connect() || error.is_request() {
                    CompletionError::Transient(error.to_string())
                } else {
                    CompletionError::Rejected(error.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|error| CompletionError::Transient(format!("reading response: {error}")))?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let payload: Value = serde_json::from_str(&text)
            .map_err(|error| CompletionError::Malformed(error.to_string()))?;
        let parsed = parse_response(&payload)?;
        debug!(
            event_name = "agent.completion.received",
            model = %self.model,
            tool_calls = parsed.tool_calls.len(),
            stop_reason = payload.get("stop_reason").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
            "completion received"
        );
        Ok(parsed)
    }
}

fn classify_status(status: StatusCode, body: &str) -> CompletionError {
    let detail = format!("{status}: {}", body.chars().take(500).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() || status.as_u16() == 529 {
        CompletionError::Transient(detail)
    } else {
        CompletionError::Rejected(detail)
    }
}

pub fn request_body(model: &str, request: &CompletionRequest) -> Value {
    let mut body = json!({
        "model": model,
        "max_tokens": request.max_tokens,
        "system": request.system,
        "messages": wire_messages(&request.messages),
    });
    if !request.tools.is_empty() {
        body["tools"] = json!(request.tools);
    }
    body
}

/// Maps the conversation log onto alternating user/assistant wire messages.
/// Tool results travel as user content; adjacent messages of the same wire
/// role are merged into one.
pub fn wire_messages(messages: &[Message]) -> Vec<Value> {
    let mut wire: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for message in messages {
        let block = match &message.content {
            MessageContent::Text { text } if text.trim().is_empty() => continue,
            MessageContent::Text { text } => json!({ "type": "text", "text": text }),
            MessageContent::ToolCall(call) => json!({
                "type": "tool_use",
                "id": call.id.0,
                "name": call.tool_name,
                "input": call.arguments,
            }),
            MessageContent::ToolResult(result) => json!({
                "type": "tool_result",
                "tool_use_id": result.call_id.0,
                "content": result.payload,
                "is_error": result.is_error(),
            }),
        };
        let role = match message.role {
            Role::Assistant => "assistant",
            Role::User | Role::Tool => "user",
        };
        match wire.last_mut() {
            Some((last_role, blocks)) if *last_role == role => blocks.push(block),
            _ => wire.push((role, vec![block])),
        }
    }
    wire.into_iter()
        .map(|(role, content)| json!({ "role": role, "content": content }))
        .collect()
}

pub fn parse_response(payload: &Value) -> Result<CompletionResponse, CompletionError> {
    let blocks = payload
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| CompletionError::Malformed("response has no content array".into()))?;

    let mut texts: Vec<&str> = Vec::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    texts.push(text);
                }
            }
            Some("tool_use") => {
                let id = block.get("id").and_then(Value::as_str);
                let name = block.get("name").and_then(Value::as_str);
                let (Some(id), Some(name)) = (id, name) else {
                    return Err(CompletionError::Malformed("tool_use block without id or name".into()));
                };
                let arguments = block.get("input").cloned().unwrap_or_else(|| Value::Object(Map::new()));
                tool_calls.push(ToolCall {
                    id: CallId(id.to_string()),
                    tool_name: name.to_string(),
                    arguments,
                });
            }
            _ => {}
        }
    }

    let text = texts.join("\n");
    Ok(CompletionResponse {
        text: if text.trim().is_empty() { None } else { Some(text) },
        tool_calls,
    })
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use serde_json::json;

    use finops_core::domain::conversation::{
        CallId, ConversationSession, SessionId, ToolCall, ToolResult,
    };

    use super::{classify_status, parse_response, request_body, wire_messages};
    use crate::llm::{CompletionError, CompletionRequest};
    use crate::tools::ToolKind;

    fn session_with_tool_round() -> ConversationSession {
        let mut session = ConversationSession::new(SessionId("s".into()));
        session.begin_turn().expect("begin");
        session.append_user_text("list my workflows").expect("user");
        session.append_assistant_text("Checking.").expect("narration");
        session
            .append_tool_call(ToolCall {
                id: CallId("toolu_1".into()),
                tool_name: "list_workflows".into(),
                arguments: json!({}),
            })
            .expect("call");
        session
            .append_tool_result(ToolResult::success(CallId("toolu_1".into()), "{\"count\":0}"))
            .expect("result");
        session
    }

    #[test]
    fn tool_traffic_maps_to_alternating_roles() {
        let session = session_with_tool_round();
        let wire = wire_messages(session.messages());

        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[1]["role"], "assistant");
        assert_eq!(wire[1]["content"][0]["type"], "text");
        assert_eq!(wire[1]["content"][1]["type"], "tool_use");
        assert_eq!(wire[1]["content"][1]["id"], "toolu_1");
        assert_eq!(wire[2]["role"], "user");
        assert_eq!(wire[2]["content"][0]["tool_use_id"], "toolu_1");
        assert_eq!(wire[2]["content"][0]["is_error"], false);
    }

    #[test]
    fn request_body_carries_tools_only_when_present() {
        let mut request = CompletionRequest {
            system: "sys".into(),
            messages: Vec::new(),
            tools: Vec::new(),
            max_tokens: 128,
        };
        assert!(request_body("m", &request).get("tools").is_none());

        request.tools.push(ToolKind::ListWorkflows.spec());
        let body = request_body("m", &request);
        assert_eq!(body["tools"][0]["name"], "list_workflows");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn mixed_responses_keep_text_and_calls() {
        let response = parse_response(&json!({
            "content": [
                { "type": "text", "text": "Let me look." },
                { "type": "tool_use", "id": "toolu_9", "name": "list_kpis", "input": {} }
            ],
            "stop_reason": "tool_use"
        }))
        .expect("parse");
        assert_eq!(response.text.as_deref(), Some("Let me look."));
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].id, CallId("toolu_9".into()));
        assert!(!response.is_terminal());

        assert!(matches!(parse_response(&json!({})), Err(CompletionError::Malformed(_))));
    }

    #[test]
    fn overload_and_rate_limits_are_transient() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_status(StatusCode::from_u16(529).expect("status"), "overloaded").is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "bad").is_retryable());
    }
}
