use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use finops_core::config::{AppConfig, LoadOptions};
use toml::Value;

/// Displayed keys with the environment variables that can set them, highest
/// precedence first. Values are always read from the redacted view.
const FIELDS: &[(&str, &[&str])] = &[
    ("database.url", &["FINOPS_DATABASE_URL"]),
    ("database.max_connections", &["FINOPS_DATABASE_MAX_CONNECTIONS"]),
    ("database.timeout_secs", &["FINOPS_DATABASE_TIMEOUT_SECS"]),
    ("llm.api_key", &["FINOPS_LLM_API_KEY", "ANTHROPIC_API_KEY"]),
    ("llm.base_url", &["FINOPS_LLM_BASE_URL"]),
    ("llm.model", &["FINOPS_LLM_MODEL"]),
    ("llm.max_tokens", &["FINOPS_LLM_MAX_TOKENS"]),
    ("llm.timeout_secs", &["FINOPS_LLM_TIMEOUT_SECS"]),
    ("llm.max_retries", &["FINOPS_LLM_MAX_RETRIES"]),
    ("orchestration.max_iterations", &["FINOPS_ORCHESTRATION_MAX_ITERATIONS"]),
    ("orchestration.tool_timeout_secs", &["FINOPS_ORCHESTRATION_TOOL_TIMEOUT_SECS"]),
    ("orchestration.history_exchanges", &["FINOPS_ORCHESTRATION_HISTORY_EXCHANGES"]),
    ("orchestration.max_concurrent_tools", &["FINOPS_ORCHESTRATION_MAX_CONCURRENT_TOOLS"]),
    ("orchestration.result_char_limit", &[]),
    ("orchestration.event_preview_chars", &[]),
    ("orchestration.session_idle_secs", &[]),
    ("sandbox.workspace_root", &["FINOPS_SANDBOX_WORKSPACE_ROOT"]),
    ("sandbox.timeout_secs", &["FINOPS_SANDBOX_TIMEOUT_SECS"]),
    ("sandbox.output_limit_bytes", &["FINOPS_SANDBOX_OUTPUT_LIMIT_BYTES"]),
    ("sandbox.python_bin", &["FINOPS_SANDBOX_PYTHON_BIN"]),
    ("sandbox.node_bin", &["FINOPS_SANDBOX_NODE_BIN"]),
    ("sandbox.keep_artifacts", &["FINOPS_SANDBOX_KEEP_ARTIFACTS"]),
    ("cloud.region", &["FINOPS_CLOUD_REGION", "AWS_REGION"]),
    ("cloud.access_key_id", &["FINOPS_CLOUD_ACCESS_KEY_ID", "AWS_ACCESS_KEY_ID"]),
    ("cloud.secret_access_key", &["FINOPS_CLOUD_SECRET_ACCESS_KEY", "AWS_SECRET_ACCESS_KEY"]),
    ("cloud.session_token", &["FINOPS_CLOUD_SESSION_TOKEN", "AWS_SESSION_TOKEN"]),
    ("cloud.cur_database", &["FINOPS_CLOUD_CUR_DATABASE"]),
    ("cloud.cur_table", &["FINOPS_CLOUD_CUR_TABLE"]),
    ("logging.level", &["FINOPS_LOGGING_LEVEL", "FINOPS_LOG_LEVEL"]),
    ("logging.format", &["FINOPS_LOGGING_FORMAT", "FINOPS_LOG_FORMAT"]),
];

pub fn run(json_output: bool) -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };
    let redacted = config.redacted();

    if json_output {
        return serde_json::to_string_pretty(&redacted)
            .unwrap_or_else(|error| format!("config serialization failed: {error}"));
    }

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key_path, env_keys) in FIELDS {
        let pointer = format!("/{}", key_path.replace('.', "/"));
        let value = redacted.pointer(&pointer).map(render_value).unwrap_or_else(|| "<unset>".into());
        lines.push(render_line(
            key_path,
            &value,
            field_source(
                key_path,
                env_keys,
                config_file_doc.as_ref(),
                config_file_path.as_deref(),
            ),
        ));
    }

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("finops.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/finops.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "<unset>".to_string(),
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
