use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub orchestration: OrchestrationConfig,
    pub sandbox: SandboxConfig,
    pub cloud: CloudConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

#[derive(Clone, Debug)]
pub struct OrchestrationConfig {
    /// Request/response rounds allowed per turn.
    pub max_iterations: u32,
    pub tool_timeout_secs: u64,
    /// Completed exchanges kept after pruning.
    pub history_exchanges: usize,
    pub max_concurrent_tools: usize,
    pub result_char_limit: usize,
    pub event_preview_chars: usize,
    /// Session workers idle this long are evicted with their history. 0 keeps them until closed.
    pub session_idle_secs: u64,
}

#[derive(Clone, Debug)]
pub struct SandboxConfig {
    pub workspace_root: PathBuf,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    pub python_bin: String,
    pub node_bin: String,
    pub keep_artifacts: bool,
}

#[derive(Clone, Debug)]
pub struct CloudConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<SecretString>,
    pub session_token: Option<SecretString>,
    pub cur_database: Option<String>,
    pub cur_table: Option<String>,
}

impl CloudConfig {
    /// Environment handed to sandboxed interpreters. Secrets are exposed only here.
    pub fn sandbox_env(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("AWS_REGION".to_string(), self.region.clone()),
            ("AWS_DEFAULT_REGION".to_string(), self.region.clone()),
        ];
        if let Some(access_key_id) = &self.access_key_id {
            vars.push(("AWS_ACCESS_KEY_ID".to_string(), access_key_id.clone()));
        }
        if let Some(secret) = &self.secret_access_key {
            vars.push(("AWS_SECRET_ACCESS_KEY".to_string(), secret.expose_secret().to_string()));
        }
        if let Some(token) = &self.session_token {
            vars.push(("AWS_SESSION_TOKEN".to_string(), token.expose_secret().to_string()));
        }
        vars
    }

    /// Quoted `"database"."table"` identifier for billing report queries.
    pub fn qualified_cur_table(&self) -> Option<String> {
        let table = self.cur_table.as_deref()?;
        let quote = |ident: &str| format!("\"{}\"", ident.replace('"', "\"\""));
        Some(match self.cur_database.as_deref() {
            Some(database) => format!("{}.{}", quote(database), quote(table)),
            None => quote(table),
        })
    }
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub max_iterations: Option<u32>,
    pub sandbox_workspace_root: Option<PathBuf>,
    pub sandbox_timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://finops.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                api_key: None,
                base_url: "https://api.anthropic.com".to_string(),
                model: "claude-sonnet-4-20250514".to_string(),
                max_tokens: 4096,
                timeout_secs: 120,
                max_retries: 2,
                retry_base_delay_ms: 500,
                retry_max_delay_ms: 8_000,
            },
            orchestration: OrchestrationConfig {
                max_iterations: 50,
                tool_timeout_secs: 120,
                history_exchanges: 10,
                max_concurrent_tools: 4,
                result_char_limit: 20_000,
                event_preview_chars: 500,
                session_idle_secs: 1_800,
            },
            sandbox: SandboxConfig {
                workspace_root: PathBuf::from("workspace/runs"),
                timeout_secs: 30,
                output_limit_bytes: 64 * 1024,
                python_bin: "python3".to_string(),
                node_bin: "node".to_string(),
                keep_artifacts: false,
            },
            cloud: CloudConfig {
                region: "ap-south-1".to_string(),
                access_key_id: None,
                secret_access_key: None,
                session_token: None,
                cur_database: None,
                cur_table: None,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("finops.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = base_url;
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(max_tokens) = llm.max_tokens {
                self.llm.max_tokens = max_tokens;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
            if let Some(retry_base_delay_ms) = llm.retry_base_delay_ms {
                self.llm.retry_base_delay_ms = retry_base_delay_ms;
            }
            if let Some(retry_max_delay_ms) = llm.retry_max_delay_ms {
                self.llm.retry_max_delay_ms = retry_max_delay_ms;
            }
        }

        if let Some(orchestration) = patch.orchestration {
            if let Some(max_iterations) = orchestration.max_iterations {
                self.orchestration.max_iterations = max_iterations;
            }
            if let Some(tool_timeout_secs) = orchestration.tool_timeout_secs {
                self.orchestration.tool_timeout_secs = tool_timeout_secs;
            }
            if let Some(history_exchanges) = orchestration.history_exchanges {
                self.orchestration.history_exchanges = history_exchanges;
            }
            if let Some(max_concurrent_tools) = orchestration.max_concurrent_tools {
                self.orchestration.max_concurrent_tools = max_concurrent_tools;
            }
            if let Some(result_char_limit) = orchestration.result_char_limit {
                self.orchestration.result_char_limit = result_char_limit;
            }
            if let Some(event_preview_chars) = orchestration.event_preview_chars {
                self.orchestration.event_preview_chars = event_preview_chars;
            }
            if let Some(session_idle_secs) = orchestration.session_idle_secs {
                self.orchestration.session_idle_secs = session_idle_secs;
            }
        }

        if let Some(sandbox) = patch.sandbox {
            if let Some(workspace_root) = sandbox.workspace_root {
                self.sandbox.workspace_root = workspace_root;
            }
            if let Some(timeout_secs) = sandbox.timeout_secs {
                self.sandbox.timeout_secs = timeout_secs;
            }
            if let Some(output_limit_bytes) = sandbox.output_limit_bytes {
                self.sandbox.output_limit_bytes = output_limit_bytes;
            }
            if let Some(python_bin) = sandbox.python_bin {
                self.sandbox.python_bin = python_bin;
            }
            if let Some(node_bin) = sandbox.node_bin {
                self.sandbox.node_bin = node_bin;
            }
            if let Some(keep_artifacts) = sandbox.keep_artifacts {
                self.sandbox.keep_artifacts = keep_artifacts;
            }
        }

        if let Some(cloud) = patch.cloud {
            if let Some(region) = cloud.region {
                self.cloud.region = region;
            }
            if let Some(access_key_id) = cloud.access_key_id {
                self.cloud.access_key_id = Some(access_key_id);
            }
            if let Some(secret_access_key) = cloud.secret_access_key {
                self.cloud.secret_access_key = Some(secret_value(secret_access_key));
            }
            if let Some(session_token) = cloud.session_token {
                self.cloud.session_token = Some(secret_value(session_token));
            }
            if let Some(cur_database) = cloud.cur_database {
                self.cloud.cur_database = Some(cur_database);
            }
            if let Some(cur_table) = cloud.cur_table {
                self.cloud.cur_table = Some(cur_table);
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("FINOPS_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("FINOPS_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("FINOPS_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("FINOPS_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("FINOPS_DATABASE_TIMEOUT_SECS", &value)?;
        }

        let api_key = read_env("FINOPS_LLM_API_KEY").or_else(|| read_env("ANTHROPIC_API_KEY"));
        if let Some(value) = api_key {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("FINOPS_LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = read_env("FINOPS_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("FINOPS_LLM_MAX_TOKENS") {
            self.llm.max_tokens = parse_u32("FINOPS_LLM_MAX_TOKENS", &value)?;
        }
        if let Some(value) = read_env("FINOPS_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("FINOPS_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("FINOPS_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("FINOPS_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("FINOPS_ORCHESTRATION_MAX_ITERATIONS") {
            self.orchestration.max_iterations =
                parse_u32("FINOPS_ORCHESTRATION_MAX_ITERATIONS", &value)?;
        }
        if let Some(value) = read_env("FINOPS_ORCHESTRATION_TOOL_TIMEOUT_SECS") {
            self.orchestration.tool_timeout_secs =
                parse_u64("FINOPS_ORCHESTRATION_TOOL_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("FINOPS_ORCHESTRATION_HISTORY_EXCHANGES") {
            self.orchestration.history_exchanges =
                parse_usize("FINOPS_ORCHESTRATION_HISTORY_EXCHANGES", &value)?;
        }
        if let Some(value) = read_env("FINOPS_ORCHESTRATION_MAX_CONCURRENT_TOOLS") {
            self.orchestration.max_concurrent_tools =
                parse_usize("FINOPS_ORCHESTRATION_MAX_CONCURRENT_TOOLS", &value)?;
        }

        if let Some(value) = read_env("FINOPS_SANDBOX_WORKSPACE_ROOT") {
            self.sandbox.workspace_root = PathBuf::from(value);
        }
        if let Some(value) = read_env("FINOPS_SANDBOX_TIMEOUT_SECS") {
            self.sandbox.timeout_secs = parse_u64("FINOPS_SANDBOX_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("FINOPS_SANDBOX_OUTPUT_LIMIT_BYTES") {
            self.sandbox.output_limit_bytes =
                parse_usize("FINOPS_SANDBOX_OUTPUT_LIMIT_BYTES", &value)?;
        }
        if let Some(value) = read_env("FINOPS_SANDBOX_PYTHON_BIN") {
            self.sandbox.python_bin = value;
        }
        if let Some(value) = read_env("FINOPS_SANDBOX_NODE_BIN") {
            self.sandbox.node_bin = value;
        }
        if let Some(value) = read_env("FINOPS_SANDBOX_KEEP_ARTIFACTS") {
            self.sandbox.keep_artifacts = parse_bool("FINOPS_SANDBOX_KEEP_ARTIFACTS", &value)?;
        }

        let region = read_env("FINOPS_CLOUD_REGION").or_else(|| read_env("AWS_REGION"));
        if let Some(value) = region {
            self.cloud.region = value;
        }
        let access_key_id =
            read_env("FINOPS_CLOUD_ACCESS_KEY_ID").or_else(|| read_env("AWS_ACCESS_KEY_ID"));
        if let Some(value) = access_key_id {
            self.cloud.access_key_id = Some(value);
        }
        let secret_access_key = read_env("FINOPS_CLOUD_SECRET_ACCESS_KEY")
            .or_else(|| read_env("AWS_SECRET_ACCESS_KEY"));
        if let Some(value) = secret_access_key {
            self.cloud.secret_access_key = Some(secret_value(value));
        }
        let session_token =
            read_env("FINOPS_CLOUD_SESSION_TOKEN").or_else(|| read_env("AWS_SESSION_TOKEN"));
        if let Some(value) = session_token {
            self.cloud.session_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("FINOPS_CLOUD_CUR_DATABASE") {
            self.cloud.cur_database = Some(value);
        }
        if let Some(value) = read_env("FINOPS_CLOUD_CUR_TABLE") {
            self.cloud.cur_table = Some(value);
        }

        let log_level = read_env("FINOPS_LOGGING_LEVEL").or_else(|| read_env("FINOPS_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("FINOPS_LOGGING_FORMAT").or_else(|| read_env("FINOPS_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(max_iterations) = overrides.max_iterations {
            self.orchestration.max_iterations = max_iterations;
        }
        if let Some(workspace_root) = overrides.sandbox_workspace_root {
            self.sandbox.workspace_root = workspace_root;
        }
        if let Some(timeout_secs) = overrides.sandbox_timeout_secs {
            self.sandbox.timeout_secs = timeout_secs;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_orchestration(&self.orchestration, &self.sandbox)?;
        validate_sandbox(&self.sandbox)?;
        validate_cloud(&self.cloud)?;
        validate_logging(&self.logging)?;
        Ok(())
    }

    /// Non-secret view of the effective configuration, for operator display.
    pub fn redacted(&self) -> serde_json::Value {
        let redact = |present: bool| if present { "<redacted>" } else { "<unset>" };
        serde_json::json!({
            "database": {
                "url": self.database.url,
                "max_connections": self.database.max_connections,
                "timeout_secs": self.database.timeout_secs,
            },
            "llm": {
                "api_key": redact(self.llm.api_key.is_some()),
                "base_url": self.llm.base_url,
                "model": self.llm.model,
                "max_tokens": self.llm.max_tokens,
                "timeout_secs": self.llm.timeout_secs,
                "max_retries": self.llm.max_retries,
            },
            "orchestration": {
                "max_iterations": self.orchestration.max_iterations,
                "tool_timeout_secs": self.orchestration.tool_timeout_secs,
                "history_exchanges": self.orchestration.history_exchanges,
                "max_concurrent_tools": self.orchestration.max_concurrent_tools,
                "result_char_limit": self.orchestration.result_char_limit,
                "event_preview_chars": self.orchestration.event_preview_chars,
                "session_idle_secs": self.orchestration.session_idle_secs,
            },
            "sandbox": {
                "workspace_root": self.sandbox.workspace_root.display().to_string(),
                "timeout_secs": self.sandbox.timeout_secs,
                "output_limit_bytes": self.sandbox.output_limit_bytes,
                "python_bin": self.sandbox.python_bin,
                "node_bin": self.sandbox.node_bin,
                "keep_artifacts": self.sandbox.keep_artifacts,
            },
            "cloud": {
                "region": self.cloud.region,
                "access_key_id": redact(self.cloud.access_key_id.is_some()),
                "secret_access_key": redact(self.cloud.secret_access_key.is_some()),
                "session_token": redact(self.cloud.session_token.is_some()),
                "cur_database": self.cloud.cur_database,
                "cur_table": self.cloud.cur_table,
            },
            "logging": {
                "level": self.logging.level,
                "format": self.logging.format,
            },
        })
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("finops.toml"), PathBuf::from("config/finops.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=600".to_string(),
        ));
    }

    let base_url = llm.base_url.trim();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "llm.base_url must start with http:// or https://".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    if llm.max_tokens == 0 {
        return Err(ConfigError::Validation(
            "llm.max_tokens must be greater than zero".to_string(),
        ));
    }

    if llm.retry_base_delay_ms > llm.retry_max_delay_ms {
        return Err(ConfigError::Validation(
            "llm.retry_base_delay_ms must not exceed llm.retry_max_delay_ms".to_string(),
        ));
    }

    Ok(())
}

fn validate_orchestration(
    orchestration: &OrchestrationConfig,
    sandbox: &SandboxConfig,
) -> Result<(), ConfigError> {
    if orchestration.max_iterations == 0 {
        return Err(ConfigError::Validation(
            "orchestration.max_iterations must be greater than zero".to_string(),
        ));
    }

    if orchestration.max_concurrent_tools == 0 {
        return Err(ConfigError::Validation(
            "orchestration.max_concurrent_tools must be greater than zero".to_string(),
        ));
    }

    if orchestration.result_char_limit < 256 {
        return Err(ConfigError::Validation(
            "orchestration.result_char_limit must be at least 256".to_string(),
        ));
    }

    if orchestration.tool_timeout_secs <= sandbox.timeout_secs {
        return Err(ConfigError::Validation(format!(
            "orchestration.tool_timeout_secs ({}) must exceed sandbox.timeout_secs ({}) so the \
             sandbox can report its own timeout",
            orchestration.tool_timeout_secs, sandbox.timeout_secs
        )));
    }

    Ok(())
}

fn validate_sandbox(sandbox: &SandboxConfig) -> Result<(), ConfigError> {
    if sandbox.timeout_secs == 0 || sandbox.timeout_secs > 3600 {
        return Err(ConfigError::Validation(
            "sandbox.timeout_secs must be in range 1..=3600".to_string(),
        ));
    }

    if sandbox.output_limit_bytes == 0 {
        return Err(ConfigError::Validation(
            "sandbox.output_limit_bytes must be greater than zero".to_string(),
        ));
    }

    if sandbox.workspace_root.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "sandbox.workspace_root must not be empty".to_string(),
        ));
    }

    if sandbox.python_bin.trim().is_empty() || sandbox.node_bin.trim().is_empty() {
        return Err(ConfigError::Validation(
            "sandbox.python_bin and sandbox.node_bin must not be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_cloud(cloud: &CloudConfig) -> Result<(), ConfigError> {
    if cloud.region.trim().is_empty() {
        return Err(ConfigError::Validation("cloud.region must not be empty".to_string()));
    }

    if cloud.access_key_id.is_some() != cloud.secret_access_key.is_some() {
        return Err(ConfigError::Validation(
            "cloud.access_key_id and cloud.secret_access_key must be set together".to_string(),
        ));
    }

    if cloud.cur_database.is_some() && cloud.cur_table.is_none() {
        return Err(ConfigError::Validation(
            "cloud.cur_database is set but cloud.cur_table is missing".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    orchestration: Option<OrchestrationPatch>,
    sandbox: Option<SandboxPatch>,
    cloud: Option<CloudPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct OrchestrationPatch {
    max_iterations: Option<u32>,
    tool_timeout_secs: Option<u64>,
    history_exchanges: Option<usize>,
    max_concurrent_tools: Option<usize>,
    result_char_limit: Option<usize>,
    event_preview_chars: Option<usize>,
    session_idle_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SandboxPatch {
    workspace_root: Option<PathBuf>,
    timeout_secs: Option<u64>,
    output_limit_bytes: Option<usize>,
    python_bin: Option<String>,
    node_bin: Option<String>,
    keep_artifacts: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct CloudPatch {
    region: Option<String>,
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    session_token: Option<String>,
    cur_database: Option<String>,
    cur_table: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
