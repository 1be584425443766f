//! Arena-scoped interpreter runs.
//!
//! Every run gets a fresh directory under the workspace root, a cleared
//! environment and its own process group. The wall-clock limit and the
//! cancellation token both kill the whole group and reap the child before
//! [`CodeSandbox::run`] returns, so no interpreter outlives its execution record.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use finops_core::config::{CloudConfig, SandboxConfig};
use finops_core::domain::sandbox::{
    CapturedStream, ExecutionId, Language, SandboxExecution, SandboxOutcome,
};

pub const MINIMAL_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
pub const INPUT_FILE_NAME: &str = "input.json";
pub const INPUT_ENV_VAR: &str = "SANDBOX_INPUT";
const READER_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct SandboxSettings {
    pub workspace_root: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub python_bin: String,
    pub node_bin: String,
    pub keep_artifacts: bool,
    /// Variables passed through to the interpreter, typically cloud credentials.
    pub env: Vec<(String, String)>,
}

impl SandboxSettings {
    pub fn from_config(sandbox: &SandboxConfig, cloud: &CloudConfig) -> Self {
        Self {
            workspace_root: sandbox.workspace_root.clone(),
            timeout: Duration::from_secs(sandbox.timeout_secs),
            output_limit_bytes: sandbox.output_limit_bytes,
            python_bin: sandbox.python_bin.clone(),
            node_bin: sandbox.node_bin.clone(),
            keep_artifacts: sandbox.keep_artifacts,
            env: cloud.sandbox_env(),
        }
    }

    pub fn interpreter(&self, language: Language) -> &str {
        match language {
            Language::Python => &self.python_bin,
            Language::Javascript => &self.node_bin,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SandboxRequest {
    pub language: Language,
    pub source: String,
    /// Written to `input.json` in the arena and announced through `SANDBOX_INPUT`.
    pub input: Option<Value>,
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl SandboxRequest {
    pub fn new(language: Language, source: impl Into<String>) -> Self {
        Self {
            language,
            source: source.into(),
            input: None,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

pub struct CodeSandbox {
    settings: SandboxSettings,
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

impl CodeSandbox {
    pub fn new(settings: SandboxSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// Runs the source to completion, timeout or cancellation. Launch failures
    /// are reported as [`SandboxOutcome::Crashed`], never as errors.
    pub async fn run(&self, request: SandboxRequest) -> SandboxExecution {
        let id = ExecutionId::generate();
        let started = Instant::now();
        let arena = self.settings.workspace_root.join(format!("arena-{id}"));
        let script_path =
            arena.join(format!("script-{id}.{}", request.language.file_extension()));

        let mut execution = SandboxExecution {
            id: id.clone(),
            language: request.language,
            script_path: script_path.clone(),
            arena: arena.clone(),
            stdout: CapturedStream::default(),
            stderr: CapturedStream::default(),
            exit_code: None,
            pid: None,
            duration: Duration::ZERO,
            outcome: SandboxOutcome::Crashed,
        };

        let arena = match prepare_arena(&arena, &script_path, &request).await {
            Ok(arena) => arena,
            Err(message) => {
                warn!(event_name = "sandbox.run.setup_failed", execution_id = %id, error = %message, "sandbox setup failed");
                execution.stderr.text = message;
                execution.duration = started.elapsed();
                return execution;
            }
        };
        execution.script_path = arena.join(script_file_name(&script_path));
        execution.arena = arena.clone();

        info!(
            event_name = "sandbox.run.started",
            execution_id = %id,
            language = request.language.as_str(),
            arena = %arena.display(),
            "sandbox run started"
        );

        self.execute(&mut execution, &request).await;
        execution.duration = started.elapsed();

        if !self.settings.keep_artifacts {
            if let Err(error) = tokio::fs::remove_dir_all(&arena).await {
                warn!(event_name = "sandbox.arena.cleanup_failed", execution_id = %id, error = %error, "arena cleanup failed");
            }
        }

        info!(
            event_name = "sandbox.run.finished",
            execution_id = %id,
            outcome = execution.outcome.as_str(),
            exit_code = execution.exit_code,
            duration_ms = execution.duration.as_millis() as u64,
            "sandbox run finished"
        );
        execution
    }

    async fn execute(&self, execution: &mut SandboxExecution, request: &SandboxRequest) {
        let interpreter = self.settings.interpreter(request.language).to_string();
        let mut command = self.command(&interpreter, execution, request.input.is_some());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                execution.stderr.text = format!("failed to launch `{interpreter}`: {error}");
                return;
            }
        };
        execution.pid = child.id();

        let limit = self.settings.output_limit_bytes;
        let stdout_task = child.stdout.take().map(|stream| tokio::spawn(capture(stream, limit)));
        let stderr_task = child.stderr.take().map(|stream| tokio::spawn(capture(stream, limit)));

        let timeout = request.timeout.unwrap_or(self.settings.timeout);
        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(timeout) => Waited::TimedOut,
            _ = request.cancel.cancelled() => Waited::Cancelled,
        };

        match waited {
            Waited::Exited(Ok(status)) => {
                execution.exit_code = status.code();
                execution.outcome = if status.code().is_some() {
                    SandboxOutcome::Completed
                } else {
                    SandboxOutcome::Crashed
                };
                // Background children may still hold the pipes.
                terminate_group(&mut child, execution.pid).await;
            }
            Waited::Exited(Err(error)) => {
                warn!(event_name = "sandbox.run.wait_failed", execution_id = %execution.id, error = %error, "waiting on interpreter failed");
                terminate_group(&mut child, execution.pid).await;
            }
            Waited::TimedOut | Waited::Cancelled => {
                let reason = if matches!(waited, Waited::TimedOut) { "timeout" } else { "cancelled" };
                warn!(
                    event_name = "sandbox.run.timed_out",
                    execution_id = %execution.id,
                    pid = execution.pid,
                    reason,
                    timeout_ms = timeout.as_millis() as u64,
                    "killing sandbox process group"
                );
                terminate_group(&mut child, execution.pid).await;
                execution.outcome = SandboxOutcome::TimedOut;
            }
        }

        execution.stdout = collect(stdout_task).await;
        let mut stderr = collect(stderr_task).await;
        if execution.outcome == SandboxOutcome::TimedOut {
            if !stderr.text.is_empty() && !stderr.text.ends_with('\n') {
                stderr.text.push('\n');
            }
            stderr.text.push_str(&format!(
                "[sandbox] execution stopped after {} ms",
                timeout.as_millis()
            ));
        }
        execution.stderr = stderr;
    }

    fn command(&self, interpreter: &str, execution: &SandboxExecution, has_input: bool) -> Command {
        let arena = &execution.arena;
        let mut command = Command::new(interpreter);
        command
            .arg(&execution.script_path)
            .current_dir(arena)
            .env_clear()
            .envs(self.settings.env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
            .env("PATH", MINIMAL_PATH)
            .env("HOME", arena)
            .env("TMPDIR", arena)
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if has_input {
            command.env(INPUT_ENV_VAR, arena.join(INPUT_FILE_NAME));
        }
        #[cfg(unix)]
        command.process_group(0);
        command
    }
}

fn script_file_name(script_path: &Path) -> PathBuf {
    script_path.file_name().map(PathBuf::from).unwrap_or_default()
}

/// Creates the arena, writes the script and optional input, and returns the
/// arena's absolute path.
async fn prepare_arena(
    arena: &Path,
    script_path: &Path,
    request: &SandboxRequest,
) -> Result<PathBuf, String> {
    tokio::fs::create_dir_all(arena)
        .await
        .map_err(|e| format!("could not create arena `{}`: {e}", arena.display()))?;
    let arena = tokio::fs::canonicalize(arena)
        .await
        .map_err(|e| format!("could not resolve arena `{}`: {e}", arena.display()))?;

    let script = arena.join(script_file_name(script_path));
    tokio::fs::write(&script, request.source.as_bytes())
        .await
        .map_err(|e| format!("could not write script `{}`: {e}", script.display()))?;

    if let Some(input) = &request.input {
        let encoded = serde_json::to_vec_pretty(input)
            .map_err(|e| format!("could not encode sandbox input: {e}"))?;
        tokio::fs::write(arena.join(INPUT_FILE_NAME), encoded)
            .await
            .map_err(|e| format!("could not write sandbox input: {e}"))?;
    }
    Ok(arena)
}

/// Kills the child's process group, then the child itself, and reaps it.
async fn terminate_group(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) {
        // SAFETY: killpg only sends a signal; the group id is the child's pid
        // because the child was spawned with process_group(0).
        unsafe {
            libc::killpg(pid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(error) = child.kill().await {
        // Already reaped children report InvalidInput; anything else is worth a trace.
        if error.kind() != std::io::ErrorKind::InvalidInput {
            warn!(event_name = "sandbox.run.kill_failed", error = %error, "failed to kill interpreter");
        }
    }
}

/// Keeps the first `limit` bytes of a stream and drains the rest so the
/// writer never blocks on a full pipe.
async fn capture<R>(mut stream: R, limit: usize) -> CapturedStream
where
    R: AsyncRead + Unpin,
{
    let mut kept: Vec<u8> = Vec::new();
    let mut total: usize = 0;
    let mut chunk = [0_u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(read) => {
                let room = limit.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..read.min(room)]);
                total = total.saturating_add(read);
            }
        }
    }

    let mut text = String::from_utf8_lossy(&kept).into_owned();
    let truncated = total > kept.len();
    if truncated {
        text.push_str(&format!("\n…[output truncated: {} of {total} bytes kept]", kept.len()));
    }
    CapturedStream { text, truncated }
}

async fn collect(task: Option<tokio::task::JoinHandle<CapturedStream>>) -> CapturedStream {
    let Some(mut task) = task else {
        return CapturedStream::default();
    };
    match tokio::time::timeout(READER_GRACE, &mut task).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(_)) => CapturedStream::default(),
        Err(_) => {
            task.abort();
            CapturedStream { text: "[sandbox] output stream did not close".to_string(), truncated: true }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::capture;

    #[tokio::test]
    async fn capture_truncates_and_marks_overflow() {
        let data: &[u8] = b"0123456789abcdef";
        let captured = capture(data, 10).await;
        assert!(captured.truncated);
        assert!(captured.text.starts_with("0123456789"));
        assert!(captured.text.contains("10 of 16 bytes kept"));
    }

    #[tokio::test]
    async fn capture_keeps_short_output_verbatim() {
        let data: &[u8] = b"4\n";
        let captured = capture(data, 1024).await;
        assert!(!captured.truncated);
        assert_eq!(captured.text, "4\n");
    }
}
