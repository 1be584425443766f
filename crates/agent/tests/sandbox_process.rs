use std::collections::VecDeque;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use finops_agent::llm::RetryPolicy;
use finops_agent::{
    register_available, AgentRuntime, CodeSandbox, Collaborators, CompletionClient,
    CompletionError, CompletionRequest, CompletionResponse, ExecutorSettings, HistoryManager,
    RuntimeSettings, SandboxRequest, SandboxSettings, ToolExecutor, ToolRegistry, TurnStatus,
};
use finops_core::domain::conversation::{
    CallId, ConversationSession, SessionId, ToolCall, ToolResult, ToolStatus,
};
use finops_core::domain::sandbox::{Language, SandboxOutcome};

fn python_available() -> bool {
    Command::new("python3")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

macro_rules! require_python {
    () => {
        if !python_available() {
            eprintln!("python3 not found, skipping");
            return;
        }
    };
}

fn settings(root: &TempDir, timeout: Duration) -> SandboxSettings {
    SandboxSettings {
        workspace_root: root.path().join("runs"),
        timeout,
        output_limit_bytes: 64 * 1024,
        python_bin: "python3".to_string(),
        node_bin: "node".to_string(),
        keep_artifacts: false,
        env: vec![("AWS_REGION".to_string(), "ap-south-1".to_string())],
    }
}

fn arenas(root: &TempDir) -> usize {
    std::fs::read_dir(root.path().join("runs")).map(|entries| entries.count()).unwrap_or(0)
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    // SAFETY: signal 0 performs only the existence and permission check.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[tokio::test]
async fn two_plus_two_prints_four() {
    require_python!();
    let root = TempDir::new().expect("tempdir");
    let sandbox = CodeSandbox::new(settings(&root, Duration::from_secs(10)));

    let execution = sandbox.run(SandboxRequest::new(Language::Python, "print(2 + 2)")).await;

    assert_eq!(execution.outcome, SandboxOutcome::Completed);
    assert_eq!(execution.exit_code, Some(0));
    assert_eq!(execution.stdout.text, "4\n");
    assert!(execution.succeeded());
    assert!(execution.script_path.extension().is_some_and(|ext| ext == "py"));
    assert_eq!(arenas(&root), 0, "arena must be removed after the run");
}

#[tokio::test]
async fn infinite_loop_is_killed_with_partial_output() {
    require_python!();
    let root = TempDir::new().expect("tempdir");
    let sandbox = CodeSandbox::new(settings(&root, Duration::from_millis(800)));
    let source = "print('partial', flush=True)\nwhile True:\n    pass\n";

    let started = Instant::now();
    let execution = sandbox.run(SandboxRequest::new(Language::Python, source)).await;

    assert_eq!(execution.outcome, SandboxOutcome::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(8));
    assert!(execution.stdout.text.contains("partial"));
    assert!(execution.stderr.text.contains("stopped after"));
    assert_eq!(execution.exit_code, None);
    let pid = execution.pid.expect("pid recorded");
    #[cfg(unix)]
    assert!(!process_exists(pid), "interpreter {pid} must be reaped");
}

#[tokio::test]
async fn environment_is_cleared_and_scoped_to_the_arena() {
    require_python!();
    let root = TempDir::new().expect("tempdir");
    let sandbox = CodeSandbox::new(settings(&root, Duration::from_secs(10)));
    let source = "import json, os\nprint(json.dumps({'keys': sorted(os.environ), 'home': os.environ.get('HOME'), 'cwd': os.getcwd()}))";

    let execution = sandbox.run(SandboxRequest::new(Language::Python, source)).await;
    let report: Value = serde_json::from_str(execution.stdout.text.trim()).expect("json report");

    let keys: Vec<&str> = report["keys"].as_array().expect("keys").iter().filter_map(Value::as_str).collect();
    assert!(keys.contains(&"AWS_REGION"));
    assert!(keys.contains(&"PATH"));
    assert!(!keys.contains(&"CARGO"), "host environment leaked: {keys:?}");
    assert_eq!(report["home"], report["cwd"]);
    let arena = execution.arena.to_string_lossy().to_string();
    assert_eq!(report["cwd"].as_str(), Some(arena.as_str()));
}

#[tokio::test]
async fn auxiliary_input_is_exposed() {
    require_python!();
    let root = TempDir::new().expect("tempdir");
    let sandbox = CodeSandbox::new(settings(&root, Duration::from_secs(10)));
    let source = "import json, os\nprint(json.load(open(os.environ['SANDBOX_INPUT']))['n'] * 2)";

    let execution = sandbox
        .run(SandboxRequest::new(Language::Python, source).with_input(json!({ "n": 21 })))
        .await;

    assert_eq!(execution.stdout.text.trim(), "42");
}

#[tokio::test]
async fn non_zero_exit_is_a_completed_run() {
    require_python!();
    let root = TempDir::new().expect("tempdir");
    let sandbox = CodeSandbox::new(settings(&root, Duration::from_secs(10)));
    let source = "import sys\nsys.stderr.write('bad input')\nsys.exit(3)";

    let execution = sandbox.run(SandboxRequest::new(Language::Python, source)).await;

    assert_eq!(execution.outcome, SandboxOutcome::Completed);
    assert_eq!(execution.exit_code, Some(3));
    assert!(!execution.succeeded());
    assert_eq!(execution.stderr.text, "bad input");
}

#[tokio::test]
async fn large_output_is_capped() {
    require_python!();
    let root = TempDir::new().expect("tempdir");
    let mut config = settings(&root, Duration::from_secs(10));
    config.output_limit_bytes = 100;
    let sandbox = CodeSandbox::new(config);

    let execution = sandbox.run(SandboxRequest::new(Language::Python, "print('x' * 5000)")).await;

    assert!(execution.stdout.truncated);
    assert!(execution.stdout.text.starts_with(&"x".repeat(100)));
    assert!(execution.stdout.text.contains("output truncated"));
}

#[tokio::test]
async fn cancellation_stops_the_run() {
    require_python!();
    let root = TempDir::new().expect("tempdir");
    let sandbox = CodeSandbox::new(settings(&root, Duration::from_secs(30)));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let execution = sandbox
        .run(SandboxRequest::new(Language::Python, "import time\ntime.sleep(60)").with_cancel(cancel))
        .await;

    assert_eq!(execution.outcome, SandboxOutcome::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn missing_interpreter_reports_a_crash() {
    let root = TempDir::new().expect("tempdir");
    let mut config = settings(&root, Duration::from_secs(5));
    config.python_bin = "finops-no-such-interpreter".to_string();
    let sandbox = CodeSandbox::new(config);

    let execution = sandbox.run(SandboxRequest::new(Language::Python, "print(1)")).await;

    assert_eq!(execution.outcome, SandboxOutcome::Crashed);
    assert!(execution.stderr.text.contains("failed to launch"));
    assert_eq!(execution.pid, None);
}

#[tokio::test]
async fn arenas_are_kept_on_request() {
    require_python!();
    let root = TempDir::new().expect("tempdir");
    let mut config = settings(&root, Duration::from_secs(10));
    config.keep_artifacts = true;
    let sandbox = CodeSandbox::new(config);

    let execution = sandbox.run(SandboxRequest::new(Language::Python, "print('kept')")).await;

    assert!(execution.script_path.exists());
    assert_eq!(arenas(&root), 1);
}

fn executor_with_sandbox(root: &TempDir, timeout: Duration) -> ToolExecutor {
    let collaborators = Collaborators {
        sandbox: Some(Arc::new(CodeSandbox::new(settings(root, timeout)))),
        ..Collaborators::default()
    };
    let mut registry = ToolRegistry::new();
    register_available(&mut registry, &collaborators).expect("register");
    ToolExecutor::new(Arc::new(registry), ExecutorSettings::default())
}

fn execute_code(code: &str) -> ToolCall {
    ToolCall {
        id: CallId::generate(),
        tool_name: "execute_code".to_string(),
        arguments: json!({ "language": "python", "code": code }),
    }
}

#[tokio::test]
async fn execute_code_tool_returns_stdout() {
    require_python!();
    let root = TempDir::new().expect("tempdir");
    let executor = executor_with_sandbox(&root, Duration::from_secs(10));

    let dispatched = executor.dispatch(&execute_code("print(2 + 2)"), &SessionId::generate()).await;

    assert_eq!(dispatched.result.status, ToolStatus::Success);
    let payload: Value = serde_json::from_str(&dispatched.result.payload).expect("json");
    assert_eq!(payload["stdout"], "4\n");
    assert_eq!(payload["outcome"], "completed");
}

#[tokio::test]
async fn execute_code_tool_reports_timeouts_as_errors() {
    require_python!();
    let root = TempDir::new().expect("tempdir");
    let executor = executor_with_sandbox(&root, Duration::from_millis(800));

    let dispatched =
        executor.dispatch(&execute_code("while True:\n    pass"), &SessionId::generate()).await;

    assert_eq!(dispatched.result.status, ToolStatus::Error);
    let payload: Value = serde_json::from_str(&dispatched.result.payload).expect("json");
    assert_eq!(payload["tool"], "execute_code");
    assert_eq!(payload["details"]["outcome"], "timed_out");
}

/// Asks for one code run, then answers with a reply chosen from the result it sees.
struct CodeRunClient {
    call: ToolCall,
    requests: Mutex<Vec<CompletionRequest>>,
    replies: Mutex<VecDeque<fn(&ToolResult) -> String>>,
}

impl CodeRunClient {
    fn new(call: ToolCall, reply: fn(&ToolResult) -> String) -> Arc<Self> {
        Arc::new(Self {
            call,
            requests: Mutex::new(Vec::new()),
            replies: Mutex::new(VecDeque::from([reply])),
        })
    }

    fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl CompletionClient for CodeRunClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        self.requests.lock().expect("requests lock").push(request.clone());
        let Some(result) = request.messages.iter().rev().find_map(|message| message.tool_result())
        else {
            return Ok(CompletionResponse { text: None, tool_calls: vec![self.call.clone()] });
        };
        let reply = self.replies.lock().expect("replies lock").pop_front();
        Ok(CompletionResponse::text(reply.map(|reply| reply(result)).unwrap_or_default()))
    }
}

fn code_runtime(root: &TempDir, timeout: Duration, client: Arc<CodeRunClient>) -> AgentRuntime {
    let settings = RuntimeSettings {
        max_iterations: 5,
        max_tokens: 1024,
        event_preview_chars: 200,
        retry: RetryPolicy { max_retries: 0, base_delay_ms: 1, max_delay_ms: 1 },
    };
    AgentRuntime::new(
        client,
        Arc::new(executor_with_sandbox(root, timeout)),
        HistoryManager::new(10),
        settings,
    )
}

fn stdout_reply(result: &ToolResult) -> String {
    let payload: Value = serde_json::from_str(&result.payload).unwrap_or_default();
    payload["stdout"].as_str().unwrap_or_default().trim().to_string()
}

fn failure_reply(result: &ToolResult) -> String {
    let payload: Value = serde_json::from_str(&result.payload).unwrap_or_default();
    format!("The script did not finish: {}.", payload["details"]["outcome"].as_str().unwrap_or("?"))
}

#[tokio::test]
async fn turn_answers_with_the_computed_sum() {
    require_python!();
    let root = TempDir::new().expect("tempdir");
    let client = CodeRunClient::new(execute_code("print(2 + 2)"), stdout_reply);
    let runtime = code_runtime(&root, Duration::from_secs(10), client.clone());
    let mut session = ConversationSession::new(SessionId::generate());

    let outcome = runtime.run_turn(&mut session, "what is 2+2? compute it").await;

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.reply, "4");

    let requests = client.requests();
    assert_eq!(requests.len(), 2);
    let result = requests[1].messages.last().and_then(|m| m.tool_result()).expect("tool result last");
    assert_eq!(result.status, ToolStatus::Success);
    assert_eq!(result.call_id, client.call.id);
    assert_eq!(arenas(&root), 0);
}

#[tokio::test]
async fn turn_survives_a_runaway_script() {
    require_python!();
    let root = TempDir::new().expect("tempdir");
    let client = CodeRunClient::new(execute_code("while True:\n    pass"), failure_reply);
    let runtime = code_runtime(&root, Duration::from_millis(800), client.clone());
    let mut session = ConversationSession::new(SessionId::generate());

    let started = Instant::now();
    let outcome = runtime.run_turn(&mut session, "spin forever").await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.error, None, "a failed tool must not fail the turn");
    assert_eq!(outcome.reply, "The script did not finish: timed_out.");

    let requests = client.requests();
    assert_eq!(requests.len(), 2);
    let result = requests[1].messages.last().and_then(|m| m.tool_result()).expect("tool result last");
    assert_eq!(result.status, ToolStatus::Error);
    let payload: Value = serde_json::from_str(&result.payload).expect("json");
    assert_eq!(payload["details"]["outcome"], "timed_out");
}

