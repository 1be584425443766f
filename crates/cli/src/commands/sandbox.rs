use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use finops_agent::{CodeSandbox, SandboxRequest, SandboxSettings};
use finops_core::domain::sandbox::{Language, SandboxOutcome};

use crate::commands::{build_runtime, load_config, CommandResult};
use crate::logging;

#[derive(Debug, Clone)]
pub struct SandboxArgs {
    pub file: PathBuf,
    pub language: Option<String>,
    pub timeout: Option<u64>,
}

/// Prints the execution record as JSON. Exit code 0 only for a clean exit;
/// a non-zero script exit is 1, timeouts 6, crashes 7.
pub fn run(args: SandboxArgs) -> CommandResult {
    let config = match load_config("sandbox") {
        Ok(config) => config,
        Err(result) => return result,
    };
    logging::init(&config);

    let language = match resolve_language(&args.file, args.language.as_deref()) {
        Ok(language) => language,
        Err(message) => return CommandResult::failure("sandbox", "invalid_input", message, 2),
    };
    let source = match fs::read_to_string(&args.file) {
        Ok(source) => source,
        Err(error) => {
            return CommandResult::failure(
                "sandbox",
                "invalid_input",
                format!("could not read `{}`: {error}", args.file.display()),
                2,
            );
        }
    };

    let runtime = match build_runtime("sandbox", false) {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };
    let sandbox = CodeSandbox::new(SandboxSettings::from_config(&config.sandbox, &config.cloud));
    let mut request = SandboxRequest::new(language, source);
    if let Some(secs) = args.timeout {
        request = request.with_timeout(Duration::from_secs(secs).min(sandbox.settings().timeout));
    }

    let execution = runtime.block_on(sandbox.run(request));
    let exit_code = match execution.outcome {
        _ if execution.succeeded() => 0,
        SandboxOutcome::Completed => 1,
        SandboxOutcome::TimedOut => 6,
        SandboxOutcome::Crashed => 7,
    };
    let output = serde_json::to_string_pretty(&execution)
        .unwrap_or_else(|error| format!("execution serialization failed: {error}"));

    CommandResult { exit_code, output }
}

fn resolve_language(file: &Path, explicit: Option<&str>) -> Result<Language, String> {
    if let Some(name) = explicit {
        return name.parse::<Language>().map_err(|error| error.to_string());
    }

    match file.extension().and_then(|ext| ext.to_str()) {
        Some("py") => Ok(Language::Python),
        Some("js" | "cjs" | "mjs") => Ok(Language::Javascript),
        other => Err(format!(
            "cannot infer a language from extension `{}`; pass --language",
            other.unwrap_or("")
        )),
    }
}
