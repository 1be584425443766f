pub mod commands;
pub mod logging;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "finops",
    about = "FinOps analyst operator CLI",
    long_about = "Chat with the cost analyst, inspect its tool catalogue and configuration, and check runtime readiness.",
    after_help = "Examples:\n  finops chat\n  finops context add --name accounts accounts.md\n  finops chat --context ctx_0a1b\n  finops doctor --json\n  finops sandbox report.py --timeout 10"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Start an interactive session (`/clear`, `/history`, `exit`)")]
    Chat {
        #[arg(long, help = "Reuse a session identifier instead of generating one")]
        session: Option<String>,
        #[arg(long = "context", value_name = "ID", help = "Attach a stored context document to every message (repeatable)")]
        contexts: Vec<String>,
    },
    #[command(subcommand, about = "Manage reference documents that can be attached to chat turns")]
    Context(ContextCommand),
    #[command(about = "List the tool catalogue offered to the model")]
    Tools {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Inspect effective configuration values with source attribution and redaction")]
    Config {
        #[arg(long, help = "Emit the redacted configuration as JSON")]
        json: bool,
    },
    #[command(about = "Validate config, credentials, database connectivity and interpreters")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Apply pending database migrations and seed the default KPIs")]
    Migrate,
    #[command(about = "Run a source file through the code sandbox")]
    Sandbox {
        file: PathBuf,
        #[arg(long, help = "python or javascript; inferred from the file extension when omitted")]
        language: Option<String>,
        #[arg(long, help = "Timeout in seconds, capped at sandbox.timeout_secs")]
        timeout: Option<u64>,
    },
}

#[derive(Debug, Subcommand)]
enum ContextCommand {
    #[command(about = "Store a text file as a context document")]
    Add {
        #[arg(long)]
        name: String,
        file: PathBuf,
        #[arg(long)]
        description: Option<String>,
    },
    #[command(about = "List stored context documents, newest first")]
    List {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Delete a context document")]
    Remove { id: String },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Chat { session, contexts } => commands::chat::run(session, contexts),
        Command::Context(action) => commands::context::run(match action {
            ContextCommand::Add { name, file, description } => {
                commands::context::ContextAction::Add { name, file, description }
            }
            ContextCommand::List { json } => commands::context::ContextAction::List { json },
            ContextCommand::Remove { id } => commands::context::ContextAction::Remove { id },
        }),
        Command::Tools { json } => {
            commands::CommandResult { exit_code: 0, output: commands::tools::run(json) }
        }
        Command::Config { json } => {
            commands::CommandResult { exit_code: 0, output: commands::config::run(json) }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Migrate => commands::migrate::run(),
        Command::Sandbox { file, language, timeout } => {
            commands::sandbox::run(commands::sandbox::SandboxArgs { file, language, timeout })
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
