use std::fs;
use std::path::PathBuf;

use finops_core::config::AppConfig;
use finops_core::domain::context::{ContextId, NewContextDocument};
use finops_db::{connect_with_settings, migrations, ContextRepository, SqlContextRepository};

use crate::commands::{build_runtime, load_config, CommandResult};

#[derive(Debug, Clone)]
pub enum ContextAction {
    Add { name: String, file: PathBuf, description: Option<String> },
    List { json: bool },
    Remove { id: String },
}

/// Manages the reference documents `chat --context` attaches to a session.
pub fn run(action: ContextAction) -> CommandResult {
    let config = match load_config("context") {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match build_runtime("context", false) {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    runtime.block_on(async {
        let store = match open_store(&config).await {
            Ok(store) => store,
            Err(result) => return result,
        };
        match action {
            ContextAction::Add { name, file, description } => add(&store, name, file, description).await,
            ContextAction::List { json } => list(&store, json).await,
            ContextAction::Remove { id } => remove(&store, ContextId(id)).await,
        }
    })
}

async fn open_store(config: &AppConfig) -> Result<SqlContextRepository, CommandResult> {
    let pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(|error| CommandResult::failure("context", "db_connectivity", error.to_string(), 4))?;
    migrations::run_pending(&pool)
        .await
        .map_err(|error| CommandResult::failure("context", "migration", error.to_string(), 5))?;
    Ok(SqlContextRepository::new(pool))
}

async fn add(
    store: &SqlContextRepository,
    name: String,
    file: PathBuf,
    description: Option<String>,
) -> CommandResult {
    let content = match fs::read_to_string(&file) {
        Ok(content) => content,
        Err(error) => {
            return CommandResult::failure(
                "context",
                "invalid_input",
                format!("could not read `{}`: {error}", file.display()),
                2,
            );
        }
    };
    let document = NewContextDocument { name, description: description.unwrap_or_default(), content };
    match store.add(document).await {
        Ok(added) => CommandResult::success(
            "context",
            format!("added context `{}` as {}", added.name, added.id),
        ),
        Err(error) => CommandResult::failure("context", "invalid_input", error.to_string(), 2),
    }
}

async fn list(store: &SqlContextRepository, json_output: bool) -> CommandResult {
    let documents = match store.list().await {
        Ok(documents) => documents,
        Err(error) => return CommandResult::failure("context", "storage", error.to_string(), 4),
    };

    let output = if json_output {
        let rows: Vec<serde_json::Value> = documents
            .iter()
            .map(|document| {
                serde_json::json!({
                    "id": document.id.0,
                    "name": document.name,
                    "description": document.description,
                    "chars": document.content.chars().count(),
                    "created_at": document.created_at.to_rfc3339(),
                })
            })
            .collect();
        serde_json::to_string_pretty(&rows)
            .unwrap_or_else(|error| format!("context serialization failed: {error}"))
    } else if documents.is_empty() {
        "no context documents stored".to_string()
    } else {
        let mut lines = vec![format!("{} context documents:", documents.len())];
        lines.extend(documents.iter().map(|document| {
            format!(
                "- {} {} ({} chars)",
                document.id,
                document.name,
                document.content.chars().count()
            )
        }));
        lines.join("\n")
    };
    CommandResult { exit_code: 0, output }
}

async fn remove(store: &SqlContextRepository, id: ContextId) -> CommandResult {
    match store.delete(&id).await {
        Ok(true) => CommandResult::success("context", format!("removed context {id}")),
        Ok(false) => {
            CommandResult::failure("context", "not_found", format!("no context with id {id}"), 1)
        }
        Err(error) => CommandResult::failure("context", "storage", error.to_string(), 4),
    }
}
