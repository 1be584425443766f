use std::collections::BTreeSet;
use std::sync::Arc;

use finops_agent::{
    register_available, CodeSandbox, Collaborators, DispatchMode, SandboxSettings, ToolKind,
    ToolRegistry,
};
use finops_core::config::{AppConfig, LoadOptions};
use finops_db::{InMemoryKpiRepository, InMemoryWorkflowRepository};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ToolRow {
    name: &'static str,
    dispatch: &'static str,
    /// Whether this CLI can bind the tool's collaborators.
    available: bool,
    description: &'static str,
}

pub fn run(json_output: bool) -> String {
    let available = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => bound_kinds(&config),
        Err(error) => return format!("config validation failed: {error}"),
    };

    let rows: Vec<ToolRow> = ToolKind::ALL
        .iter()
        .map(|kind| ToolRow {
            name: kind.name(),
            dispatch: match kind.dispatch_mode() {
                DispatchMode::Sequential => "sequential",
                DispatchMode::Concurrent => "concurrent",
            },
            available: available.contains(kind),
            description: kind.description(),
        })
        .collect();

    if json_output {
        return serde_json::to_string_pretty(&rows)
            .unwrap_or_else(|error| format!("tool catalogue serialization failed: {error}"));
    }

    let mut lines = vec![format!(
        "tool catalogue ({} of {} available in this CLI):",
        available.len(),
        ToolKind::ALL.len()
    )];
    for row in &rows {
        let marker = if row.available { "ok" } else { "--" };
        lines.push(format!("- [{marker}] {} ({}): {}", row.name, row.dispatch, row.description));
    }
    lines.join("\n")
}

/// The CLI ships the sandbox and the storage-backed tools. Cost, metrics
/// and query collaborators are supplied by embedding applications.
fn bound_kinds(config: &AppConfig) -> BTreeSet<ToolKind> {
    let collaborators = Collaborators {
        sandbox: Some(Arc::new(CodeSandbox::new(SandboxSettings::from_config(
            &config.sandbox,
            &config.cloud,
        )))),
        workflows: Some(Arc::new(InMemoryWorkflowRepository::default())),
        kpis: Some(Arc::new(InMemoryKpiRepository::default())),
        ..Collaborators::default()
    };
    let mut registry = ToolRegistry::new();
    match register_available(&mut registry, &collaborators) {
        Ok(kinds) => kinds.into_iter().collect(),
        Err(_) => BTreeSet::new(),
    }
}
