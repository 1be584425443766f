use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::sandbox::Language;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    /// Builds the slug identifier for a workflow name, e.g. `Monthly Cost Report`
    /// becomes `monthly_cost_report`.
    pub fn from_name(name: &str) -> Result<Self, DomainError> {
        let slug = slugify(name);
        if slug.is_empty() {
            return Err(DomainError::InvalidWorkflow(format!(
                "workflow name `{name}` has no usable characters"
            )));
        }
        Ok(Self(slug))
    }

    /// Suffixed identifier used when the base slug is already taken.
    pub fn with_suffix(&self, attempt: u32) -> Self {
        Self(format!("{}_{attempt}", self.0))
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_separator = false;
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push('_');
            }
            pending_separator = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }
    slug
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub description: String,
    pub language: Language,
    pub source: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWorkflow {
    pub name: String,
    pub description: String,
    pub language: Language,
    pub source: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NewWorkflow {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::InvalidWorkflow("workflow name must not be empty".into()));
        }
        if self.source.trim().is_empty() {
            return Err(DomainError::InvalidWorkflow("workflow source must not be empty".into()));
        }
        Ok(())
    }

    pub fn into_workflow(self, id: WorkflowId, now: DateTime<Utc>) -> Workflow {
        Workflow {
            id,
            name: self.name.trim().to_string(),
            description: self.description,
            language: self.language,
            source: self.source,
            tags: self.tags,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub source: Option<String>,
    pub tags: Option<Vec<String>>,
}

impl WorkflowPatch {
    pub fn apply(self, workflow: &mut Workflow, now: DateTime<Utc>) {
        if let Some(name) = self.name {
            workflow.name = name;
        }
        if let Some(description) = self.description {
            workflow.description = description;
        }
        if let Some(source) = self.source {
            workflow.source = source;
        }
        if let Some(tags) = self.tags {
            workflow.tags = tags;
        }
        workflow.updated_at = now;
    }
}

/// Listing view: everything except the source body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: WorkflowId,
    pub name: String,
    pub description: String,
    pub language: Language,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Workflow> for WorkflowSummary {
    fn from(workflow: &Workflow) -> Self {
        Self {
            id: workflow.id.clone(),
            name: workflow.name.clone(),
            description: workflow.description.clone(),
            language: workflow.language,
            tags: workflow.tags.clone(),
            created_at: workflow.created_at,
        }
    }
}
