use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use finops_core::domain::context::{ContextDocument, ContextId, NewContextDocument};
use finops_core::domain::kpi::{Kpi, KpiId, KpiPatch, NewKpi};
use finops_core::domain::workflow::{
    NewWorkflow, Workflow, WorkflowId, WorkflowPatch, WorkflowSummary,
};
use finops_core::errors::DomainError;

pub mod context;
pub mod kpi;
pub mod memory;
pub mod workflow;

pub use context::SqlContextRepository;
pub use kpi::SqlKpiRepository;
pub use memory::{InMemoryContextRepository, InMemoryKpiRepository, InMemoryWorkflowRepository};
pub use workflow::SqlWorkflowRepository;

/// Suffixed identifiers tried before a slug collision is reported.
pub const MAX_ID_ATTEMPTS: u32 = 100;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error("identifier `{0}` is already taken")]
    Conflict(String),
}

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Stores a new workflow under a slug of its name, suffixing on collision.
    async fn save(&self, workflow: NewWorkflow) -> Result<Workflow, RepositoryError>;
    async fn list(&self) -> Result<Vec<WorkflowSummary>, RepositoryError>;
    async fn load(&self, id: &WorkflowId) -> Result<Option<Workflow>, RepositoryError>;
    async fn update(
        &self,
        id: &WorkflowId,
        patch: WorkflowPatch,
    ) -> Result<Option<Workflow>, RepositoryError>;
    async fn delete(&self, id: &WorkflowId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait KpiRepository: Send + Sync {
    async fn create(&self, kpi: NewKpi) -> Result<Kpi, RepositoryError>;
    async fn list(&self) -> Result<Vec<Kpi>, RepositoryError>;
    async fn get(&self, id: &KpiId) -> Result<Option<Kpi>, RepositoryError>;
    async fn update(&self, id: &KpiId, patch: KpiPatch) -> Result<Option<Kpi>, RepositoryError>;
    async fn delete(&self, id: &KpiId) -> Result<bool, RepositoryError>;
    async fn record_value(
        &self,
        id: &KpiId,
        value: Value,
        at: DateTime<Utc>,
    ) -> Result<Option<Kpi>, RepositoryError>;
    /// Installs the default dashboard when the store is empty. Returns how many were added.
    async fn seed_defaults(&self) -> Result<usize, RepositoryError>;
}

#[async_trait]
pub trait ContextRepository: Send + Sync {
    async fn add(&self, document: NewContextDocument) -> Result<ContextDocument, RepositoryError>;
    /// Newest first.
    async fn list(&self) -> Result<Vec<ContextDocument>, RepositoryError>;
    async fn get(&self, id: &ContextId) -> Result<Option<ContextDocument>, RepositoryError>;
    async fn delete(&self, id: &ContextId) -> Result<bool, RepositoryError>;

    /// Loads documents in the order requested. Unknown ids are skipped.
    async fn resolve(&self, ids: &[ContextId]) -> Result<Vec<ContextDocument>, RepositoryError> {
        let mut documents = Vec::with_capacity(ids.len());
        for id in ids {
            if documents.iter().any(|document: &ContextDocument| &document.id == id) {
                continue;
            }
            if let Some(document) = self.get(id).await? {
                documents.push(document);
            }
        }
        Ok(documents)
    }
}

pub(crate) fn workflow_candidate_ids(base: &WorkflowId) -> impl Iterator<Item = WorkflowId> + '_ {
    std::iter::once(base.clone()).chain((2..=MAX_ID_ATTEMPTS).map(|attempt| base.with_suffix(attempt)))
}

pub(crate) fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("{field}: {e}")))
}
