use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use finops_core::domain::context::{ContextDocument, ContextId, NewContextDocument};
use finops_core::domain::kpi::{default_kpis, Kpi, KpiId, KpiPatch, NewKpi};
use finops_core::domain::workflow::{
    NewWorkflow, Workflow, WorkflowId, WorkflowPatch, WorkflowSummary,
};

use super::{
    workflow_candidate_ids, ContextRepository, KpiRepository, RepositoryError, WorkflowRepository,
};

#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    workflows: RwLock<HashMap<String, Workflow>>,
}

#[async_trait::async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save(&self, workflow: NewWorkflow) -> Result<Workflow, RepositoryError> {
        workflow.validate()?;
        let base = WorkflowId::from_name(&workflow.name)?;

        let mut workflows = self.workflows.write().await;
        let Some(id) = workflow_candidate_ids(&base).find(|id| !workflows.contains_key(&id.0))
        else {
            return Err(RepositoryError::Conflict(base.0));
        };
        let saved = workflow.into_workflow(id, Utc::now());
        workflows.insert(saved.id.0.clone(), saved.clone());
        Ok(saved)
    }

    async fn list(&self) -> Result<Vec<WorkflowSummary>, RepositoryError> {
        let workflows = self.workflows.read().await;
        let mut summaries: Vec<WorkflowSummary> =
            workflows.values().map(WorkflowSummary::from).collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.0.cmp(&b.id.0)));
        Ok(summaries)
    }

    async fn load(&self, id: &WorkflowId) -> Result<Option<Workflow>, RepositoryError> {
        let workflows = self.workflows.read().await;
        Ok(workflows.get(&id.0).cloned())
    }

    async fn update(
        &self,
        id: &WorkflowId,
        patch: WorkflowPatch,
    ) -> Result<Option<Workflow>, RepositoryError> {
        let mut workflows = self.workflows.write().await;
        let Some(workflow) = workflows.get_mut(&id.0) else {
            return Ok(None);
        };
        patch.apply(workflow, Utc::now());
        Ok(Some(workflow.clone()))
    }

    async fn delete(&self, id: &WorkflowId) -> Result<bool, RepositoryError> {
        let mut workflows = self.workflows.write().await;
        Ok(workflows.remove(&id.0).is_some())
    }
}

/// KPIs kept in insertion order, matching dashboard position.
#[derive(Default)]
pub struct InMemoryKpiRepository {
    kpis: RwLock<Vec<Kpi>>,
}

#[async_trait::async_trait]
impl KpiRepository for InMemoryKpiRepository {
    async fn create(&self, kpi: NewKpi) -> Result<Kpi, RepositoryError> {
        kpi.validate()?;
        let kpi = kpi.into_kpi();

        let mut kpis = self.kpis.write().await;
        if kpis.iter().any(|existing| existing.id == kpi.id) {
            return Err(RepositoryError::Conflict(kpi.id.0));
        }
        kpis.push(kpi.clone());
        Ok(kpi)
    }

    async fn list(&self) -> Result<Vec<Kpi>, RepositoryError> {
        Ok(self.kpis.read().await.clone())
    }

    async fn get(&self, id: &KpiId) -> Result<Option<Kpi>, RepositoryError> {
        let kpis = self.kpis.read().await;
        Ok(kpis.iter().find(|kpi| &kpi.id == id).cloned())
    }

    async fn update(&self, id: &KpiId, patch: KpiPatch) -> Result<Option<Kpi>, RepositoryError> {
        let mut kpis = self.kpis.write().await;
        let Some(kpi) = kpis.iter_mut().find(|kpi| &kpi.id == id) else {
            return Ok(None);
        };
        patch.apply(kpi)?;
        Ok(Some(kpi.clone()))
    }

    async fn delete(&self, id: &KpiId) -> Result<bool, RepositoryError> {
        let mut kpis = self.kpis.write().await;
        let before = kpis.len();
        kpis.retain(|kpi| &kpi.id != id);
        Ok(kpis.len() != before)
    }

    async fn record_value(
        &self,
        id: &KpiId,
        value: Value,
        at: DateTime<Utc>,
    ) -> Result<Option<Kpi>, RepositoryError> {
        let mut kpis = self.kpis.write().await;
        let Some(kpi) = kpis.iter_mut().find(|kpi| &kpi.id == id) else {
            return Ok(None);
        };
        kpi.record_value(value, at);
        Ok(Some(kpi.clone()))
    }

    async fn seed_defaults(&self) -> Result<usize, RepositoryError> {
        let mut kpis = self.kpis.write().await;
        if !kpis.is_empty() {
            return Ok(0);
        }
        kpis.extend(default_kpis());
        Ok(kpis.len())
    }
}

#[derive(Default)]
pub struct InMemoryContextRepository {
    documents: RwLock<Vec<ContextDocument>>,
}

#[async_trait::async_trait]
impl ContextRepository for InMemoryContextRepository {
    async fn add(&self, document: NewContextDocument) -> Result<ContextDocument, RepositoryError> {
        document.validate()?;
        let document = document.into_document(ContextId::generate(), Utc::now());
        self.documents.write().await.push(document.clone());
        Ok(document)
    }

    async fn list(&self) -> Result<Vec<ContextDocument>, RepositoryError> {
        let mut documents = self.documents.read().await.clone();
        documents.reverse();
        Ok(documents)
    }

    async fn get(&self, id: &ContextId) -> Result<Option<ContextDocument>, RepositoryError> {
        let documents = self.documents.read().await;
        Ok(documents.iter().find(|document| &document.id == id).cloned())
    }

    async fn delete(&self, id: &ContextId) -> Result<bool, RepositoryError> {
        let mut documents = self.documents.write().await;
        let before = documents.len();
        documents.retain(|document| &document.id != id);
        Ok(documents.len() != before)
    }
}
