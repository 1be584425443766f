use chrono::Utc;
use sqlx::Row;
use tracing::info;

use finops_core::domain::sandbox::Language;
use finops_core::domain::workflow::{
    NewWorkflow, Workflow, WorkflowId, WorkflowPatch, WorkflowSummary,
};

use super::{parse_timestamp, workflow_candidate_ids, RepositoryError, WorkflowRepository};
use crate::DbPool;

pub struct SqlWorkflowRepository {
    pool: DbPool,
}

impl SqlWorkflowRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn decode<T>(result: Result<T, sqlx::Error>) -> Result<T, RepositoryError> {
    result.map_err(|e| RepositoryError::Decode(e.to_string()))
}

fn row_to_workflow(row: &sqlx::sqlite::SqliteRow) -> Result<Workflow, RepositoryError> {
    let id: String = decode(row.try_get("id"))?;
    let name: String = decode(row.try_get("name"))?;
    let description: String = decode(row.try_get("description"))?;
    let language_str: String = decode(row.try_get("language"))?;
    let source: String = decode(row.try_get("source"))?;
    let tags_json: String = decode(row.try_get("tags_json"))?;
    let created_at_str: String = decode(row.try_get("created_at"))?;
    let updated_at_str: String = decode(row.try_get("updated_at"))?;

    let language: Language =
        language_str.parse().map_err(|e: finops_core::DomainError| RepositoryError::Decode(e.to_string()))?;
    let tags: Vec<String> = serde_json::from_str(&tags_json)
        .map_err(|e| RepositoryError::Decode(format!("tags_json: {e}")))?;

    Ok(Workflow {
        id: WorkflowId(id),
        name,
        description,
        language,
        source,
        tags,
        created_at: parse_timestamp("created_at", &created_at_str)?,
        updated_at: parse_timestamp("updated_at", &updated_at_str)?,
    })
}

fn tags_to_json(tags: &[String]) -> Result<String, RepositoryError> {
    serde_json::to_string(tags).map_err(|e| RepositoryError::Decode(e.to_string()))
}

const SELECT_COLUMNS: &str =
    "SELECT id, name, description, language, source, tags_json, created_at, updated_at FROM workflow";

#[async_trait::async_trait]
impl WorkflowRepository for SqlWorkflowRepository {
    async fn save(&self, workflow: NewWorkflow) -> Result<Workflow, RepositoryError> {
        workflow.validate()?;
        let base = WorkflowId::from_name(&workflow.name)?;
        let tags_json = tags_to_json(&workflow.tags)?;
        let now = Utc::now();

        for candidate in workflow_candidate_ids(&base) {
            let inserted = sqlx::query(
                "INSERT INTO workflow (id, name, description, language, source, tags_json,
                                       created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO NOTHING",
            )
            .bind(&candidate.0)
            .bind(workflow.name.trim())
            .bind(&workflow.description)
            .bind(workflow.language.as_str())
            .bind(&workflow.source)
            .bind(&tags_json)
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?
            .rows_affected();

            if inserted == 1 {
                info!(
                    event_name = "db.workflow.saved",
                    workflow_id = %candidate,
                    language = workflow.language.as_str(),
                    "workflow saved"
                );
                return Ok(workflow.into_workflow(candidate, now));
            }
        }

        Err(RepositoryError::Conflict(base.0))
    }

    async fn list(&self) -> Result<Vec<WorkflowSummary>, RepositoryError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY created_at ASC, id ASC"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| row_to_workflow(row).map(|workflow| WorkflowSummary::from(&workflow)))
            .collect()
    }

    async fn load(&self, id: &WorkflowId) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_workflow).transpose()
    }

    async fn update(
        &self,
        id: &WorkflowId,
        patch: WorkflowPatch,
    ) -> Result<Option<Workflow>, RepositoryError> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(mut workflow) = row.as_ref().map(row_to_workflow).transpose()? else {
            return Ok(None);
        };
        patch.apply(&mut workflow, Utc::now());

        let updated = sqlx::query(
            "UPDATE workflow
             SET name = ?, description = ?, source = ?, tags_json = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(&workflow.source)
        .bind(tags_to_json(&workflow.tags)?)
        .bind(workflow.updated_at.to_rfc3339())
        .bind(&workflow.id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated != 1 {
            return Ok(None);
        }
        tx.commit().await?;

        Ok(Some(workflow))
    }

    async fn delete(&self, id: &WorkflowId) -> Result<bool, RepositoryError> {
        let deleted = sqlx::query("DELETE FROM workflow WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use finops_core::domain::sandbox::Language;
    use finops_core::domain::workflow::{NewWorkflow, WorkflowId, WorkflowPatch};

    use super::SqlWorkflowRepository;
    use crate::repositories::WorkflowRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlWorkflowRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlWorkflowRepository::new(pool)
    }

    fn monthly_report() -> NewWorkflow {
        NewWorkflow {
            name: "Monthly Cost Report".to_string(),
            description: "Summarize spend by service".to_string(),
            language: Language::Python,
            source: "print('report')".to_string(),
            tags: vec!["reporting".to_string()],
        }
    }

    #[tokio::test]
    async fn save_assigns_slug_and_suffixes_collisions() {
        let repo = setup().await;

        let first = repo.save(monthly_report()).await.expect("save first");
        let second = repo.save(monthly_report()).await.expect("save second");

        assert_eq!(first.id, WorkflowId("monthly_cost_report".to_string()));
        assert_eq!(second.id, WorkflowId("monthly_cost_report_2".to_string()));

        let listed = repo.list().await.expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].tags, vec!["reporting".to_string()]);
    }

    #[tokio::test]
    async fn load_update_delete_lifecycle() {
        let repo = setup().await;
        let saved = repo.save(monthly_report()).await.expect("save");

        let loaded = repo.load(&saved.id).await.expect("load").expect("present");
        assert_eq!(loaded.source, "print('report')");

        let patch = WorkflowPatch { source: Some("print('v2')".to_string()), ..Default::default() };
        let updated = repo.update(&saved.id, patch).await.expect("update").expect("present");
        assert_eq!(updated.source, "print('v2')");

        assert!(repo.delete(&saved.id).await.expect("delete"));
        assert!(!repo.delete(&saved.id).await.expect("second delete"));
        assert!(repo.load(&saved.id).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn empty_source_is_rejected() {
        let repo = setup().await;
        let mut workflow = monthly_report();
        workflow.source = "   ".to_string();
        assert!(repo.save(workflow).await.is_err());
    }
}
