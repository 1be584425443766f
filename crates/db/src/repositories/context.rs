use chrono::Utc;
use sqlx::Row;
use tracing::info;

use finops_core::domain::context::{ContextDocument, ContextId, NewContextDocument};

use super::{parse_timestamp, ContextRepository, RepositoryError};
use crate::DbPool;

pub struct SqlContextRepository {
    pool: DbPool,
}

impl SqlContextRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<ContextDocument, RepositoryError> {
    let decode = |e: sqlx::Error| RepositoryError::Decode(e.to_string());
    let created_at: String = row.try_get("created_at").map_err(decode)?;

    Ok(ContextDocument {
        id: ContextId(row.try_get("id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
        description: row.try_get("description").map_err(decode)?,
        content: row.try_get("content").map_err(decode)?,
        created_at: parse_timestamp("created_at", &created_at)?,
    })
}

const SELECT_COLUMNS: &str =
    "SELECT id, name, description, content, created_at FROM context_document";

#[async_trait::async_trait]
impl ContextRepository for SqlContextRepository {
    async fn add(&self, document: NewContextDocument) -> Result<ContextDocument, RepositoryError> {
        document.validate()?;
        let document = document.into_document(ContextId::generate(), Utc::now());

        let inserted = sqlx::query(
            "INSERT INTO context_document (id, name, description, content, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&document.id.0)
        .bind(&document.name)
        .bind(&document.description)
        .bind(&document.content)
        .bind(document.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if inserted != 1 {
            return Err(RepositoryError::Conflict(document.id.0));
        }

        info!(
            event_name = "db.context.added",
            context_id = %document.id,
            chars = document.content.chars().count(),
            "context document added"
        );
        Ok(document)
    }

    async fn list(&self) -> Result<Vec<ContextDocument>, RepositoryError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY created_at DESC, id ASC"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn get(&self, id: &ContextId) -> Result<Option<ContextDocument>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn delete(&self, id: &ContextId) -> Result<bool, RepositoryError> {
        let deleted = sqlx::query("DELETE FROM context_document WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use finops_core::domain::context::{ContextId, NewContextDocument};

    use super::SqlContextRepository;
    use crate::repositories::ContextRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlContextRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlContextRepository::new(pool)
    }

    fn note(name: &str, content: &str) -> NewContextDocument {
        NewContextDocument {
            name: name.to_string(),
            description: String::new(),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn resolve_keeps_request_order_and_skips_unknown_ids() {
        let repo = setup().await;
        let accounts = repo.add(note("Accounts", "111 = prod")).await.expect("add accounts");
        let budgets = repo.add(note("Budgets", "prod: $40k/month")).await.expect("add budgets");

        let resolved = repo
            .resolve(&[
                budgets.id.clone(),
                ContextId("ctx_missing".to_string()),
                accounts.id.clone(),
                budgets.id.clone(),
            ])
            .await
            .expect("resolve");

        let names: Vec<&str> = resolved.iter().map(|document| document.name.as_str()).collect();
        assert_eq!(names, vec!["Budgets", "Accounts"]);
    }

    #[tokio::test]
    async fn delete_removes_the_document() {
        let repo = setup().await;
        let added = repo.add(note("Tagging policy", "every resource needs Owner")).await.expect("add");

        assert_eq!(repo.list().await.expect("list").len(), 1);
        assert!(repo.delete(&added.id).await.expect("delete"));
        assert!(!repo.delete(&added.id).await.expect("second delete"));
        assert!(repo.get(&added.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn empty_content_is_rejected() {
        let repo = setup().await;
        assert!(repo.add(note("Empty", "  ")).await.is_err());
    }
}
