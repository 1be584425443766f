use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, SqliteConnection};
use tracing::{info, warn};

use finops_core::domain::kpi::{default_kpis, Kpi, KpiId, KpiPatch, NewKpi};

use super::{parse_timestamp, KpiRepository, RepositoryError};
use crate::DbPool;

pub struct SqlKpiRepository {
    pool: DbPool,
}

impl SqlKpiRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, kpi: &Kpi) -> Result<bool, RepositoryError> {
        let last_value_json = kpi
            .last_value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Decode(e.to_string()))?;

        let inserted = sqlx::query(
            "INSERT INTO kpi (id, name, description, query_type, query, format, icon, color, size,
                              refresh_interval_secs, last_value_json, last_updated, trend,
                              position, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                     (SELECT IFNULL(MAX(position), -1) + 1 FROM kpi), ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&kpi.id.0)
        .bind(&kpi.name)
        .bind(&kpi.description)
        .bind(kpi.query_type.as_str())
        .bind(&kpi.query)
        .bind(kpi.format.as_str())
        .bind(&kpi.icon)
        .bind(&kpi.color)
        .bind(kpi.size.as_str())
        .bind(refresh_interval_to_db(kpi.refresh_interval_secs))
        .bind(last_value_json)
        .bind(kpi.last_updated.map(|at| at.to_rfc3339()))
        .bind(kpi.trend.map(|trend| trend.as_str()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    /// Read-modify-write under `BEGIN IMMEDIATE`; concurrent writers to one KPI serialize.
    async fn modify<F>(&self, id: &KpiId, change: F) -> Result<Option<Kpi>, RepositoryError>
    where
        F: FnOnce(&mut Kpi) -> Result<(), RepositoryError> + Send,
    {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(mut kpi) = row.as_ref().map(row_to_kpi).transpose()? else {
            return Ok(None);
        };
        change(&mut kpi)?;

        if !write_back(&mut *tx, &kpi).await? {
            warn!(event_name = "db.kpi.vanished", kpi_id = %kpi.id, "kpi row disappeared mid-update");
            return Ok(None);
        }
        tx.commit().await?;
        Ok(Some(kpi))
    }
}

/// Full-row update. `false` when no row matched the id.
async fn write_back(conn: &mut SqliteConnection, kpi: &Kpi) -> Result<bool, RepositoryError> {
    let last_value_json = kpi
        .last_value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let updated = sqlx::query(
        "UPDATE kpi
         SET name = ?, description = ?, query_type = ?, query = ?, format = ?, icon = ?,
             color = ?, size = ?, refresh_interval_secs = ?, last_value_json = ?,
             last_updated = ?, trend = ?
         WHERE id = ?",
    )
    .bind(&kpi.name)
    .bind(&kpi.description)
    .bind(kpi.query_type.as_str())
    .bind(&kpi.query)
    .bind(kpi.format.as_str())
    .bind(&kpi.icon)
    .bind(&kpi.color)
    .bind(kpi.size.as_str())
    .bind(refresh_interval_to_db(kpi.refresh_interval_secs))
    .bind(last_value_json)
    .bind(kpi.last_updated.map(|at| at.to_rfc3339()))
    .bind(kpi.trend.map(|trend| trend.as_str()))
    .bind(&kpi.id.0)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    Ok(updated == 1)
}

fn refresh_interval_to_db(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

fn decode<T>(result: Result<T, sqlx::Error>) -> Result<T, RepositoryError> {
    result.map_err(|e| RepositoryError::Decode(e.to_string()))
}

fn parse_field<T>(field: &str, raw: &str) -> Result<T, RepositoryError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| RepositoryError::Decode(format!("{field}: {e}")))
}

fn row_to_kpi(row: &sqlx::sqlite::SqliteRow) -> Result<Kpi, RepositoryError> {
    let id: String = decode(row.try_get("id"))?;
    let query_type: String = decode(row.try_get("query_type"))?;
    let format: String = decode(row.try_get("format"))?;
    let size: String = decode(row.try_get("size"))?;
    let refresh_interval_secs: i64 = decode(row.try_get("refresh_interval_secs"))?;
    let last_value_json: Option<String> = decode(row.try_get("last_value_json"))?;
    let last_updated: Option<String> = decode(row.try_get("last_updated"))?;
    let trend: Option<String> = decode(row.try_get("trend"))?;

    let last_value = last_value_json
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()
        .map_err(|e| RepositoryError::Decode(format!("last_value_json: {e}")))?;

    Ok(Kpi {
        id: KpiId(id),
        name: decode(row.try_get("name"))?,
        description: decode(row.try_get("description"))?,
        query_type: parse_field("query_type", &query_type)?,
        query: decode(row.try_get("query"))?,
        format: parse_field("format", &format)?,
        icon: decode(row.try_get("icon"))?,
        color: decode(row.try_get("color"))?,
        size: parse_field("size", &size)?,
        refresh_interval_secs: u64::try_from(refresh_interval_secs).unwrap_or_default(),
        last_value,
        last_updated: last_updated
            .map(|raw| parse_timestamp("last_updated", &raw))
            .transpose()?,
        trend: trend.map(|raw| parse_field("trend", &raw)).transpose()?,
    })
}

const SELECT_COLUMNS: &str = "SELECT id, name, description, query_type, query, format, icon,
        color, size, refresh_interval_secs, last_value_json, last_updated, trend
     FROM kpi";

#[async_trait::async_trait]
impl KpiRepository for SqlKpiRepository {
    async fn create(&self, kpi: NewKpi) -> Result<Kpi, RepositoryError> {
        kpi.validate()?;
        let kpi = kpi.into_kpi();
        if !self.insert(&kpi).await? {
            return Err(RepositoryError::Conflict(kpi.id.0));
        }
        info!(event_name = "db.kpi.created", kpi_id = %kpi.id, "kpi created");
        Ok(kpi)
    }

    async fn list(&self) -> Result<Vec<Kpi>, RepositoryError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY position ASC, id ASC"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_kpi).collect()
    }

    async fn get(&self, id: &KpiId) -> Result<Option<Kpi>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_kpi).transpose()
    }

    async fn update(&self, id: &KpiId, patch: KpiPatch) -> Result<Option<Kpi>, RepositoryError> {
        self.modify(id, |kpi| patch.apply(kpi).map_err(RepositoryError::from)).await
    }

    async fn delete(&self, id: &KpiId) -> Result<bool, RepositoryError> {
        let deleted = sqlx::query("DELETE FROM kpi WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn record_value(
        &self,
        id: &KpiId,
        value: Value,
        at: DateTime<Utc>,
    ) -> Result<Option<Kpi>, RepositoryError> {
        self.modify(id, move |kpi| {
            kpi.record_value(value, at);
            Ok(())
        })
        .await
    }

    async fn seed_defaults(&self) -> Result<usize, RepositoryError> {
        let existing: i64 = sqlx::query("SELECT COUNT(*) AS count FROM kpi")
            .fetch_one(&self.pool)
            .await?
            .get("count");
        if existing > 0 {
            return Ok(0);
        }

        let mut seeded = 0;
        for kpi in default_kpis() {
            if self.insert(&kpi).await? {
                seeded += 1;
            }
        }
        info!(event_name = "db.kpi.seeded", count = seeded, "default kpis installed");
        Ok(seeded)
    }
}
