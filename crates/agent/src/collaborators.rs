//! Seams to the external billing, metrics and query services.
//!
//! The engine never talks to a concrete cloud SDK. Each service is reached
//! through one of these traits and the results travel back as JSON values.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("service call failed: {0}")]
    Failed(String),
}

/// SQL text over the billing report table, with `{table}` where the table goes.
///
/// Callers never supply the table name; the query engine substitutes its own
/// quoted identifier through [`TableQuery::render`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableQuery {
    template: String,
}

impl TableQuery {
    pub const PLACEHOLDER: &'static str = "{table}";

    pub fn new(template: impl Into<String>) -> Result<Self, CollaboratorError> {
        let template = template.into();
        if template.trim().is_empty() {
            return Err(CollaboratorError::InvalidRequest("query must not be empty".into()));
        }
        if !template.contains(Self::PLACEHOLDER) {
            return Err(CollaboratorError::InvalidRequest(format!(
                "query must reference the billing table through the `{}` placeholder",
                Self::PLACEHOLDER
            )));
        }
        Ok(Self { template })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn render(&self, qualified_table: &str) -> String {
        self.template.replace(Self::PLACEHOLDER, qualified_table)
    }
}

#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn run(&self, query: &TableQuery) -> Result<Value, CollaboratorError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Granularity {
    Hourly,
    #[default]
    Daily,
    Monthly,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostPeriod {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub granularity: Granularity,
}

impl CostPeriod {
    pub fn validate(&self) -> Result<(), CollaboratorError> {
        if self.start_date >= self.end_date {
            return Err(CollaboratorError::InvalidRequest(format!(
                "start_date {} must be before end_date {}",
                self.start_date, self.end_date
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyWindow {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub max_results: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCostQuery {
    pub tag_key: String,
    #[serde(flatten)]
    pub period: CostPeriod,
}

/// Billing dimensions whose distinct values can be listed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CostDimension {
    Service,
    Region,
    LinkedAccount,
    InstanceType,
    UsageType,
    Operation,
    AvailabilityZone,
    Platform,
    Tenancy,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionQuery {
    pub dimension: CostDimension,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub search_string: Option<String>,
}

#[async_trait]
pub trait BillingApi: Send + Sync {
    async fn cost_by_service(&self, period: &CostPeriod) -> Result<Value, CollaboratorError>;
    async fn cost_forecast(&self, period: &CostPeriod) -> Result<Value, CollaboratorError>;
    async fn cost_anomalies(&self, window: &AnomalyWindow) -> Result<Value, CollaboratorError>;
    async fn cost_by_tag(&self, query: &TagCostQuery) -> Result<Value, CollaboratorError>;
    /// Reserved instance and savings plan coverage over the period.
    async fn commitment_coverage(&self, period: &CostPeriod) -> Result<Value, CollaboratorError>;
    /// Configured budgets with actual and forecast spend. `None` means the
    /// caller's own account.
    async fn budgets(&self, account_id: Option<&str>) -> Result<Value, CollaboratorError>;
    async fn dimension_values(&self, query: &DimensionQuery) -> Result<Value, CollaboratorError>;
    /// Named scalar lookups used by dashboard KPIs, e.g. `get_ri_coverage`.
    async fn named_metric(&self, method: &str) -> Result<Value, CollaboratorError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDimension {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricQuery {
    pub namespace: String,
    pub metric_name: String,
    #[serde(default)]
    pub dimensions: Vec<MetricDimension>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub period_secs: u32,
}

#[async_trait]
pub trait MetricsApi: Send + Sync {
    async fn resource_metrics(&self, query: &MetricQuery) -> Result<Value, CollaboratorError>;
    /// Average and peak utilization per instance over the window.
    async fn instance_utilization(
        &self,
        instance_ids: &[String],
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Value, CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{CostDimension, DimensionQuery, Granularity, TableQuery, TagCostQuery};

    #[test]
    fn tag_query_reads_period_fields_inline() {
        let query: TagCostQuery = serde_json::from_value(json!({
            "tag_key": "team",
            "start_date": "2025-03-01",
            "end_date": "2025-04-01",
            "granularity": "MONTHLY"
        }))
        .expect("tag query");
        assert_eq!(query.tag_key, "team");
        assert_eq!(query.period.granularity, Granularity::Monthly);
        assert!(query.period.validate().is_ok());
    }

    #[test]
    fn dimensions_use_upper_snake_names() {
        let query: DimensionQuery = serde_json::from_value(json!({
            "dimension": "LINKED_ACCOUNT",
            "start_date": "2025-03-01",
            "end_date": "2025-04-01"
        }))
        .expect("dimension query");
        assert_eq!(query.dimension, CostDimension::LinkedAccount);
        assert_eq!(query.search_string, None);
        assert!(serde_json::from_value::<CostDimension>(json!("linked_account")).is_err());
    }

    #[test]
    fn table_query_requires_placeholder() {
        assert!(TableQuery::new("SELECT * FROM cur").is_err());
        assert!(TableQuery::new("  ").is_err());
    }

    #[test]
    fn render_substitutes_every_placeholder() {
        let query =
            TableQuery::new("SELECT a FROM {table} UNION ALL SELECT b FROM {table}").expect("query");
        assert_eq!(
            query.render("\"billing\".\"cur\""),
            "SELECT a FROM \"billing\".\"cur\" UNION ALL SELECT b FROM \"billing\".\"cur\""
        );
    }
}
