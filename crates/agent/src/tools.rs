//! The closed tool catalogue and the registry binding each tool to a handler.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use finops_core::domain::conversation::{CallId, SessionId, ToolStatus};
use finops_core::errors::DomainError;
use finops_db::repositories::RepositoryError;

use crate::collaborators::CollaboratorError;
use crate::llm::ToolSpec;

/// How a tool may be scheduled relative to its neighbours in one response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchMode {
    Sequential,
    /// Side-effect-free and idempotent; may overlap with other concurrent tools.
    Concurrent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolKind {
    QueryCostData,
    GetCostByService,
    GetCostForecast,
    GetCostAnomalies,
    GetCostByTag,
    GetRiSpCoverage,
    GetBudgetsStatus,
    GetDimensionValues,
    GetResourceMetrics,
    CorrelateCostUtilization,
    GetUntaggedResources,
    ExecuteCode,
    SaveWorkflow,
    ListWorkflows,
    LoadWorkflow,
    CreateKpi,
    ListKpis,
    UpdateKpi,
    DeleteKpi,
    RefreshKpi,
}

impl ToolKind {
    pub const ALL: [ToolKind; 20] = [
        Self::QueryCostData,
        Self::GetCostByService,
        Self::GetCostForecast,
        Self::GetCostAnomalies,
        Self::GetCostByTag,
        Self::GetRiSpCoverage,
        Self::GetBudgetsStatus,
        Self::GetDimensionValues,
        Self::GetResourceMetrics,
        Self::CorrelateCostUtilization,
        Self::GetUntaggedResources,
        Self::ExecuteCode,
        Self::SaveWorkflow,
        Self::ListWorkflows,
        Self::LoadWorkflow,
        Self::CreateKpi,
        Self::ListKpis,
        Self::UpdateKpi,
        Self::DeleteKpi,
        Self::RefreshKpi,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::QueryCostData => "query_cost_data",
            Self::GetCostByService => "get_cost_by_service",
            Self::GetCostForecast => "get_cost_forecast",
            Self::GetCostAnomalies => "get_cost_anomalies",
            Self::GetCostByTag => "get_cost_by_tag",
            Self::GetRiSpCoverage => "get_ri_sp_coverage",
            Self::GetBudgetsStatus => "get_budgets_status",
            Self::GetDimensionValues => "get_dimension_values",
            Self::GetResourceMetrics => "get_resource_metrics",
            Self::CorrelateCostUtilization => "correlate_cost_utilization",
            Self::GetUntaggedResources => "get_untagged_resources",
            Self::ExecuteCode => "execute_code",
            Self::SaveWorkflow => "save_workflow",
            Self::ListWorkflows => "list_workflows",
            Self::LoadWorkflow => "load_workflow",
            Self::CreateKpi => "create_kpi",
            Self::ListKpis => "list_kpis",
            Self::UpdateKpi => "update_kpi",
            Self::DeleteKpi => "delete_kpi",
            Self::RefreshKpi => "refresh_kpi",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        match self {
            Self::QueryCostData
            | Self::GetCostByService
            | Self::GetCostForecast
            | Self::GetCostAnomalies
            | Self::GetCostByTag
            | Self::GetRiSpCoverage
            | Self::GetBudgetsStatus
            | Self::GetDimensionValues
            | Self::GetResourceMetrics
            | Self::CorrelateCostUtilization
            | Self::GetUntaggedResources
            | Self::ListWorkflows
            | Self::LoadWorkflow
            | Self::ListKpis => DispatchMode::Concurrent,
            Self::ExecuteCode
            | Self::SaveWorkflow
            | Self::CreateKpi
            | Self::UpdateKpi
            | Self::DeleteKpi
            | Self::RefreshKpi => DispatchMode::Sequential,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::QueryCostData => {
                "Run a SQL query against the Cost and Usage Report table. Write `{table}` \
                 wherever the table name belongs; it is substituted with the real table."
            }
            Self::GetCostByService => {
                "Cost grouped by service for a date range (end date exclusive)."
            }
            Self::GetCostForecast => "Forecast spend for a future date range.",
            Self::GetCostAnomalies => "List detected cost anomalies within a date range.",
            Self::GetCostByTag => "Cost grouped by the values of one cost allocation tag.",
            Self::GetRiSpCoverage => {
                "Reserved Instance and Savings Plans coverage for a date range."
            }
            Self::GetBudgetsStatus => {
                "List configured budgets with their limits, actual spend and forecast. \
                 Omit account_id for the current account."
            }
            Self::GetDimensionValues => {
                "List the distinct values of a billing dimension (services, regions, \
                 linked accounts, instance types...) seen in a date range."
            }
            Self::GetResourceMetrics => {
                "Fetch a monitoring metric time series, e.g. CPUUtilization for an instance."
            }
            Self::CorrelateCostUtilization => {
                "Correlate EC2 instance cost from the usage report with CPU utilization \
                 and return rightsizing recommendations with potential savings."
            }
            Self::GetUntaggedResources => {
                "Find billed resources missing any of the required tag keys, costliest \
                 first. Without required_tags every billed resource is listed."
            }
            Self::ExecuteCode => {
                "Execute a Python or JavaScript program in an isolated workspace. Cloud \
                 credentials and region are available in the environment. Print results \
                 to stdout."
            }
            Self::SaveWorkflow => "Save a reusable analysis program as a named workflow.",
            Self::ListWorkflows => "List saved workflows.",
            Self::LoadWorkflow => "Load a saved workflow, including its source.",
            Self::CreateKpi => "Add a KPI card to the dashboard.",
            Self::ListKpis => "List dashboard KPIs with their last values.",
            Self::UpdateKpi => "Change fields of an existing KPI.",
            Self::DeleteKpi => "Remove a KPI from the dashboard.",
            Self::RefreshKpi => "Recompute a KPI's value now and record its trend.",
        }
    }

    pub fn input_schema(&self) -> Value {
        let date = json!({ "type": "string", "format": "date", "description": "YYYY-MM-DD" });
        let granularity = json!({ "type": "string", "enum": ["HOURLY", "DAILY", "MONTHLY"] });
        let language = json!({ "type": "string", "enum": ["python", "javascript"] });
        let kpi_query_type = json!({ "type": "string", "enum": ["cur", "cost_explorer"] });
        let kpi_format =
            json!({ "type": "string", "enum": ["currency", "number", "percentage", "text"] });
        let kpi_size = json!({ "type": "string", "enum": ["small", "medium", "large"] });
        let tag_key = json!({ "type": "string", "pattern": "^[A-Za-z0-9_.:/=+@ -]+$" });
        match self {
            Self::QueryCostData => json!({
                "type": "object",
                "properties": { "query": { "type": "string", "minLength": 1 } },
                "required": ["query"],
                "additionalProperties": false
            }),
            Self::GetCostByService | Self::GetCostForecast | Self::GetRiSpCoverage => json!({
                "type": "object",
                "properties": {
                    "start_date": date,
                    "end_date": date,
                    "granularity": granularity
                },
                "required": ["start_date", "end_date"],
                "additionalProperties": false
            }),
            Self::GetCostAnomalies => json!({
                "type": "object",
                "properties": {
                    "start_date": date,
                    "end_date": date,
                    "max_results": { "type": "integer", "minimum": 1 }
                },
                "required": ["start_date", "end_date"],
                "additionalProperties": false
            }),
            Self::GetCostByTag => json!({
                "type": "object",
                "properties": {
                    "tag_key": { "type": "string", "minLength": 1 },
                    "start_date": date,
                    "end_date": date,
                    "granularity": granularity
                },
                "required": ["tag_key", "start_date", "end_date"],
                "additionalProperties": false
            }),
            Self::GetBudgetsStatus => json!({
                "type": "object",
                "properties": {
                    "account_id": { "type": "string", "pattern": "^[0-9]{12}$" }
                },
                "additionalProperties": false
            }),
            Self::GetDimensionValues => json!({
                "type": "object",
                "properties": {
                    "dimension": {
                        "type": "string",
                        "enum": [
                            "SERVICE", "REGION", "LINKED_ACCOUNT", "INSTANCE_TYPE", "USAGE_TYPE",
                            "OPERATION", "AVAILABILITY_ZONE", "PLATFORM", "TENANCY"
                        ]
                    },
                    "start_date": date,
                    "end_date": date,
                    "search_string": { "type": "string" }
                },
                "required": ["dimension", "start_date", "end_date"],
                "additionalProperties": false
            }),
            Self::GetResourceMetrics => json!({
                "type": "object",
                "properties": {
                    "namespace": { "type": "string", "minLength": 1 },
                    "metric_name": { "type": "string", "minLength": 1 },
                    "dimensions": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": { "type": "string" },
                                "value": { "type": "string" }
                            },
                            "required": ["name", "value"]
                        }
                    },
                    "start_time": { "type": "string", "format": "date-time" },
                    "end_time": { "type": "string", "format": "date-time" },
                    "period_secs": { "type": "integer", "minimum": 60 }
                },
                "required": ["namespace", "metric_name", "start_time", "end_time"],
                "additionalProperties": false
            }),
            Self::CorrelateCostUtilization => json!({
                "type": "object",
                "properties": {
                    "instance_ids": {
                        "type": "array",
                        "items": { "type": "string", "pattern": "^i-[0-9a-zA-Z]+$" },
                        "minItems": 1,
                        "maxItems": 100
                    },
                    "start_date": date,
                    "end_date": date
                },
                "required": ["instance_ids", "start_date", "end_date"],
                "additionalProperties": false
            }),
            Self::GetUntaggedResources => json!({
                "type": "object",
                "properties": {
                    "required_tags": { "type": "array", "items": tag_key, "maxItems": 20 },
                    "start_date": date,
                    "end_date": date
                },
                "required": ["start_date", "end_date"],
                "additionalProperties": false
            }),
            Self::ExecuteCode => json!({
                "type": "object",
                "properties": {
                    "language": language,
                    "code": { "type": "string", "minLength": 1 },
                    "input": {},
                    "timeout_secs": { "type": "integer", "minimum": 1 }
                },
                "required": ["language", "code"],
                "additionalProperties": false
            }),
            Self::SaveWorkflow => json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "minLength": 1 },
                    "description": { "type": "string" },
                    "language": language,
                    "code": { "type": "string", "minLength": 1 },
                    "tags": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["name", "language", "code"],
                "additionalProperties": false
            }),
            Self::ListWorkflows | Self::ListKpis => json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
            Self::LoadWorkflow => json!({
                "type": "object",
                "properties": { "workflow_id": { "type": "string", "minLength": 1 } },
                "required": ["workflow_id"],
                "additionalProperties": false
            }),
            Self::CreateKpi => json!({
                "type": "object",
                "properties": {
                    "id": { "type": "string" },
                    "name": { "type": "string", "minLength": 1 },
                    "description": { "type": "string" },
                    "query_type": kpi_query_type,
                    "query": { "type": "string", "minLength": 1 },
                    "format": kpi_format,
                    "icon": { "type": "string" },
                    "color": { "type": "string" },
                    "size": kpi_size,
                    "refresh_interval_secs": { "type": "integer", "minimum": 1 }
                },
                "required": ["name", "query_type", "query", "format"],
                "additionalProperties": false
            }),
            Self::UpdateKpi => json!({
                "type": "object",
                "properties": {
                    "kpi_id": { "type": "string", "minLength": 1 },
                    "name": { "type": "string", "minLength": 1 },
                    "description": { "type": "string" },
                    "query_type": kpi_query_type,
                    "query": { "type": "string", "minLength": 1 },
                    "format": kpi_format,
                    "icon": { "type": "string" },
                    "color": { "type": "string" },
                    "size": kpi_size,
                    "refresh_interval_secs": { "type": "integer", "minimum": 1 }
                },
                "required": ["kpi_id"],
                "additionalProperties": false
            }),
            Self::DeleteKpi | Self::RefreshKpi => json!({
                "type": "object",
                "properties": { "kpi_id": { "type": "string", "minLength": 1 } },
                "required": ["kpi_id"],
                "additionalProperties": false
            }),
        }
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("arguments do not match the tool schema: {0}")]
    Schema(String),
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("tool timed out after {} s", .0.as_secs())]
    Timeout(Duration),
    #[error("{0}")]
    Execution(String),
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Schema(_) => "schema_error",
            Self::UnknownTool(_) => "unknown_tool",
            Self::Timeout(_) => "timeout",
            Self::Execution(_) => "execution_error",
        }
    }
}

impl From<CollaboratorError> for ToolError {
    fn from(error: CollaboratorError) -> Self {
        Self::Execution(error.to_string())
    }
}

impl From<RepositoryError> for ToolError {
    fn from(error: RepositoryError) -> Self {
        Self::Execution(error.to_string())
    }
}

impl From<DomainError> for ToolError {
    fn from(error: DomainError) -> Self {
        Self::Execution(error.to_string())
    }
}

/// Per-call context handed to a handler.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub call_id: CallId,
    /// Fired when the call's time budget runs out.
    pub cancel: CancellationToken,
}

/// What a handler produced. A handler may return an error-status output when
/// the work ran but failed, e.g. a script exiting non-zero.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolOutput {
    pub status: ToolStatus,
    pub value: Value,
}

impl ToolOutput {
    pub fn ok(value: Value) -> Self {
        Self { status: ToolStatus::Success, value }
    }

    pub fn failed(value: Value) -> Self {
        Self { status: ToolStatus::Error, value }
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value, context: &ToolContext) -> Result<ToolOutput, ToolError>;
}

pub struct RegisteredTool {
    kind: ToolKind,
    schema: JSONSchema,
    handler: Arc<dyn ToolHandler>,
}

impl RegisteredTool {
    pub fn kind(&self) -> ToolKind {
        self.kind
    }

    pub fn handler(&self) -> Arc<dyn ToolHandler> {
        Arc::clone(&self.handler)
    }

    pub fn validate(&self, arguments: &Value) -> Result<(), ToolError> {
        if let Err(errors) = self.schema.validate(arguments) {
            let details: Vec<String> = errors
                .map(|error| {
                    let path = error.instance_path.to_string();
                    if path.is_empty() {
                        error.to_string()
                    } else {
                        format!("{path}: {error}")
                    }
                })
                .collect();
            return Err(ToolError::Schema(details.join("; ")));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<ToolKind, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `kind` to `handler`, replacing any earlier binding.
    pub fn register(
        &mut self,
        kind: ToolKind,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), ToolError> {
        let schema = kind.input_schema();
        let compiled = JSONSchema::compile(&schema)
            .map_err(|error| ToolError::Schema(format!("{kind}: {error}")))?;
        self.tools.insert(kind, RegisteredTool { kind, schema: compiled, handler });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        ToolKind::from_name(name).and_then(|kind| self.tools.get(&kind))
    }

    pub fn contains(&self, kind: ToolKind) -> bool {
        self.tools.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<ToolKind> {
        ToolKind::ALL.into_iter().filter(|kind| self.tools.contains_key(kind)).collect()
    }

    /// Registered tools in catalogue order, as submitted to the model.
    pub fn catalogue(&self) -> Vec<ToolSpec> {
        self.kinds().iter().map(ToolKind::spec).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use jsonschema::JSONSchema;
    use serde_json::{json, Value};

    use super::{
        DispatchMode, ToolContext, ToolError, ToolHandler, ToolKind, ToolOutput, ToolRegistry,
    };

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, arguments: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::ok(arguments))
        }
    }

    #[test]
    fn names_round_trip_and_are_unique() {
        let mut names: Vec<&str> = ToolKind::ALL.iter().map(ToolKind::name).collect();
        for kind in ToolKind::ALL {
            assert_eq!(ToolKind::from_name(kind.name()), Some(kind));
        }
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 20);
        assert_eq!(ToolKind::from_name("drop_tables"), None);
    }

    #[test]
    fn every_schema_compiles() {
        for kind in ToolKind::ALL {
            let schema = kind.input_schema();
            assert!(JSONSchema::compile(&schema).is_ok(), "{kind} schema must compile");
        }
    }

    #[test]
    fn mutating_tools_run_sequentially() {
        for kind in [ToolKind::ExecuteCode, ToolKind::SaveWorkflow, ToolKind::RefreshKpi] {
            assert_eq!(kind.dispatch_mode(), DispatchMode::Sequential);
        }
        assert_eq!(ToolKind::ListWorkflows.dispatch_mode(), DispatchMode::Concurrent);
    }

    #[test]
    fn billing_lookups_may_overlap() {
        for kind in [
            ToolKind::GetCostByTag,
            ToolKind::GetRiSpCoverage,
            ToolKind::GetBudgetsStatus,
            ToolKind::GetDimensionValues,
            ToolKind::GetUntaggedResources,
        ] {
            assert_eq!(kind.dispatch_mode(), DispatchMode::Concurrent, "{kind}");
        }
    }

    #[test]
    fn tag_keys_with_quotes_fail_validation() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolKind::GetUntaggedResources, Arc::new(Echo)).expect("register");
        let tool = registry.get("get_untagged_resources").expect("tool");
        let window = |tags: Value| {
            json!({ "required_tags": tags, "start_date": "2025-01-01", "end_date": "2025-02-01" })
        };

        assert!(tool.validate(&window(json!(["team", "cost-center", "aws:createdBy"]))).is_ok());
        assert!(tool.validate(&window(json!(["team\" = '' OR 1=1 --"]))).is_err());
    }

    #[test]
    fn catalogue_lists_only_registered_tools_in_order() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolKind::ListKpis, Arc::new(Echo)).expect("register");
        registry.register(ToolKind::ExecuteCode, Arc::new(Echo)).expect("register");

        let names: Vec<String> = registry.catalogue().into_iter().map(|spec| spec.name).collect();
        assert_eq!(names, vec!["execute_code".to_string(), "list_kpis".to_string()]);
        assert!(registry.get("query_cost_data").is_none());
    }

    #[test]
    fn validation_reports_the_offending_field() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolKind::ExecuteCode, Arc::new(Echo)).expect("register");
        let tool = registry.get("execute_code").expect("tool");

        assert!(tool.validate(&json!({ "language": "python", "code": "print(1)" })).is_ok());
        let error = tool
            .validate(&json!({ "language": "ruby", "code": "puts 1" }))
            .expect_err("ruby is not offered");
        match error {
            ToolError::Schema(detail) => assert!(detail.contains("/language"), "{detail}"),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(tool.validate(&json!({ "language": "python" })).is_err());
    }
}
