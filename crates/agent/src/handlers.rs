//! One handler per catalogue entry, plus the wiring that registers only the
//! tools whose collaborators are present.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use finops_core::domain::kpi::{KpiId, KpiPatch, KpiQueryType, NewKpi};
use finops_core::domain::sandbox::Language;
use finops_core::domain::workflow::{NewWorkflow, WorkflowId, WorkflowSummary};
use finops_db::repositories::{KpiRepository, WorkflowRepository};

use crate::collaborators::{
    AnomalyWindow, BillingApi, CostPeriod, DimensionQuery, MetricDimension, MetricQuery,
    MetricsApi, QueryEngine, TableQuery, TagCostQuery,
};
use crate::sandbox::{CodeSandbox, SandboxRequest};
use crate::tools::{ToolContext, ToolError, ToolHandler, ToolKind, ToolOutput, ToolRegistry};

const DEFAULT_METRIC_PERIOD_SECS: u32 = 3600;
const UNTAGGED_RESOURCE_LIMIT: u32 = 100;

/// Shared handles to everything a tool may reach. Absent handles mean the
/// corresponding tools are left out of the catalogue.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub query_engine: Option<Arc<dyn QueryEngine>>,
    pub billing: Option<Arc<dyn BillingApi>>,
    pub metrics: Option<Arc<dyn MetricsApi>>,
    pub sandbox: Option<Arc<CodeSandbox>>,
    pub workflows: Option<Arc<dyn WorkflowRepository>>,
    pub kpis: Option<Arc<dyn KpiRepository>>,
}

/// Registers every tool whose collaborators are available and returns the
/// kinds that were bound.
pub fn register_available(
    registry: &mut ToolRegistry,
    collaborators: &Collaborators,
) -> Result<Vec<ToolKind>, ToolError> {
    let mut bound: Vec<(ToolKind, Arc<dyn ToolHandler>)> = Vec::new();

    if let Some(engine) = &collaborators.query_engine {
        bound.push((ToolKind::QueryCostData, Arc::new(QueryCostData { engine: Arc::clone(engine) })));
        bound.push((
            ToolKind::GetUntaggedResources,
            Arc::new(UntaggedResources { engine: Arc::clone(engine) }),
        ));
    }
    if let Some(billing) = &collaborators.billing {
        bound.push((ToolKind::GetCostByService, Arc::new(CostByService { billing: Arc::clone(billing) })));
        bound.push((ToolKind::GetCostForecast, Arc::new(CostForecast { billing: Arc::clone(billing) })));
        bound.push((ToolKind::GetCostAnomalies, Arc::new(CostAnomalies { billing: Arc::clone(billing) })));
        bound.push((ToolKind::GetCostByTag, Arc::new(CostByTag { billing: Arc::clone(billing) })));
        bound.push((
            ToolKind::GetRiSpCoverage,
            Arc::new(CommitmentCoverage { billing: Arc::clone(billing) }),
        ));
        bound.push((ToolKind::GetBudgetsStatus, Arc::new(BudgetsStatus { billing: Arc::clone(billing) })));
        bound.push((
            ToolKind::GetDimensionValues,
            Arc::new(DimensionValues { billing: Arc::clone(billing) }),
        ));
    }
    if let Some(metrics) = &collaborators.metrics {
        bound.push((
            ToolKind::GetResourceMetrics,
            Arc::new(ResourceMetrics { metrics: Arc::clone(metrics) }),
        ));
        if let Some(engine) = &collaborators.query_engine {
            bound.push((
                ToolKind::CorrelateCostUtilization,
                Arc::new(CorrelateCostUtilization {
                    engine: Arc::clone(engine),
                    metrics: Arc::clone(metrics),
                }),
            ));
        }
    }
    if let Some(sandbox) = &collaborators.sandbox {
        bound.push((ToolKind::ExecuteCode, Arc::new(ExecuteCode { sandbox: Arc::clone(sandbox) })));
    }
    if let Some(workflows) = &collaborators.workflows {
        bound.push((ToolKind::SaveWorkflow, Arc::new(SaveWorkflow { workflows: Arc::clone(workflows) })));
        bound.push((ToolKind::ListWorkflows, Arc::new(ListWorkflows { workflows: Arc::clone(workflows) })));
        bound.push((ToolKind::LoadWorkflow, Arc::new(LoadWorkflow { workflows: Arc::clone(workflows) })));
    }
    if let Some(kpis) = &collaborators.kpis {
        bound.push((ToolKind::CreateKpi, Arc::new(CreateKpi { kpis: Arc::clone(kpis) })));
        bound.push((ToolKind::ListKpis, Arc::new(ListKpis { kpis: Arc::clone(kpis) })));
        bound.push((ToolKind::UpdateKpi, Arc::new(UpdateKpi { kpis: Arc::clone(kpis) })));
        bound.push((ToolKind::DeleteKpi, Arc::new(DeleteKpi { kpis: Arc::clone(kpis) })));
        if collaborators.query_engine.is_some() || collaborators.billing.is_some() {
            bound.push((
                ToolKind::RefreshKpi,
                Arc::new(RefreshKpi {
                    kpis: Arc::clone(kpis),
                    engine: collaborators.query_engine.clone(),
                    billing: collaborators.billing.clone(),
                }),
            ));
        }
    }

    let mut kinds = Vec::with_capacity(bound.len());
    for (kind, handler) in bound {
        registry.register(kind, handler)?;
        kinds.push(kind);
    }
    debug!(event_name = "agent.tools.registered", count = kinds.len(), "tool catalogue assembled");
    Ok(kinds)
}

fn parse<T: DeserializeOwned>(arguments: Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|error| ToolError::Schema(error.to_string()))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|error| ToolError::Execution(error.to_string()))
}

/// Rows of a query result: either a bare array or an object carrying
/// `data` / `rows`.
pub fn result_rows(result: &Value) -> Vec<&Map<String, Value>> {
    let rows = match result {
        Value::Array(rows) => Some(rows),
        Value::Object(object) => object
            .get("data")
            .or_else(|| object.get("rows"))
            .and_then(Value::as_array),
        _ => None,
    };
    rows.map(|rows| rows.iter().filter_map(Value::as_object).collect()).unwrap_or_default()
}

/// Numbers arrive as JSON numbers or as numeric strings depending on the engine.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

struct QueryCostData {
    engine: Arc<dyn QueryEngine>,
}

#[derive(Deserialize)]
struct QueryArgs {
    query: String,
}

#[async_trait]
impl ToolHandler for QueryCostData {
    async fn call(&self, arguments: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: QueryArgs = parse(arguments)?;
        let query = TableQuery::new(args.query)?;
        Ok(ToolOutput::ok(self.engine.run(&query).await?))
    }
}

struct CostByService {
    billing: Arc<dyn BillingApi>,
}

#[async_trait]
impl ToolHandler for CostByService {
    async fn call(&self, arguments: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let period: CostPeriod = parse(arguments)?;
        period.validate()?;
        Ok(ToolOutput::ok(self.billing.cost_by_service(&period).await?))
    }
}

struct CostForecast {
    billing: Arc<dyn BillingApi>,
}

#[async_trait]
impl ToolHandler for CostForecast {
    async fn call(&self, arguments: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let period: CostPeriod = parse(arguments)?;
        period.validate()?;
        Ok(ToolOutput::ok(self.billing.cost_forecast(&period).await?))
    }
}

struct CostAnomalies {
    billing: Arc<dyn BillingApi>,
}

#[async_trait]
impl ToolHandler for CostAnomalies {
    async fn call(&self, arguments: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let window: AnomalyWindow = parse(arguments)?;
        if window.start_date >= window.end_date {
            return Err(ToolError::Execution(format!(
                "start_date {} must be before end_date {}",
                window.start_date, window.end_date
            )));
        }
        Ok(ToolOutput::ok(self.billing.cost_anomalies(&window).await?))
    }
}

struct CostByTag {
    billing: Arc<dyn BillingApi>,
}

#[async_trait]
impl ToolHandler for CostByTag {
    async fn call(&self, arguments: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let query: TagCostQuery = parse(arguments)?;
        if query.tag_key.trim().is_empty() {
            return Err(ToolError::Schema("tag_key must not be blank".into()));
        }
        query.period.validate()?;
        Ok(ToolOutput::ok(self.billing.cost_by_tag(&query).await?))
    }
}

struct CommitmentCoverage {
    billing: Arc<dyn BillingApi>,
}

#[async_trait]
impl ToolHandler for CommitmentCoverage {
    async fn call(&self, arguments: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let period: CostPeriod = parse(arguments)?;
        period.validate()?;
        Ok(ToolOutput::ok(self.billing.commitment_coverage(&period).await?))
    }
}

struct BudgetsStatus {
    billing: Arc<dyn BillingApi>,
}

#[derive(Deserialize)]
struct BudgetArgs {
    #[serde(default)]
    account_id: Option<String>,
}

#[async_trait]
impl ToolHandler for BudgetsStatus {
    async fn call(&self, arguments: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: BudgetArgs = parse(arguments)?;
        Ok(ToolOutput::ok(self.billing.budgets(args.account_id.as_deref()).await?))
    }
}

struct DimensionValues {
    billing: Arc<dyn BillingApi>,
}

#[async_trait]
impl ToolHandler for DimensionValues {
    async fn call(&self, arguments: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let mut query: DimensionQuery = parse(arguments)?;
        if query.start_date >= query.end_date {
            return Err(ToolError::Execution(format!(
                "start_date {} must be before end_date {}",
                query.start_date, query.end_date
            )));
        }
        query.search_string = query
            .search_string
            .map(|search| search.trim().to_string())
            .filter(|search| !search.is_empty());
        Ok(ToolOutput::ok(self.billing.dimension_values(&query).await?))
    }
}

struct UntaggedResources {
    engine: Arc<dyn QueryEngine>,
}

#[derive(Deserialize)]
struct UntaggedArgs {
    #[serde(default)]
    required_tags: Vec<String>,
    start_date: NaiveDate,
    end_date: NaiveDate,
}

/// Tag keys end up inside quoted column names, so quotes and braces never pass.
fn is_safe_tag_key(key: &str) -> bool {
    !key.trim().is_empty()
        && key.chars().all(|c| c.is_ascii_alphanumeric() || "_.:/=+@ -".contains(c))
}

impl UntaggedResources {
    fn query(args: &UntaggedArgs) -> Result<TableQuery, ToolError> {
        if let Some(bad) = args.required_tags.iter().find(|key| !is_safe_tag_key(key)) {
            return Err(ToolError::Schema(format!("invalid tag key `{bad}`")));
        }
        let missing_tag = if args.required_tags.is_empty() {
            String::new()
        } else {
            let checks: Vec<String> = args
                .required_tags
                .iter()
                .map(|key| format!("COALESCE(\"resourcetags/user:{key}\", '') = ''"))
                .collect();
            format!("\n  AND ({})", checks.join(" OR "))
        };
        Ok(TableQuery::new(format!(
            "SELECT \"lineitem/resourceid\" AS resource_id,\n  \
             \"product/productname\" AS service,\n  \
             ROUND(SUM(\"lineitem/unblendedcost\"), 2) AS cost\n\
             FROM {{table}}\n\
             WHERE \"lineitem/resourceid\" <> ''\n  \
             AND \"lineitem/usagestartdate\" >= DATE('{start}')\n  \
             AND \"lineitem/usagestartdate\" < DATE('{end}'){missing_tag}\n\
             GROUP BY \"lineitem/resourceid\", \"product/productname\"\n\
             HAVING SUM(\"lineitem/unblendedcost\") > 0\n\
             ORDER BY cost DESC\n\
             LIMIT {UNTAGGED_RESOURCE_LIMIT}",
            start = args.start_date,
            end = args.end_date,
        ))?)
    }
}

#[async_trait]
impl ToolHandler for UntaggedResources {
    async fn call(&self, arguments: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: UntaggedArgs = parse(arguments)?;
        if args.start_date >= args.end_date {
            return Err(ToolError::Execution("start_date must be before end_date".into()));
        }
        let query = Self::query(&args)?;
        Ok(ToolOutput::ok(self.engine.run(&query).await?))
    }
}

struct ResourceMetrics {
    metrics: Arc<dyn MetricsApi>,
}

#[derive(Deserialize)]
struct MetricArgs {
    namespace: String,
    metric_name: String,
    #[serde(default)]
    dimensions: Vec<MetricDimension>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    period_secs: Option<u32>,
}

#[async_trait]
impl ToolHandler for ResourceMetrics {
    async fn call(&self, arguments: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: MetricArgs = parse(arguments)?;
        if args.start_time >= args.end_time {
            return Err(ToolError::Execution("start_time must be before end_time".into()));
        }
        let query = MetricQuery {
            namespace: args.namespace,
            metric_name: args.metric_name,
            dimensions: args.dimensions,
            start_time: args.start_time,
            end_time: args.end_time,
            period_secs: args.period_secs.unwrap_or(DEFAULT_METRIC_PERIOD_SECS),
        };
        Ok(ToolOutput::ok(self.metrics.resource_metrics(&query).await?))
    }
}

struct CorrelateCostUtilization {
    engine: Arc<dyn QueryEngine>,
    metrics: Arc<dyn MetricsApi>,
}

#[derive(Deserialize)]
struct CorrelateArgs {
    instance_ids: Vec<String>,
    start_date: NaiveDate,
    end_date: NaiveDate,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct CpuSample {
    average: f64,
    maximum: f64,
    datapoints: u64,
}

/// Rightsizing verdict and the share of cost it could save.
fn recommend(cpu: CpuSample) -> (&'static str, f64) {
    if cpu.average < 20.0 && cpu.maximum < 40.0 {
        ("Underutilized - consider downsizing", 0.5)
    } else if cpu.average < 40.0 && cpu.maximum < 60.0 {
        ("Low utilization - review workload", 0.25)
    } else if cpu.average > 80.0 {
        ("High utilization - may need upsize", 0.0)
    } else {
        ("Appropriately sized", 0.0)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl CorrelateCostUtilization {
    fn cost_query(args: &CorrelateArgs) -> Result<TableQuery, ToolError> {
        if let Some(bad) = args
            .instance_ids
            .iter()
            .find(|id| id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
        {
            return Err(ToolError::Schema(format!("invalid instance id `{bad}`")));
        }
        let ids = args.instance_ids.join("','");
        Ok(TableQuery::new(format!(
            "SELECT \"lineitem/resourceid\" AS instance_id,\n  \
             ROUND(SUM(\"lineitem/unblendedcost\"), 2) AS total_cost,\n  \
             COUNT(*) AS hours\n\
             FROM {{table}}\n\
             WHERE \"lineitem/resourceid\" IN ('{ids}')\n  \
             AND \"lineitem/usagestartdate\" >= DATE('{start}')\n  \
             AND \"lineitem/usagestartdate\" < DATE('{end}')\n  \
             AND \"lineitem/productcode\" = 'AmazonEC2'\n\
             GROUP BY \"lineitem/resourceid\"",
            start = args.start_date,
            end = args.end_date,
        ))?)
    }

    fn cpu_sample(utilization: &Value, instance_id: &str) -> Result<CpuSample, String> {
        let Some(cpu) = utilization.get(instance_id).and_then(|entry| entry.get("CPUUtilization"))
        else {
            return Err("No metrics available - instance may be stopped".into());
        };
        if let Some(error) = cpu.get("error").and_then(Value::as_str) {
            return Err(format!("Error: {error}"));
        }
        let datapoints = cpu.get("datapoints").and_then(Value::as_u64).unwrap_or(0);
        match (cpu.get("average").and_then(as_f64), cpu.get("maximum").and_then(as_f64)) {
            (Some(average), Some(maximum)) if datapoints > 0 => {
                Ok(CpuSample { average, maximum, datapoints })
            }
            _ => Err("No data - instance stopped or just started".into()),
        }
    }
}

#[async_trait]
impl ToolHandler for CorrelateCostUtilization {
    async fn call(&self, arguments: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: CorrelateArgs = parse(arguments)?;
        if args.start_date >= args.end_date {
            return Err(ToolError::Execution("start_date must be before end_date".into()));
        }

        let query = Self::cost_query(&args)?;
        let costs: Map<String, Value> = match self.engine.run(&query).await {
            Ok(result) => result_rows(&result)
                .into_iter()
                .filter_map(|row| {
                    let id = row.get("instance_id")?.as_str()?.to_string();
                    let cost = row.get("total_cost").and_then(as_f64).unwrap_or(0.0);
                    Some((id, json!(cost)))
                })
                .collect(),
            Err(error) => {
                warn!(event_name = "agent.tool.correlate.cost_query_failed", error = %error, "cost lookup failed, continuing with zero cost");
                Map::new()
            }
        };

        let start = args.start_date.and_time(NaiveTime::MIN).and_utc();
        let end = args
            .end_date
            .and_hms_opt(23, 59, 59)
            .map(|end| end.and_utc())
            .unwrap_or(start);
        let utilization = self.metrics.instance_utilization(&args.instance_ids, start, end).await?;

        let mut analysis = Vec::with_capacity(args.instance_ids.len());
        let mut total_cost = 0.0;
        let mut total_savings = 0.0;
        for instance_id in &args.instance_ids {
            let cost = costs.get(instance_id).and_then(as_f64).unwrap_or(0.0);
            total_cost += cost;
            let entry = match Self::cpu_sample(&utilization, instance_id) {
                Ok(cpu) => {
                    let (recommendation, share) = recommend(cpu);
                    let savings = round2(cost * share);
                    total_savings += savings;
                    json!({
                        "instance_id": instance_id,
                        "cost": cost,
                        "avg_cpu": round2(cpu.average),
                        "max_cpu": round2(cpu.maximum),
                        "datapoints": cpu.datapoints,
                        "recommendation": recommendation,
                        "potential_savings": savings,
                    })
                }
                Err(recommendation) => json!({
                    "instance_id": instance_id,
                    "cost": cost,
                    "avg_cpu": null,
                    "max_cpu": null,
                    "datapoints": 0,
                    "recommendation": recommendation,
                    "potential_savings": 0.0,
                }),
            };
            analysis.push(entry);
        }

        Ok(ToolOutput::ok(json!({
            "analysis": analysis,
            "total_cost": round2(total_cost),
            "total_potential_savings": round2(total_savings),
        })))
    }
}

struct ExecuteCode {
    sandbox: Arc<CodeSandbox>,
}

#[derive(Deserialize)]
struct ExecuteArgs {
    language: String,
    code: String,
    input: Option<Value>,
    timeout_secs: Option<u64>,
}

#[async_trait]
impl ToolHandler for ExecuteCode {
    async fn call(&self, arguments: Value, context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: ExecuteArgs = parse(arguments)?;
        let language: Language = args.language.parse()?;

        // Callers may shorten the limit, never extend it.
        let ceiling = self.sandbox.settings().timeout;
        let timeout = args.timeout_secs.map(Duration::from_secs).map_or(ceiling, |t| t.min(ceiling));

        let mut request = SandboxRequest::new(language, args.code)
            .with_timeout(timeout)
            .with_cancel(context.cancel.child_token());
        if let Some(input) = args.input.filter(|input| !input.is_null()) {
            request = request.with_input(input);
        }

        let execution = self.sandbox.run(request).await;
        let payload = json!({
            "execution_id": execution.id,
            "language": execution.language,
            "outcome": execution.outcome,
            "exit_code": execution.exit_code,
            "stdout": execution.stdout.text,
            "stderr": execution.stderr.text,
            "stdout_truncated": execution.stdout.truncated,
            "stderr_truncated": execution.stderr.truncated,
            "duration_ms": execution.duration.as_millis() as u64,
        });
        if execution.succeeded() {
            Ok(ToolOutput::ok(payload))
        } else {
            Ok(ToolOutput::failed(payload))
        }
    }
}

struct SaveWorkflow {
    workflows: Arc<dyn WorkflowRepository>,
}

#[derive(Deserialize)]
struct SaveWorkflowArgs {
    name: String,
    #[serde(default)]
    description: String,
    language: String,
    code: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[async_trait]
impl ToolHandler for SaveWorkflow {
    async fn call(&self, arguments: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: SaveWorkflowArgs = parse(arguments)?;
        let workflow = NewWorkflow {
            name: args.name,
            description: args.description,
            language: args.language.parse()?,
            source: args.code,
            tags: args.tags,
        };
        let saved = self.workflows.save(workflow).await?;
        Ok(ToolOutput::ok(json!({
            "workflow_id": saved.id,
            "name": saved.name,
            "message": format!("Workflow '{}' saved", saved.name),
        })))
    }
}

struct ListWorkflows {
    workflows: Arc<dyn WorkflowRepository>,
}

#[async_trait]
impl ToolHandler for ListWorkflows {
    async fn call(&self, _arguments: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let summaries: Vec<WorkflowSummary> = self.workflows.list().await?;
        Ok(ToolOutput::ok(json!({
            "count": summaries.len(),
            "workflows": to_value(&summaries)?,
        })))
    }
}

struct LoadWorkflow {
    workflows: Arc<dyn WorkflowRepository>,
}

#[derive(Deserialize)]
struct WorkflowIdArgs {
    workflow_id: String,
}

#[async_trait]
impl ToolHandler for LoadWorkflow {
    async fn call(&self, arguments: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: WorkflowIdArgs = parse(arguments)?;
        let id = WorkflowId(args.workflow_id);
        match self.workflows.load(&id).await? {
            Some(workflow) => Ok(ToolOutput::ok(to_value(&workflow)?)),
            None => Err(ToolError::Execution(format!("workflow `{id}` not found"))),
        }
    }
}

struct CreateKpi {
    kpis: Arc<dyn KpiRepository>,
}

#[async_trait]
impl ToolHandler for CreateKpi {
    async fn call(&self, arguments: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let kpi: NewKpi = parse(arguments)?;
        let created = self.kpis.create(kpi).await?;
        Ok(ToolOutput::ok(to_value(&created)?))
    }
}

struct ListKpis {
    kpis: Arc<dyn KpiRepository>,
}

#[async_trait]
impl ToolHandler for ListKpis {
    async fn call(&self, _arguments: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let kpis = self.kpis.list().await?;
        Ok(ToolOutput::ok(json!({ "count": kpis.len(), "kpis": to_value(&kpis)? })))
    }
}

struct UpdateKpi {
    kpis: Arc<dyn KpiRepository>,
}

#[derive(Deserialize)]
struct UpdateKpiArgs {
    kpi_id: String,
    #[serde(flatten)]
    patch: KpiPatch,
}

#[async_trait]
impl ToolHandler for UpdateKpi {
    async fn call(&self, arguments: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: UpdateKpiArgs = parse(arguments)?;
        if args.patch.is_empty() {
            return Err(ToolError::Execution("no KPI fields to update".into()));
        }
        let id = KpiId(args.kpi_id);
        match self.kpis.update(&id, args.patch).await? {
            Some(kpi) => Ok(ToolOutput::ok(to_value(&kpi)?)),
            None => Err(ToolError::Execution(format!("kpi `{}` not found", id.0))),
        }
    }
}

struct DeleteKpi {
    kpis: Arc<dyn KpiRepository>,
}

#[derive(Deserialize)]
struct KpiIdArgs {
    kpi_id: String,
}

#[async_trait]
impl ToolHandler for DeleteKpi {
    async fn call(&self, arguments: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: KpiIdArgs = parse(arguments)?;
        let id = KpiId(args.kpi_id);
        if self.kpis.delete(&id).await? {
            Ok(ToolOutput::ok(json!({ "kpi_id": id.0, "deleted": true })))
        } else {
            Err(ToolError::Execution(format!("kpi `{}` not found", id.0)))
        }
    }
}

struct RefreshKpi {
    kpis: Arc<dyn KpiRepository>,
    engine: Option<Arc<dyn QueryEngine>>,
    billing: Option<Arc<dyn BillingApi>>,
}

impl RefreshKpi {
    async fn compute(&self, query_type: KpiQueryType, query: &str) -> Result<Value, ToolError> {
        match query_type {
            KpiQueryType::Cur => {
                let Some(engine) = &self.engine else {
                    return Err(ToolError::Execution("no billing report query engine is configured".into()));
                };
                let result = engine.run(&TableQuery::new(query)?).await?;
                let value = result_rows(&result)
                    .first()
                    .and_then(|row| row.values().next().cloned())
                    .ok_or_else(|| ToolError::Execution("query returned no data".into()))?;
                if value.is_null() {
                    return Err(ToolError::Execution(
                        "query returned NULL, check the date filters".into(),
                    ));
                }
                Ok(value)
            }
            KpiQueryType::CostExplorer => {
                let Some(billing) = &self.billing else {
                    return Err(ToolError::Execution("no billing API is configured".into()));
                };
                Ok(billing.named_metric(query).await?)
            }
        }
    }
}

#[async_trait]
impl ToolHandler for RefreshKpi {
    async fn call(&self, arguments: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: KpiIdArgs = parse(arguments)?;
        let id = KpiId(args.kpi_id);
        let Some(kpi) = self.kpis.get(&id).await? else {
            return Err(ToolError::Execution(format!("kpi `{}` not found", id.0)));
        };

        let value = self.compute(kpi.query_type, &kpi.query).await?;
        let Some(updated) = self.kpis.record_value(&id, value, Utc::now()).await? else {
            return Err(ToolError::Execution(format!("kpi `{}` was deleted during refresh", id.0)));
        };
        Ok(ToolOutput::ok(json!({
            "kpi_id": updated.id,
            "value": updated.last_value,
            "trend": updated.trend,
            "updated": updated.last_updated,
        })))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        as_f64, is_safe_tag_key, recommend, result_rows, CorrelateArgs, CorrelateCostUtilization,
        CpuSample, UntaggedArgs, UntaggedResources,
    };

    #[test]
    fn rows_are_found_in_common_result_shapes() {
        assert_eq!(result_rows(&json!([{ "a": 1 }])).len(), 1);
        assert_eq!(result_rows(&json!({ "data": [{ "a": 1 }, { "a": 2 }] })).len(), 2);
        assert_eq!(result_rows(&json!({ "rows": [] })).len(), 0);
        assert!(result_rows(&json!("nope")).is_empty());
    }

    #[test]
    fn numeric_strings_are_numbers() {
        assert_eq!(as_f64(&json!("12.5")), Some(12.5));
        assert_eq!(as_f64(&json!(3)), Some(3.0));
        assert_eq!(as_f64(&json!(null)), None);
    }

    #[test]
    fn rightsizing_thresholds() {
        let sample = |average, maximum| CpuSample { average, maximum, datapoints: 24 };
        assert_eq!(recommend(sample(5.0, 12.0)).1, 0.5);
        assert_eq!(recommend(sample(30.0, 55.0)).1, 0.25);
        assert_eq!(recommend(sample(85.0, 99.0)).0, "High utilization - may need upsize");
        assert_eq!(recommend(sample(50.0, 90.0)).0, "Appropriately sized");
    }

    #[test]
    fn cost_query_uses_the_table_placeholder() {
        let args: CorrelateArgs = serde_json::from_value(json!({
            "instance_ids": ["i-0abc", "i-0def"],
            "start_date": "2025-01-01",
            "end_date": "2025-02-01"
        }))
        .expect("args");
        let query = CorrelateCostUtilization::cost_query(&args).expect("query");
        let sql = query.render("\"cur\".\"report\"");
        assert!(sql.contains("FROM \"cur\".\"report\""));
        assert!(sql.contains("IN ('i-0abc','i-0def')"));

        let hostile: CorrelateArgs = serde_json::from_value(json!({
            "instance_ids": ["i-1') OR 1=1 --"],
            "start_date": "2025-01-01",
            "end_date": "2025-02-01"
        }))
        .expect("args");
        assert!(CorrelateCostUtilization::cost_query(&hostile).is_err());
    }

    #[test]
    fn untagged_query_checks_every_required_tag() {
        let args: UntaggedArgs = serde_json::from_value(json!({
            "required_tags": ["team", "cost-center"],
            "start_date": "2025-01-01",
            "end_date": "2025-02-01"
        }))
        .expect("args");
        let sql = UntaggedResources::query(&args).expect("query").render("\"cur\".\"report\"");

        assert!(sql.contains("FROM \"cur\".\"report\""));
        assert!(sql.contains(
            "AND (COALESCE(\"resourcetags/user:team\", '') = '' OR \
             COALESCE(\"resourcetags/user:cost-center\", '') = '')"
        ));
        assert!(sql.ends_with("LIMIT 100"));
    }

    #[test]
    fn untagged_query_without_tags_lists_all_billed_resources() {
        let args: UntaggedArgs =
            serde_json::from_value(json!({ "start_date": "2025-01-01", "end_date": "2025-02-01" }))
                .expect("args");
        let sql = UntaggedResources::query(&args).expect("query").render("cur");
        assert!(!sql.contains("resourcetags"));
        assert!(sql.contains("< DATE('2025-02-01')\nGROUP BY"));
    }

    #[test]
    fn hostile_tag_keys_are_refused() {
        assert!(is_safe_tag_key("aws:createdBy"));
        assert!(!is_safe_tag_key("team\" IS NULL OR \"x"));
        assert!(!is_safe_tag_key("{table}"));
        assert!(!is_safe_tag_key("  "));

        let args: UntaggedArgs = serde_json::from_value(json!({
            "required_tags": ["team", "owner') --"],
            "start_date": "2025-01-01",
            "end_date": "2025-02-01"
        }))
        .expect("args");
        assert!(UntaggedResources::query(&args).is_err());
    }
}
