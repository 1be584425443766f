use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::DomainError;

pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 1800;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KpiId(pub String);

impl KpiId {
    pub fn generate() -> Self {
        Self(format!("kpi_{}", Uuid::new_v4().simple()))
    }
}

impl fmt::Display for KpiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(DomainError::InvalidKpi(format!(
                        concat!("unknown ", stringify!($name), " `{}`"),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KpiQueryType {
    /// SQL against the billing report table, with a `{table}` placeholder.
    Cur,
    /// Named billing API method such as `get_anomalies_count`.
    CostExplorer,
}

string_enum!(KpiQueryType { Cur => "cur", CostExplorer => "cost_explorer" });

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KpiFormat {
    Currency,
    Number,
    Percentage,
    Text,
}

string_enum!(KpiFormat {
    Currency => "currency",
    Number => "number",
    Percentage => "percentage",
    Text => "text",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KpiSize {
    Small,
    Medium,
    Large,
}

string_enum!(KpiSize { Small => "small", Medium => "medium", Large => "large" });

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KpiTrend {
    Up,
    Down,
    Flat,
}

string_enum!(KpiTrend { Up => "up", Down => "down", Flat => "flat" });

impl KpiTrend {
    /// Direction between two recorded values; `None` when either is non-numeric.
    pub fn between(previous: Option<&Value>, current: &Value) -> Option<Self> {
        let previous = previous.and_then(numeric)?;
        let current = numeric(current)?;
        let delta = current - previous;
        if delta.abs() < f64::EPSILON {
            Some(Self::Flat)
        } else if delta > 0.0 {
            Some(Self::Up)
        } else {
            Some(Self::Down)
        }
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Kpi {
    pub id: KpiId,
    pub name: String,
    pub description: String,
    pub query_type: KpiQueryType,
    pub query: String,
    pub format: KpiFormat,
    pub icon: String,
    pub color: String,
    pub size: KpiSize,
    pub refresh_interval_secs: u64,
    pub last_value: Option<Value>,
    pub last_updated: Option<DateTime<Utc>>,
    pub trend: Option<KpiTrend>,
}

impl Kpi {
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        let Some(last_updated) = self.last_updated else {
            return true;
        };
        let interval = Duration::seconds(i64::try_from(self.refresh_interval_secs).unwrap_or(i64::MAX));
        now - last_updated > interval
    }

    /// Stores a freshly computed value and derives the trend from the previous one.
    pub fn record_value(&mut self, value: Value, now: DateTime<Utc>) {
        if let Some(trend) = KpiTrend::between(self.last_value.as_ref(), &value) {
            self.trend = Some(trend);
        }
        self.last_value = Some(value);
        self.last_updated = Some(now);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewKpi {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub query_type: KpiQueryType,
    pub query: String,
    pub format: KpiFormat,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub size: Option<KpiSize>,
    #[serde(default)]
    pub refresh_interval_secs: Option<u64>,
}

impl NewKpi {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::InvalidKpi("kpi name must not be empty".into()));
        }
        validate_query(self.query_type, &self.query)
    }

    pub fn into_kpi(self) -> Kpi {
        let id = self
            .id
            .filter(|id| !id.trim().is_empty())
            .map(KpiId)
            .unwrap_or_else(KpiId::generate);
        Kpi {
            id,
            name: self.name.trim().to_string(),
            description: self.description,
            query_type: self.query_type,
            query: self.query,
            format: self.format,
            icon: self.icon.unwrap_or_else(|| "📊".to_string()),
            color: self.color.unwrap_or_else(|| "#33ccff".to_string()),
            size: self.size.unwrap_or(KpiSize::Medium),
            refresh_interval_secs: self.refresh_interval_secs.unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS),
            last_value: None,
            last_updated: None,
            trend: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KpiPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub query_type: Option<KpiQueryType>,
    pub query: Option<String>,
    pub format: Option<KpiFormat>,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub size: Option<KpiSize>,
    pub refresh_interval_secs: Option<u64>,
}

impl KpiPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply(self, kpi: &mut Kpi) -> Result<(), DomainError> {
        let query_type = self.query_type.unwrap_or(kpi.query_type);
        let query = self.query.clone().unwrap_or_else(|| kpi.query.clone());
        validate_query(query_type, &query)?;

        if let Some(name) = self.name {
            kpi.name = name;
        }
        if let Some(description) = self.description {
            kpi.description = description;
        }
        kpi.query_type = query_type;
        kpi.query = query;
        if let Some(format) = self.format {
            kpi.format = format;
        }
        if let Some(icon) = self.icon {
            kpi.icon = icon;
        }
        if let Some(color) = self.color {
            kpi.color = color;
        }
        if let Some(size) = self.size {
            kpi.size = size;
        }
        if let Some(interval) = self.refresh_interval_secs {
            kpi.refresh_interval_secs = interval;
        }
        Ok(())
    }
}

fn validate_query(query_type: KpiQueryType, query: &str) -> Result<(), DomainError> {
    if query.trim().is_empty() {
        return Err(DomainError::InvalidKpi("kpi query must not be empty".into()));
    }
    if query_type == KpiQueryType::Cur && !query.contains("{table}") {
        return Err(DomainError::InvalidKpi(
            "cur kpi queries must reference the `{table}` placeholder".into(),
        ));
    }
    Ok(())
}

/// Dashboard KPIs installed into an empty store.
pub fn default_kpis() -> Vec<Kpi> {
    const CURRENT_MONTH: &str = "MONTH(\"bill/billingperiodstartdate\") = MONTH(current_date)\n  AND YEAR(\"bill/billingperiodstartdate\") = YEAR(current_date)";

    let seed = |id: &str,
                name: &str,
                description: &str,
                query_type: KpiQueryType,
                query: String,
                format: KpiFormat,
                (icon, color, size): (&str, &str, KpiSize),
                refresh_interval_secs: u64| Kpi {
        id: KpiId(id.to_string()),
        name: name.to_string(),
        description: description.to_string(),
        query_type,
        query,
        format,
        icon: icon.to_string(),
        color: color.to_string(),
        size,
        refresh_interval_secs,
        last_value: None,
        last_updated: None,
        trend: None,
    };

    vec![
        seed(
            "total_monthly_cost",
            "Total Monthly Cost",
            "Total cloud spend for the current month",
            KpiQueryType::Cur,
            format!("SELECT SUM(\"lineitem/unblendedcost\") AS total_cost FROM {{table}} WHERE {CURRENT_MONTH}"),
            KpiFormat::Currency,
            ("💰", "#a826b3", KpiSize::Large),
            3600,
        ),
        seed(
            "daily_cost",
            "Daily Cost",
            "Average daily spend this month",
            KpiQueryType::Cur,
            format!(
                "SELECT SUM(\"lineitem/unblendedcost\") / COUNT(DISTINCT DATE(\"lineitem/usagestartdate\")) AS daily_avg FROM {{table}} WHERE {CURRENT_MONTH}"
            ),
            KpiFormat::Currency,
            ("📊", "#33ccff", KpiSize::Medium),
            1800,
        ),
        seed(
            "top_service",
            "Top Service",
            "Highest cost service this month",
            KpiQueryType::Cur,
            format!(
                "SELECT \"lineitem/productcode\" AS service FROM {{table}} WHERE {CURRENT_MONTH} GROUP BY \"lineitem/productcode\" ORDER BY SUM(\"lineitem/unblendedcost\") DESC LIMIT 1"
            ),
            KpiFormat::Text,
            ("🥇", "#ff5c69", KpiSize::Medium),
            3600,
        ),
        seed(
            "ec2_instances",
            "EC2 Instances",
            "Distinct EC2 instances billed this month",
            KpiQueryType::Cur,
            format!(
                "SELECT COUNT(DISTINCT \"lineitem/resourceid\") AS instance_count FROM {{table}} WHERE \"lineitem/productcode\" = 'AmazonEC2' AND \"lineitem/usagetype\" LIKE '%BoxUsage%' AND {CURRENT_MONTH}"
            ),
            KpiFormat::Number,
            ("🖥️", "#33ccff", KpiSize::Small),
            1800,
        ),
        seed(
            "ri_coverage",
            "RI Coverage",
            "Reserved capacity coverage percentage",
            KpiQueryType::CostExplorer,
            "get_ri_coverage".to_string(),
            KpiFormat::Percentage,
            ("🎯", "#a826b3", KpiSize::Medium),
            3600,
        ),
        seed(
            "cost_anomalies",
            "Cost Anomalies",
            "Number of cost anomalies detected",
            KpiQueryType::CostExplorer,
            "get_anomalies_count".to_string(),
            KpiFormat::Number,
            ("⚠️", "#ff5c69", KpiSize::Small),
            1800,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::{default_kpis, KpiFormat, KpiPatch, KpiQueryType, KpiTrend, NewKpi};

    fn new_kpi(query: &str) -> NewKpi {
        NewKpi {
            id: None,
            name: "S3 Monthly Cost".to_string(),
            description: String::new(),
            query_type: KpiQueryType::Cur,
            query: query.to_string(),
            format: KpiFormat::Currency,
            icon: None,
            color: None,
            size: None,
            refresh_interval_secs: None,
        }
    }

    #[test]
    fn cur_queries_require_table_placeholder() {
        assert!(new_kpi("SELECT 1").validate().is_err());
        assert!(new_kpi("SELECT SUM(x) FROM {table}").validate().is_ok());
    }

    #[test]
    fn new_kpi_fills_dashboard_defaults() {
        let kpi = new_kpi("SELECT 1 FROM {table}").into_kpi();
        assert!(kpi.id.0.starts_with("kpi_"));
        assert_eq!(kpi.refresh_interval_secs, 1800);
        assert!(kpi.last_value.is_none());
    }

    #[test]
    fn recording_values_derives_trend() {
        let mut kpi = new_kpi("SELECT 1 FROM {table}").into_kpi();
        let now = Utc::now();
        kpi.record_value(json!(100.0), now);
        assert_eq!(kpi.trend, None);
        kpi.record_value(json!("120.5"), now);
        assert_eq!(kpi.trend, Some(KpiTrend::Up));
        kpi.record_value(json!(80), now);
        assert_eq!(kpi.trend, Some(KpiTrend::Down));
    }

    #[test]
    fn refresh_due_after_interval() {
        let mut kpi = new_kpi("SELECT 1 FROM {table}").into_kpi();
        let now = Utc::now();
        assert!(kpi.needs_refresh(now));
        kpi.record_value(json!(1), now);
        assert!(!kpi.needs_refresh(now + Duration::seconds(60)));
        assert!(kpi.needs_refresh(now + Duration::seconds(1801)));
    }

    #[test]
    fn patch_rejects_query_without_placeholder() {
        let mut kpi = new_kpi("SELECT 1 FROM {table}").into_kpi();
        let patch = KpiPatch { query: Some("SELECT 2".to_string()), ..KpiPatch::default() };
        assert!(patch.apply(&mut kpi).is_err());
        assert_eq!(kpi.query, "SELECT 1 FROM {table}");
    }

    #[test]
    fn default_cur_kpis_reference_table() {
        for kpi in default_kpis() {
            if kpi.query_type == KpiQueryType::Cur {
                assert!(kpi.query.contains("{table}"), "{} lacks placeholder", kpi.id);
            }
        }
    }
}
