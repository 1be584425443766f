use std::fs;
use std::process::{Command, Stdio};

use finops_agent::collaborators::TableQuery;
use finops_core::config::{AppConfig, CloudConfig, LoadOptions};
use finops_db::connection::ping;
use finops_db::connect_with_settings;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

const DEPENDENT_CHECKS: &[&str] = &[
    "llm_credentials",
    "database_connectivity",
    "sandbox_workspace",
    "python_interpreter",
    "node_interpreter",
    "billing_report_table",
];

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_llm_credentials(&config));
            checks.push(check_database_connectivity(&config));
            checks.push(check_sandbox_workspace(&config));
            checks.push(check_interpreter("python_interpreter", &config.sandbox.python_bin, true));
            checks.push(check_interpreter("node_interpreter", &config.sandbox.node_bin, false));
            checks.push(check_billing_report_table(&config.cloud));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            checks.extend(DEPENDENT_CHECKS.iter().map(|name| DoctorCheck {
                name: *name,
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            }));
        }
    }

    // Skipped optional checks do not fail the report; skips caused by a
    // broken config are accompanied by a failed config check anyway.
    let all_pass = checks.iter().all(|check| check.status != CheckStatus::Fail);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

/// Optional: without a report table, query_cost_data has nothing to run against.
fn check_billing_report_table(cloud: &CloudConfig) -> DoctorCheck {
    let Some(table) = cloud.qualified_cur_table() else {
        return DoctorCheck {
            name: "billing_report_table",
            status: CheckStatus::Skipped,
            details: "cloud.cur_table is unset; report queries are unavailable".to_string(),
        };
    };
    match TableQuery::new("SELECT COUNT(*) FROM {table}") {
        Ok(sample) => DoctorCheck {
            name: "billing_report_table",
            status: CheckStatus::Pass,
            details: format!("report queries render as `{}`", sample.render(&table)),
        },
        Err(error) => DoctorCheck {
            name: "billing_report_table",
            status: CheckStatus::Fail,
            details: error.to_string(),
        },
    }
}

fn check_llm_credentials(config: &AppConfig) -> DoctorCheck {
    if config.llm.api_key.is_some() {
        DoctorCheck {
            name: "llm_credentials",
            status: CheckStatus::Pass,
            details: format!("api key present for model `{}`", config.llm.model),
        }
    } else {
        DoctorCheck {
            name: "llm_credentials",
            status: CheckStatus::Fail,
            details: "set FINOPS_LLM_API_KEY or ANTHROPIC_API_KEY to enable chat".to_string(),
        }
    }
}

fn check_database_connectivity(config: &AppConfig) -> DoctorCheck {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| format!("failed to connect to database: {error}"))?;

        let pinged = ping(&pool)
            .await
            .map_err(|error| format!("database ping failed: {error}"));
        pool.close().await;
        pinged
    });

    match result {
        Ok(()) => DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", config.database.url),
        },
        Err(error) => {
            DoctorCheck { name: "database_connectivity", status: CheckStatus::Fail, details: error }
        }
    }
}

fn check_sandbox_workspace(config: &AppConfig) -> DoctorCheck {
    let root = &config.sandbox.workspace_root;
    let marker = root.join(".doctor-write-check");
    let result = fs::create_dir_all(root)
        .and_then(|()| fs::write(&marker, b"ok"))
        .and_then(|()| fs::remove_file(&marker));

    match result {
        Ok(()) => DoctorCheck {
            name: "sandbox_workspace",
            status: CheckStatus::Pass,
            details: format!("`{}` is writable", root.display()),
        },
        Err(error) => DoctorCheck {
            name: "sandbox_workspace",
            status: CheckStatus::Fail,
            details: format!("`{}` is not writable: {error}", root.display()),
        },
    }
}

/// A missing required interpreter fails the report; a missing optional one
/// only disables that language.
fn check_interpreter(name: &'static str, binary: &str, required: bool) -> DoctorCheck {
    let version = Command::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .output();

    match version {
        Ok(output) if output.status.success() => {
            // older interpreters print the version on stderr
            let raw = if output.stdout.is_empty() { output.stderr } else { output.stdout };
            DoctorCheck {
                name,
                status: CheckStatus::Pass,
                details: format!("`{binary}` {}", String::from_utf8_lossy(&raw).trim()),
            }
        }
        Ok(output) => DoctorCheck {
            name,
            status: if required { CheckStatus::Fail } else { CheckStatus::Skipped },
            details: format!("`{binary} --version` exited with {}", output.status),
        },
        Err(error) => DoctorCheck {
            name,
            status: if required { CheckStatus::Fail } else { CheckStatus::Skipped },
            details: format!("`{binary}` is not runnable: {error}"),
        },
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use finops_core::config::AppConfig;

    use super::{
        check_billing_report_table, check_interpreter, render_human, CheckStatus, DoctorCheck,
        DoctorReport,
    };

    #[test]
    fn report_table_check_shows_the_quoted_identifier() {
        let mut cloud = AppConfig::default().cloud;
        cloud.cur_table = None;
        assert_eq!(check_billing_report_table(&cloud).status, CheckStatus::Skipped);

        cloud.cur_database = Some("billing".to_string());
        cloud.cur_table = Some("cur_daily".to_string());
        let check = check_billing_report_table(&cloud);
        assert_eq!(check.status, CheckStatus::Pass);
        assert_eq!(
            check.details,
            "report queries render as `SELECT COUNT(*) FROM \"billing\".\"cur_daily\"`"
        );
    }

    #[test]
    fn missing_optional_interpreter_is_skipped() {
        let check = check_interpreter("node_interpreter", "finops-no-such-binary", false);
        assert_eq!(check.status, CheckStatus::Skipped);

        let check = check_interpreter("python_interpreter", "finops-no-such-binary", true);
        assert_eq!(check.status, CheckStatus::Fail);
        assert!(check.details.contains("not runnable"));
    }

    #[test]
    fn human_report_marks_each_check() {
        let report = DoctorReport {
            overall_status: CheckStatus::Fail,
            summary: "doctor: one or more readiness checks failed".to_string(),
            checks: vec![
                DoctorCheck { name: "a", status: CheckStatus::Pass, details: "fine".into() },
                DoctorCheck { name: "b", status: CheckStatus::Skipped, details: "n/a".into() },
            ],
        };

        let rendered = render_human(&report);
        assert!(rendered.contains("- [ok] a: fine"));
        assert!(rendered.contains("- [skip] b: n/a"));
    }
}
