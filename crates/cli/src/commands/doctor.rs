use chrono::Utc;
use serde::Serialize;

use fleetrun_core::config::{AppConfig, LoadOptions};
use fleetrun_db::repositories::{QueueRepository, SqlQueueRepository};
use fleetrun_db::connect_with_settings;

use crate::commands::block_on;

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
            checks.push(check_upstream_endpoints(&config));
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["upstream_endpoints", "database_connectivity", "schema", "queue"] {
                checks.push(skipped(name));
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn skipped(name: &'static str) -> DoctorCheck {
    DoctorCheck {
        name,
        status: CheckStatus::Skipped,
        details: "skipped because configuration did not load".to_string(),
    }
}

fn check_upstream_endpoints(config: &AppConfig) -> DoctorCheck {
    // URL shape is enforced by the config contract; surface the endpoints so
    // an operator can eyeball a typo without digging through files.
    DoctorCheck {
        name: "upstream_endpoints",
        status: CheckStatus::Pass,
        details: format!(
            "asset={} automation={} secrets={} rbac={}",
            config.upstream.asset_base_url,
            config.upstream.automation_base_url,
            config.upstream.secrets_base_url,
            config.upstream.rbac_base_url,
        ),
    }
}

fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let result = block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| format!("failed to connect to database: {error}"))?;

        let schema_ready: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type = 'table' AND name IN ('execution', 'queue_item', 'timeout_policy')",
        )
        .fetch_one(&pool)
        .await
        .map_err(|error| format!("schema probe failed: {error}"))?;

        let queue_result = if schema_ready == 3 {
            let queue = SqlQueueRepository::new(pool.clone());
            Some(
                queue
                    .depth(Utc::now())
                    .await
                    .map_err(|error| format!("queue probe failed: {error}")),
            )
        } else {
            None
        };

        pool.close().await;
        Ok::<(i64, Option<Result<i64, String>>), String>((schema_ready, queue_result))
    });

    let mut checks = Vec::new();
    match result {
        Ok(Ok((schema_ready, queue_result))) => {
            checks.push(DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Pass,
                details: "database reachable".to_string(),
            });

            if schema_ready == 3 {
                checks.push(DoctorCheck {
                    name: "schema",
                    status: CheckStatus::Pass,
                    details: "engine tables present".to_string(),
                });
            } else {
                checks.push(DoctorCheck {
                    name: "schema",
                    status: CheckStatus::Fail,
                    details: "engine tables missing; run `fleetrun migrate`".to_string(),
                });
            }

            match queue_result {
                Some(Ok(depth)) => checks.push(DoctorCheck {
                    name: "queue",
                    status: CheckStatus::Pass,
                    details: format!("queue reachable, depth {depth}"),
                }),
                Some(Err(details)) => checks.push(DoctorCheck {
                    name: "queue",
                    status: CheckStatus::Fail,
                    details,
                }),
                None => checks.push(DoctorCheck {
                    name: "queue",
                    status: CheckStatus::Skipped,
                    details: "skipped because the schema is not ready".to_string(),
                }),
            }
        }
        Ok(Err(details)) => {
            checks.push(DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details,
            });
            checks.push(DoctorCheck {
                name: "schema",
                status: CheckStatus::Skipped,
                details: "skipped because the database is unreachable".to_string(),
            });
            checks.push(DoctorCheck {
                name: "queue",
                status: CheckStatus::Skipped,
                details: "skipped because the database is unreachable".to_string(),
            });
        }
        Err(details) => {
            checks.push(DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details,
            });
        }
    }
    checks
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::with_capacity(report.checks.len() + 2);
    lines.push(report.summary.clone());
    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("  [{marker}] {}: {}", check.name, check.details));
    }
    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::{render_human, CheckStatus, DoctorCheck, DoctorReport};

    #[test]
    fn human_rendering_marks_failures() {
        let report = DoctorReport {
            overall_status: CheckStatus::Fail,
            summary: "doctor: one or more readiness checks failed".to_string(),
            checks: vec![
                DoctorCheck {
                    name: "config_validation",
                    status: CheckStatus::Pass,
                    details: "configuration loaded and validated".to_string(),
                },
                DoctorCheck {
                    name: "schema",
                    status: CheckStatus::Fail,
                    details: "engine tables missing; run `fleetrun migrate`".to_string(),
                },
            ],
        };

        let rendered = render_human(&report);
        assert!(rendered.contains("[ok] config_validation"));
        assert!(rendered.contains("[FAIL] schema"));
    }
}
