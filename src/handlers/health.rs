//! Health check endpoint handler.
//!
//! Renders one row per collector metric with its status, so a stale source
//! is visible at a glance.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use herakles_res_monitor::{CollectorKind, MetricStatus};
use std::fmt::Write as FmtWrite;
use tracing::{debug, instrument};

use crate::state::{HealthStats, SharedState};

/// Footer text for human-readable HTTP endpoints.
pub const FOOTER_TEXT: &str = "Project: https://github.com/herakles-io/herakles-res-monitor";

/// One row of the health table.
pub struct MetricRow {
    pub collector: CollectorKind,
    pub key: &'static str,
    pub running: bool,
    pub status: MetricStatus,
}

/// Handler for the /health endpoint.
#[instrument(skip(state))]
pub async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /health request");
    state.health_stats.record_http_request();

    let collectors = &state.collectors;
    let mut rows = Vec::new();
    for kind in CollectorKind::ALL {
        let running = collectors.is_running(kind);
        for key in collectors.metric_keys(kind) {
            rows.push(MetricRow {
                collector: kind,
                key: *key,
                running,
                status: collectors.status(kind, key),
            });
        }
    }

    let (status, message) = overall_status(&rows);
    let table = render_table(&rows, &state.health_stats);
    debug!("Health check: {} - {}", status, message);
    (
        status,
        [("Content-Type", "text/plain; charset=utf-8")],
        format!("{message}\n\n{table}\n{FOOTER_TEXT}"),
    )
}

/// Unhealthy when a running collector has a metric that keeps failing.
pub fn overall_status(rows: &[MetricRow]) -> (StatusCode, &'static str) {
    let failing = rows
        .iter()
        .any(|r| r.running && matches!(r.status, MetricStatus::Stale { failures } if failures >= 3));
    if failing {
        (StatusCode::SERVICE_UNAVAILABLE, "Degraded - metric refreshes failing")
    } else if rows.iter().any(|r| r.running) {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::OK, "OK - no collector running")
    }
}

fn render_table(rows: &[MetricRow], stats: &HealthStats) -> String {
    let mut out = String::new();
    writeln!(out, "COLLECTORS").ok();
    writeln!(out, "==========").ok();
    writeln!(out).ok();
    writeln!(
        out,
        "{:10} | {:20} | {:8} | {:>14}",
        "Collector", "Metric", "Running", "Status"
    )
    .ok();
    writeln!(out, "{}", "-".repeat(62)).ok();

    for row in rows {
        let status = match row.status {
            MetricStatus::Pending => "pending".to_string(),
            MetricStatus::Ready => "ready".to_string(),
            MetricStatus::Stale { failures } => format!("stale ({})", failures),
        };
        writeln!(
            out,
            "{:10} | {:20} | {:8} | {:>14}",
            row.collector.as_str(),
            row.key,
            if row.running { "yes" } else { "no" },
            status
        )
        .ok();
    }

    writeln!(out).ok();
    for kind in CollectorKind::ALL {
        writeln!(
            out,
            "{:10} notifications: {}",
            kind.as_str(),
            stats.notifications(kind)
        )
        .ok();
    }
    writeln!(out, "HTTP requests: {}", stats.http_requests()).ok();
    writeln!(out, "Uptime: {}s", stats.uptime_seconds()).ok();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(running: bool, status: MetricStatus) -> MetricRow {
        MetricRow {
            collector: CollectorKind::Processor,
            key: "cpuUsage",
            running,
            status,
        }
    }

    #[test]
    fn test_repeated_failures_degrade_health() {
        let rows = [row(true, MetricStatus::Ready), row(true, MetricStatus::Stale { failures: 3 })];
        assert_eq!(overall_status(&rows).0, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_stopped_collector_failures_are_ignored() {
        let rows = [row(false, MetricStatus::Stale { failures: 10 })];
        assert_eq!(overall_status(&rows).0, StatusCode::OK);
    }

    #[test]
    fn test_table_lists_every_row() {
        let rows = [row(true, MetricStatus::Pending), row(true, MetricStatus::Stale { failures: 1 })];
        let table = render_table(&rows, &HealthStats::new());
        assert!(table.contains("pending"));
        assert!(table.contains("stale (1)"));
    }
}
