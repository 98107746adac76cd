use tracing::{info, warn};

use crate::circuit_breaker::{BreakerSnapshot, CircuitState};
use crate::dispatcher::ReviewResult;
use crate::error::{Error, Result};
use crate::orchestrator::RunReport;

/// Render one section per agent: status line, then merged content or error.
pub fn render_results_markdown(results: &[ReviewResult]) -> String {
    results
        .iter()
        .map(render_result)
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_result(result: &ReviewResult) -> String {
    let status = if result.success { "ok" } else { "failed" };
    let attempts = match result.attempts {
        1 => "1 attempt".to_string(),
        n => format!("{n} attempts"),
    };
    let mut out = format!("## {}\n\n_Status: {status} ({attempts})_\n\n", result.agent_id);

    if result.success {
        out.push_str(result.content.as_deref().unwrap_or("").trim_end());
    } else {
        out.push_str(&format!(
            "**Error:** {}",
            result.error_message.as_deref().unwrap_or("unknown error")
        ));
    }
    out.push('\n');
    out
}

pub fn render_markdown(report: &RunReport) -> String {
    let mut out = format!("# Review of `{}`\n\n", report.target);
    out.push_str(&render_results_markdown(&report.results));

    if let Some(ref summary) = report.summary {
        out.push_str("\n## Summary\n\n");
        match (summary.success, summary.content.as_deref()) {
            (true, Some(content)) => out.push_str(content.trim_end()),
            _ => out.push_str(&format!(
                "_Summary unavailable: {}_",
                summary.error_message.as_deref().unwrap_or("unknown error")
            )),
        }
        out.push('\n');
    }

    out
}

pub fn render_json(report: &RunReport) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(|e| Error::Report(e.to_string()))
}

/// Log the final state of every breaker used during the run.
pub fn log_breakers(snapshots: &[BreakerSnapshot]) {
    for snapshot in snapshots {
        if snapshot.state == CircuitState::Closed {
            info!(
                operation = %snapshot.operation,
                state = %snapshot.state,
                consecutive_failures = snapshot.consecutive_failures,
                "circuit breaker final state"
            );
        } else {
            warn!(
                operation = %snapshot.operation,
                state = %snapshot.state,
                consecutive_failures = snapshot.consecutive_failures,
                half_open_failures = snapshot.consecutive_half_open_failures,
                open_duration_ms = snapshot.current_open_duration_ms,
                "circuit breaker final state"
            );
        }
    }
}
