//! Rendering of run reports and execution plans.

use console::style;
use lattice_core::job::JobStatus;
use lattice_core::run::{RunReport, RunStatus};
use lattice_scheduler::JobDag;
use std::fmt::Write;

fn status_icon(status: JobStatus) -> String {
    match status {
        JobStatus::Succeeded => style("✓").green().to_string(),
        JobStatus::Failed => style("✗").red().to_string(),
        JobStatus::Skipped => style("⏭").dim().to_string(),
        JobStatus::Cancelled => style("⊘").yellow().to_string(),
        _ => style("…").dim().to_string(),
    }
}

fn format_duration(ms: u64) -> String {
    if ms < 1_000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1_000)
    }
}

/// Human-readable report, one line per job in execution order.
pub fn render_table(report: &RunReport) -> String {
    let width = report
        .jobs
        .iter()
        .map(|j| j.id.as_str().chars().count())
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    for job in &report.jobs {
        let _ = write!(
            out,
            "{} {:<width$}  {:<9}  {:>7}",
            status_icon(job.status),
            job.id.as_str(),
            job.status.to_string(),
            format_duration(job.duration_ms),
            width = width
        );
        if let Some(failure) = &job.failure {
            let _ = write!(out, "  {}", style(failure).dim());
        }
        if let Some(log) = &job.log
            && job.status == JobStatus::Failed
        {
            let _ = write!(out, "  (log: {})", log);
        }
        out.push('\n');
    }

    let counts = &report.counts;
    let headline = match report.status {
        RunStatus::Succeeded => style("✓ Run succeeded").green().bold(),
        RunStatus::Failed => style("✗ Run failed").red().bold(),
        RunStatus::Cancelled => style("⊘ Run cancelled").yellow().bold(),
    };
    let _ = writeln!(
        out,
        "\n{}: {} succeeded, {} failed, {} skipped, {} cancelled in {}",
        headline,
        counts.succeeded,
        counts.failed,
        counts.skipped,
        counts.cancelled,
        format_duration(report.duration_ms)
    );
    out
}

pub fn render_json(report: &RunReport) -> serde_json::Result<String> {
    serde_json::to_string_pretty(report)
}

/// The dry-run plan: jobs by rank with their dependencies and groups.
pub fn render_plan(dag: &JobDag) -> String {
    let mut out = String::new();
    let mut current_rank = None;
    for node in dag.topological_order() {
        if current_rank != Some(node.rank) {
            let _ = writeln!(out, "{}", style(format!("rank {}", node.rank)).cyan().bold());
            current_rank = Some(node.rank);
        }
        let _ = write!(out, "  {}", node.id());
        let predecessors = dag.predecessors(node.id());
        let needs: Vec<&str> = predecessors.iter().map(|n| n.id().as_str()).collect();
        if !needs.is_empty() {
            let _ = write!(out, "  {} {}", style("needs").dim(), needs.join(", "));
        }
        if let Some(group) = &node.job.concurrency_group {
            let _ = write!(out, "  {} {}", style("group").dim(), group);
        }
        out.push('\n');
    }
    out
}
