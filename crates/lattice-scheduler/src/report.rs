//! Result aggregation.

use crate::dag::JobDag;
use lattice_core::JobId;
use lattice_core::job::JobStatus;
use lattice_core::run::{JobOutcome, JobReport, RunReport, RunStatus, StatusCounts};
use std::collections::HashMap;

/// Fold final job outcomes into a run report.
///
/// Jobs are listed in topological order. A job without a final outcome is
/// reported Cancelled. The overall status is Failed if any job failed, else
/// Cancelled if any job was cancelled, else Succeeded.
pub fn finalize(dag: &JobDag, outcomes: &HashMap<JobId, JobOutcome>) -> RunReport {
    let mut counts = StatusCounts::default();
    let mut jobs = Vec::with_capacity(dag.len());

    for node in dag.topological_order() {
        let outcome = outcomes.get(node.id());
        let status = match outcome {
            Some(outcome) if outcome.status.is_terminal() => outcome.status,
            _ => JobStatus::Cancelled,
        };

        match status {
            JobStatus::Succeeded => counts.succeeded += 1,
            JobStatus::Failed => counts.failed += 1,
            JobStatus::Skipped => counts.skipped += 1,
            _ => counts.cancelled += 1,
        }

        let failure = outcome.and_then(|o| o.failure.clone());
        jobs.push(JobReport {
            id: node.id().clone(),
            name: node.job.name.clone(),
            rank: node.rank,
            status,
            failed_step: failure.as_ref().and_then(|f| f.step()).map(str::to_string),
            failure,
            log: outcome.and_then(|o| o.log.clone()),
            artifacts: outcome.map(|o| o.artifacts.clone()).unwrap_or_default(),
            duration_ms: outcome.map_or(0, |o| o.duration_ms),
        });
    }

    let status = if counts.failed > 0 {
        RunStatus::Failed
    } else if counts.cancelled > 0 {
        RunStatus::Cancelled
    } else {
        RunStatus::Succeeded
    };

    let started_at = outcomes.values().filter_map(|o| o.started_at).min();
    let finished_at = outcomes.values().filter_map(|o| o.finished_at).max();
    let duration_ms = match (started_at, finished_at) {
        (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
        _ => 0,
    };

    RunReport {
        status,
        jobs,
        counts,
        started_at,
        finished_at,
        duration_ms,
    }
}
