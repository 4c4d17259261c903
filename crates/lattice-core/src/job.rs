//! Expanded job instances and their runtime status.

use crate::ids::JobId;
use crate::pipeline::{MatrixValue, ResourceRequirements, Step, render_value};
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Axis name to value for one matrix combination, in axis order.
pub type MatrixCoordinate = IndexMap<String, MatrixValue>;

/// One concrete unit of work produced by matrix expansion.
#[derive(Debug, Clone)]
pub struct JobInstance {
    pub id: JobId,
    /// Logical job name from the pipeline file.
    pub name: String,
    /// Position in expansion order, used to break scheduling ties.
    pub index: usize,
    pub matrix: MatrixCoordinate,
    pub steps: Vec<Step>,
    /// Logical job names or instance ids this job waits for.
    pub needs: Vec<String>,
    pub env: IndexMap<String, String>,
    pub resources: ResourceRequirements,
    /// Group named in the pipeline file. `None` puts the job in its own
    /// implicit group, which is unconstrained.
    pub concurrency_group: Option<String>,
    pub timeout: Option<Duration>,
}

impl JobInstance {
    /// Matrix values rendered as strings, in axis order.
    pub fn matrix_strings(&self) -> Vec<(String, String)> {
        self.matrix
            .iter()
            .map(|(k, v)| (k.clone(), render_value(v)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped | JobStatus::Cancelled
        )
    }

    /// Terminal states that block dependents (they end Skipped).
    pub fn blocks_dependents(&self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::Skipped | JobStatus::Cancelled
        )
    }

    /// Transitions move strictly forward.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Pending, Cancelled)
                | (Ready, Running)
                | (Ready, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Ready => "ready",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_only() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Ready));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Skipped));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Succeeded.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Skipped.can_transition_to(JobStatus::Ready));
        assert!(!JobStatus::Ready.can_transition_to(JobStatus::Skipped));
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Skipped.is_terminal());
        assert!(!JobStatus::Ready.is_terminal());
        assert!(!JobStatus::Succeeded.blocks_dependents());
        assert!(JobStatus::Cancelled.blocks_dependents());
    }
}
