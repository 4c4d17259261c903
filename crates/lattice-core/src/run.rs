//! Job outcomes and run reports.

use crate::artifact::ArtifactRef;
use crate::ids::JobId;
use crate::job::JobStatus;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a job's captured log in the log store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct LogRef(String);

impl LogRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a job did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureKind {
    /// The user's step exited non-zero.
    StepFailure { step: String, exit_code: i32 },
    /// The executor could not run the step, even after retries.
    Infrastructure {
        step: String,
        message: String,
        attempts: u32,
    },
    /// A download found nothing to fetch.
    ArtifactNotFound { step: String, pattern: String },
    /// The step was rejected before it ran, or a built-in action could
    /// not complete.
    ActionFailed { step: String, message: String },
    /// Cancelled by fail-fast, a timeout or an external request.
    Cancelled { reason: CancelReason },
}

impl FailureKind {
    /// The step that caused the failure, when one did.
    pub fn step(&self) -> Option<&str> {
        match self {
            FailureKind::StepFailure { step, .. }
            | FailureKind::Infrastructure { step, .. }
            | FailureKind::ArtifactNotFound { step, .. }
            | FailureKind::ActionFailed { step, .. } => Some(step),
            FailureKind::Cancelled { .. } => None,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::StepFailure { step, exit_code } => {
                write!(f, "step '{}' exited with code {}", step, exit_code)
            }
            FailureKind::Infrastructure {
                step,
                message,
                attempts,
            } => write!(
                f,
                "step '{}' could not run after {} attempts: {}",
                step, attempts, message
            ),
            FailureKind::ArtifactNotFound { step, pattern } => {
                write!(f, "step '{}' found no artifact matching '{}'", step, pattern)
            }
            FailureKind::ActionFailed { step, message } => {
                write!(f, "step '{}' failed: {}", step, message)
            }
            FailureKind::Cancelled { reason } => write!(f, "cancelled ({})", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    FailFast,
    Timeout,
    UserRequested,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CancelReason::FailFast => "fail-fast",
            CancelReason::Timeout => "timeout",
            CancelReason::UserRequested => "user requested",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// Failed but flagged continue-on-error.
    FailedIgnored,
    NotRun,
}

/// What happened to one step.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Result of running one job, as reported by the execution runner.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub failure: Option<FailureKind>,
    pub steps: Vec<StepRecord>,
    pub artifacts: Vec<ArtifactRef>,
    pub log: Option<LogRef>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl JobOutcome {
    /// Outcome for a job that never started.
    pub fn not_started(status: JobStatus, failure: Option<FailureKind>) -> Self {
        Self {
            status,
            failure,
            steps: Vec::new(),
            artifacts: Vec::new(),
            log: None,
            started_at: None,
            finished_at: None,
            duration_ms: 0,
        }
    }

    /// Outcome for a job whose run was cut short by cancellation.
    pub fn cancelled(reason: CancelReason, started_at: DateTime<Utc>, log: Option<LogRef>) -> Self {
        let finished_at = Utc::now();
        Self {
            status: JobStatus::Cancelled,
            failure: Some(FailureKind::Cancelled { reason }),
            steps: Vec::new(),
            artifacts: Vec::new(),
            log,
            started_at: Some(started_at),
            finished_at: Some(finished_at),
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Succeeded => 0,
            RunStatus::Failed => 1,
            RunStatus::Cancelled => 2,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobReport {
    pub id: JobId,
    pub name: String,
    pub rank: usize,
    pub status: JobStatus,
    pub failed_step: Option<String>,
    pub failure: Option<FailureKind>,
    pub log: Option<LogRef>,
    pub artifacts: Vec<ArtifactRef>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StatusCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

/// Final, immutable summary of a run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunReport {
    pub status: RunStatus,
    pub jobs: Vec<JobReport>,
    pub counts: StatusCounts,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn job(&self, id: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.id.as_str() == id)
    }
}
