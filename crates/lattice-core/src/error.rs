//! Error types for Lattice CI.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Structural errors, raised before any job starts
    #[error("Invalid pipeline definition: {0}")]
    InvalidSpec(String),

    #[error("Invalid matrix for job {job}: {reason}")]
    InvalidMatrix { job: String, reason: String },

    #[error("Cyclic dependency between jobs: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Job {job} needs unknown job {dependency}")]
    UnknownDependency { job: String, dependency: String },

    #[error("Duplicate job id: {0}")]
    DuplicateJob(String),

    // Execution errors
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Step {step} failed with exit code {exit_code}")]
    StepFailed { step: String, exit_code: i32 },

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid input for action {action}: {reason}")]
    InvalidActionInput { action: String, reason: String },

    // Artifact errors
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    // Scheduler errors
    #[error("Illegal status transition for {job}: {from} -> {to}")]
    IllegalTransition {
        job: String,
        from: String,
        to: String,
    },

    // Generic
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors that abort the whole run before scheduling starts.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::InvalidSpec(_)
                | Error::InvalidMatrix { .. }
                | Error::CyclicDependency { .. }
                | Error::UnknownDependency { .. }
                | Error::DuplicateJob(_)
        )
    }

    /// Errors the execution runner retries with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Infrastructure(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::InvalidSpec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::DuplicateJob("a".into()).is_structural());
        assert!(
            Error::CyclicDependency {
                cycle: vec!["a".into(), "b".into()]
            }
            .is_structural()
        );
        assert!(!Error::Infrastructure("down".into()).is_structural());
        assert!(Error::Infrastructure("down".into()).is_transient());
        assert!(!Error::ArtifactNotFound("wheel".into()).is_transient());
    }

    #[test]
    fn test_cycle_message_names_members() {
        let err = Error::CyclicDependency {
            cycle: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency between jobs: a -> b");
    }
}
