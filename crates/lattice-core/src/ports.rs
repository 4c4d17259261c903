//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the core domain and the
//! components around it: the external executor that actually runs commands,
//! and the job runner the scheduler dispatches to.

use crate::Result;
use crate::job::JobInstance;
use crate::run::JobOutcome;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::watch;

/// A command to hand to an executor.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub env: HashMap<String, String>,
    pub working_directory: PathBuf,
    /// Shell used to interpret `command`.
    pub shell: String,
}

/// What the executor reports back.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// External executor boundary.
///
/// Implementations return `Error::Infrastructure` when they could not run
/// the command at all; a non-zero exit code is a normal `Ok` result.
/// Dropping the returned future must stop the command.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: &ExecRequest) -> Result<ExecOutput>;
}

/// Cooperative cancellation signal handed to a running job.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Create a signal and the sender that trips it.
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone without cancelling: never fires.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Runs one job instance to completion. The scheduler's only collaborator.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &JobInstance, cancel: CancelSignal) -> JobOutcome;
}
