//! Execution runner: runs the steps of one job instance.

use crate::actions::{ActionContext, ActionInputs, ActionRegistry};
use crate::logs::{LogStore, OutputStream};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::Utc;
use lattice_artifacts::{ArtifactBroker, sanitize_key};
use lattice_core::artifact::ArtifactRef;
use lattice_core::interpolation::InterpolationContext;
use lattice_core::job::{JobInstance, JobStatus};
use lattice_core::pipeline::{ActionStep, ShellStep, Step, StepKind, render_value};
use lattice_core::ports::{CancelSignal, ExecRequest, Executor, JobRunner};
use lattice_core::run::{
    CancelReason, FailureKind, JobOutcome, LogRef, StepRecord, StepStatus,
};
use lattice_core::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for step execution.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Each job gets `<workspace_root>/<job id>` as its working directory.
    pub workspace_root: PathBuf,
    /// Shell for `run:` steps that do not name one.
    pub shell: String,
    pub retry: RetryPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("lattice"),
            shell: "sh".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

/// How one step ended.
enum StepOutcome {
    Succeeded {
        exit_code: Option<i32>,
        attempts: u32,
        artifacts: Vec<ArtifactRef>,
    },
    Failed {
        failure: FailureKind,
        exit_code: Option<i32>,
        attempts: u32,
    },
}

/// Runs job instances step by step against an [`Executor`].
pub struct ExecutionRunner {
    executor: Arc<dyn Executor>,
    broker: Arc<ArtifactBroker>,
    actions: ActionRegistry,
    logs: LogStore,
    config: RunnerConfig,
}

impl ExecutionRunner {
    pub fn new(executor: Arc<dyn Executor>, broker: Arc<ArtifactBroker>, config: RunnerConfig) -> Self {
        Self {
            executor,
            broker,
            actions: ActionRegistry::with_builtins(),
            logs: LogStore::new(),
            config,
        }
    }

    pub fn with_logs(mut self, logs: LogStore) -> Self {
        self.logs = logs;
        self
    }

    pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = actions;
        self
    }

    pub fn logs(&self) -> &LogStore {
        &self.logs
    }

    pub fn broker(&self) -> &Arc<ArtifactBroker> {
        &self.broker
    }

    /// Working directory of a job.
    pub fn workspace_for(&self, job: &JobInstance) -> PathBuf {
        self.config.workspace_root.join(sanitize_key(job.id.as_str()))
    }

    /// Environment every step of the job sees, before step overrides.
    fn job_env(&self, job: &JobInstance, workspace: &Path) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = job
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (axis, value) in job.matrix_strings() {
            env.insert(format!("MATRIX_{}", env_key(&axis)), value);
        }
        env.insert("CI".to_string(), "true".to_string());
        env.insert("LATTICE_JOB_ID".to_string(), job.id.to_string());
        env.insert("LATTICE_JOB_NAME".to_string(), job.name.clone());
        env.insert(
            "LATTICE_WORKSPACE".to_string(),
            workspace.display().to_string(),
        );
        env
    }

    fn interpolation_context(
        &self,
        job: &JobInstance,
        env: &HashMap<String, String>,
    ) -> InterpolationContext {
        let mut ctx = InterpolationContext::new();
        ctx.env = env.clone();
        ctx.matrix = job.matrix_strings().into_iter().collect();
        ctx.job.insert("id".to_string(), job.id.to_string());
        ctx.job.insert("name".to_string(), job.name.clone());
        ctx
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        job: &JobInstance,
        step: &Step,
        label: &str,
        env: &HashMap<String, String>,
        ctx: &InterpolationContext,
        workspace: &Path,
        log: &LogRef,
    ) -> StepOutcome {
        match &step.kind {
            StepKind::Shell(shell) => self.run_shell(shell, label, env, ctx, workspace, log).await,
            StepKind::Action(action) => self.run_action(job, action, label, ctx, workspace, log).await,
        }
    }

    async fn run_shell(
        &self,
        shell: &ShellStep,
        label: &str,
        env: &HashMap<String, String>,
        ctx: &InterpolationContext,
        workspace: &Path,
        log: &LogRef,
    ) -> StepOutcome {
        let mut step_env = env.clone();
        for (key, value) in &shell.env {
            step_env.insert(key.clone(), ctx.interpolate(value));
        }

        let working_directory = match &shell.working_directory {
            Some(dir) => workspace.join(ctx.interpolate(dir)),
            None => workspace.to_path_buf(),
        };
        // A missing directory is a mistake in the step, not a flaky executor.
        if !tokio::fs::metadata(&working_directory)
            .await
            .is_ok_and(|meta| meta.is_dir())
        {
            let message = format!(
                "working directory {} does not exist",
                working_directory.display()
            );
            self.logs
                .append(log, OutputStream::System, &format!("error: {}", message))
                .await;
            return StepOutcome::Failed {
                failure: FailureKind::ActionFailed {
                    step: label.to_string(),
                    message,
                },
                exit_code: None,
                attempts: 1,
            };
        }

        let request = ExecRequest {
            command: ctx.interpolate(&shell.run),
            env: step_env,
            working_directory,
            shell: shell
                .shell
                .clone()
                .unwrap_or_else(|| self.config.shell.clone()),
        };

        let executor = &self.executor;
        let retried = self
            .config
            .retry
            .run(|attempt| {
                if attempt > 1 {
                    debug!(step = %label, attempt, "Retrying step");
                }
                executor.execute(&request)
            })
            .await;

        match retried.result {
            Ok(output) => {
                self.logs.append(log, OutputStream::Stdout, &output.stdout).await;
                self.logs.append(log, OutputStream::Stderr, &output.stderr).await;
                if output.success() {
                    StepOutcome::Succeeded {
                        exit_code: Some(output.exit_code),
                        attempts: retried.attempts,
                        artifacts: Vec::new(),
                    }
                } else {
                    StepOutcome::Failed {
                        failure: FailureKind::StepFailure {
                            step: label.to_string(),
                            exit_code: output.exit_code,
                        },
                        exit_code: Some(output.exit_code),
                        attempts: retried.attempts,
                    }
                }
            }
            Err(e) => {
                self.logs
                    .append(log, OutputStream::System, &format!("error: {}", e))
                    .await;
                StepOutcome::Failed {
                    failure: FailureKind::Infrastructure {
                        step: label.to_string(),
                        message: e.to_string(),
                        attempts: retried.attempts,
                    },
                    exit_code: None,
                    attempts: retried.attempts,
                }
            }
        }
    }

    async fn run_action(
        &self,
        job: &JobInstance,
        step: &ActionStep,
        label: &str,
        ctx: &InterpolationContext,
        workspace: &Path,
        log: &LogRef,
    ) -> StepOutcome {
        let action = match self.actions.get(&step.uses) {
            Ok(action) => action,
            Err(e) => return action_failure(label, e, 1),
        };

        let inputs: ActionInputs = step
            .inputs
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => ctx.interpolate(s),
                    other => render_value(other),
                };
                (key.clone(), value)
            })
            .collect();

        let action_ctx = ActionContext {
            job,
            workspace,
            broker: &self.broker,
        };
        let retried = self
            .config
            .retry
            .run(|_| action.run(&action_ctx, &inputs))
            .await;

        match retried.result {
            Ok(output) => {
                self.logs.append(log, OutputStream::System, &output.summary).await;
                StepOutcome::Succeeded {
                    exit_code: None,
                    attempts: retried.attempts,
                    artifacts: output.artifacts,
                }
            }
            Err(e) => {
                self.logs
                    .append(log, OutputStream::System, &format!("error: {}", e))
                    .await;
                action_failure(label, e, retried.attempts)
            }
        }
    }
}

fn action_failure(label: &str, error: Error, attempts: u32) -> StepOutcome {
    let failure = match error {
        Error::ArtifactNotFound(pattern) => FailureKind::ArtifactNotFound {
            step: label.to_string(),
            pattern,
        },
        Error::Infrastructure(message) => FailureKind::Infrastructure {
            step: label.to_string(),
            message,
            attempts,
        },
        other => FailureKind::ActionFailed {
            step: label.to_string(),
            message: other.to_string(),
        },
    };
    StepOutcome::Failed {
        failure,
        exit_code: None,
        attempts,
    }
}

/// `python-version` -> `PYTHON_VERSION`.
fn env_key(axis: &str) -> String {
    axis.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

fn not_run(label: String) -> StepRecord {
    StepRecord {
        name: label,
        status: StepStatus::NotRun,
        exit_code: None,
        attempts: 0,
        duration_ms: 0,
    }
}

#[async_trait]
impl JobRunner for ExecutionRunner {
    async fn run(&self, job: &JobInstance, mut cancel: CancelSignal) -> JobOutcome {
        let started_at = Utc::now();
        let start = Instant::now();
        let log = self.logs.open(&job.id).await;
        let workspace = self.workspace_for(job);

        info!(job = %job.id, steps = job.steps.len(), workspace = %workspace.display(), "Running job");

        let mut records = Vec::with_capacity(job.steps.len());
        let mut artifacts = Vec::new();
        let mut failure: Option<FailureKind> = None;
        let mut cancelled = false;

        if let Err(e) = tokio::fs::create_dir_all(&workspace).await {
            failure = Some(FailureKind::Infrastructure {
                step: "setup".to_string(),
                message: format!("cannot create workspace {}: {}", workspace.display(), e),
                attempts: 1,
            });
        }

        let env = self.job_env(job, &workspace);
        let ctx = self.interpolation_context(job, &env);

        for (index, step) in job.steps.iter().enumerate() {
            let label = step.label();
            if failure.is_some() || cancelled {
                records.push(not_run(label));
                continue;
            }

            self.logs
                .append(&log, OutputStream::System, &format!("Step {}: {}", index + 1, label))
                .await;
            let step_start = Instant::now();

            let outcome = tokio::select! {
                outcome = self.run_step(job, step, &label, &env, &ctx, &workspace, &log) => Some(outcome),
                _ = cancel.cancelled() => None,
            };
            let Some(outcome) = outcome else {
                warn!(job = %job.id, step = %label, "Step interrupted by cancellation");
                self.logs.append(&log, OutputStream::System, "cancelled").await;
                cancelled = true;
                records.push(not_run(label));
                continue;
            };
            let duration_ms = step_start.elapsed().as_millis() as u64;

            match outcome {
                StepOutcome::Succeeded {
                    exit_code,
                    attempts,
                    artifacts: published,
                } => {
                    debug!(job = %job.id, step = %label, duration_ms, "Step succeeded");
                    artifacts.extend(published);
                    records.push(StepRecord {
                        name: label,
                        status: StepStatus::Succeeded,
                        exit_code,
                        attempts,
                        duration_ms,
                    });
                }
                StepOutcome::Failed {
                    failure: step_failure,
                    exit_code,
                    attempts,
                } => {
                    let status = if step.continue_on_error {
                        warn!(job = %job.id, step = %label, failure = %step_failure, "Step failed, continuing");
                        StepStatus::FailedIgnored
                    } else {
                        warn!(job = %job.id, step = %label, failure = %step_failure, "Step failed");
                        failure = Some(step_failure);
                        StepStatus::Failed
                    };
                    records.push(StepRecord {
                        name: label,
                        status,
                        exit_code,
                        attempts,
                        duration_ms,
                    });
                }
            }
        }

        let finished_at = Utc::now();
        let duration_ms = start.elapsed().as_millis() as u64;
        let status = if cancelled {
            JobStatus::Cancelled
        } else if failure.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Succeeded
        };
        if cancelled {
            failure = Some(FailureKind::Cancelled {
                reason: CancelReason::UserRequested,
            });
        }

        info!(job = %job.id, %status, duration_ms, "Job finished");

        JobOutcome {
            status,
            failure,
            steps: records,
            artifacts,
            log: Some(log),
            started_at: Some(started_at),
            finished_at: Some(finished_at),
            duration_ms,
        }
    }
}
