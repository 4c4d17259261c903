//! Job scheduling: the dispatch loop, per-job status tracking and
//! cooperative cancellation.

use crate::dag::JobDag;
use crate::queue::{QueuedJob, ReadyQueue};
use chrono::Utc;
use lattice_core::job::{JobInstance, JobStatus};
use lattice_core::pipeline::PipelineDefinition;
use lattice_core::ports::{CancelSignal, JobRunner};
use lattice_core::run::{CancelReason, FailureKind, JobOutcome};
use lattice_core::{Error, JobId, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const DEFAULT_MAX_CONCURRENCY: usize = 4;
const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Scheduling knobs for one run.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Size of the worker pool.
    pub max_concurrency: usize,
    pub fail_fast: bool,
    /// Limits for named concurrency groups. Missing groups default to 1.
    pub group_limits: HashMap<String, usize>,
    /// Per logical job caps from matrix `max_parallel`.
    pub job_limits: HashMap<String, usize>,
    /// How long a cancelled job may take to stop before it is aborted.
    pub cancel_grace: Duration,
    /// Logical jobs whose matrix cancels unstarted siblings on failure.
    pub matrix_fail_fast: HashSet<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            fail_fast: false,
            group_limits: HashMap::new(),
            job_limits: HashMap::new(),
            cancel_grace: DEFAULT_CANCEL_GRACE,
            matrix_fail_fast: HashSet::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_pipeline(pipeline: &PipelineDefinition) -> Self {
        let job_limits = pipeline
            .jobs
            .iter()
            .filter_map(|(name, job)| {
                let max = job.matrix.as_ref()?.max_parallel?;
                Some((name.clone(), max.max(1)))
            })
            .collect();
        let matrix_fail_fast = pipeline
            .jobs
            .iter()
            .filter(|(_, job)| job.matrix.as_ref().and_then(|m| m.fail_fast) == Some(true))
            .map(|(name, _)| name.clone())
            .collect();

        Self {
            max_concurrency: pipeline.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY),
            fail_fast: pipeline.fail_fast,
            group_limits: pipeline.concurrency.clone(),
            job_limits,
            matrix_fail_fast,
            ..Default::default()
        }
    }
}

/// Progress notifications emitted while a run executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    JobStarted { id: JobId },
    JobFinished { id: JobId, status: JobStatus },
}

/// Drives a job DAG to completion through a [`JobRunner`].
pub struct Scheduler {
    config: SchedulerConfig,
    runner: Arc<dyn JobRunner>,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn JobRunner>, config: SchedulerConfig) -> Self {
        Self {
            config,
            runner,
            events: None,
        }
    }

    /// Send progress events to the given channel.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run every job of the DAG and return one outcome per job.
    ///
    /// `cancel` requests termination of the whole run: unstarted jobs are
    /// cancelled and running jobs are asked to stop.
    pub async fn run(
        &self,
        dag: &JobDag,
        mut cancel: CancelSignal,
    ) -> Result<HashMap<JobId, JobOutcome>> {
        let mut state = RunState::new(dag, &self.config, self.events.clone());
        let mut join_set: JoinSet<(JobId, JobOutcome)> = JoinSet::new();
        let mut cancel_requested = false;

        info!(
            jobs = dag.len(),
            max_concurrency = self.config.max_concurrency,
            fail_fast = self.config.fail_fast,
            "Starting run"
        );

        loop {
            if !cancel_requested && cancel.is_cancelled() {
                cancel_requested = true;
                state.request_cancel()?;
            }

            if !state.halted {
                state.advance(true)?;
                while join_set.len() < self.config.max_concurrency.max(1) {
                    let Some(queued) = state.queue.dequeue() else {
                        break;
                    };
                    self.dispatch(&mut state, &mut join_set, queued)?;
                }
            }

            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !cancel_requested => {
                    cancel_requested = true;
                    state.request_cancel()?;
                }
                joined = join_set.join_next() => match joined {
                    Some(Ok((id, outcome))) => state.finish(id, outcome)?,
                    Some(Err(e)) => {
                        return Err(Error::Internal(format!("job supervisor failed: {}", e)));
                    }
                    None => {}
                },
            }
        }

        if let Some(stuck) = state.board.first_non_terminal(dag) {
            return Err(Error::Internal(format!(
                "run ended with job {} still {}",
                stuck,
                state.board.get(&stuck)
            )));
        }

        info!(jobs = state.outcomes.len(), "Run finished");
        Ok(state.outcomes)
    }

    fn dispatch(
        &self,
        state: &mut RunState<'_>,
        join_set: &mut JoinSet<(JobId, JobOutcome)>,
        queued: QueuedJob,
    ) -> Result<()> {
        let dag = state.dag;
        let node = dag
            .get(&queued.id)
            .ok_or_else(|| Error::Internal(format!("queued job {} not in DAG", queued.id)))?;

        state.board.transition(&queued.id, JobStatus::Running)?;
        info!(job = %queued.id, rank = queued.rank, "Dispatching job");
        state.emit(SchedulerEvent::JobStarted {
            id: queued.id.clone(),
        });

        let (cancel_tx, signal) = CancelSignal::new();
        state.running.insert(
            queued.id.clone(),
            RunningJob {
                queued,
                cancel: cancel_tx,
            },
        );

        let runner = Arc::clone(&self.runner);
        let job = node.job.clone();
        let grace = self.config.cancel_grace;
        join_set.spawn(async move {
            let id = job.id.clone();
            let outcome = supervise(runner, job, signal, grace).await;
            (id, outcome)
        });

        Ok(())
    }
}

struct RunningJob {
    queued: QueuedJob,
    cancel: watch::Sender<bool>,
}

/// Current status of every job. Only the dispatch loop writes to it.
struct StatusBoard {
    statuses: HashMap<JobId, JobStatus>,
}

impl StatusBoard {
    fn new(dag: &JobDag) -> Self {
        Self {
            statuses: dag
                .jobs()
                .into_iter()
                .map(|node| (node.id().clone(), JobStatus::Pending))
                .collect(),
        }
    }

    fn get(&self, id: &JobId) -> JobStatus {
        self.statuses
            .get(id)
            .copied()
            .unwrap_or(JobStatus::Pending)
    }

    fn transition(&mut self, id: &JobId, next: JobStatus) -> Result<()> {
        let current = self.get(id);
        if !current.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                job: id.to_string(),
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        self.statuses.insert(id.clone(), next);
        Ok(())
    }

    fn first_non_terminal(&self, dag: &JobDag) -> Option<JobId> {
        dag.topological_order()
            .into_iter()
            .map(|node| node.id())
            .find(|id| !self.get(id).is_terminal())
            .cloned()
    }
}

struct RunState<'a> {
    dag: &'a JobDag,
    board: StatusBoard,
    queue: ReadyQueue,
    running: HashMap<JobId, RunningJob>,
    outcomes: HashMap<JobId, JobOutcome>,
    fail_fast: bool,
    matrix_fail_fast: HashSet<String>,
    halted: bool,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl<'a> RunState<'a> {
    fn new(
        dag: &'a JobDag,
        config: &SchedulerConfig,
        events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    ) -> Self {
        let mut queue = ReadyQueue::new();
        for (group, limit) in &config.group_limits {
            queue.set_concurrency_limit(group.clone(), *limit);
        }
        for (name, limit) in &config.job_limits {
            queue.set_job_rate_limit(name.clone(), *limit);
        }

        Self {
            dag,
            board: StatusBoard::new(dag),
            queue,
            running: HashMap::new(),
            outcomes: HashMap::with_capacity(dag.len()),
            fail_fast: config.fail_fast,
            matrix_fail_fast: config.matrix_fail_fast.clone(),
            halted: false,
            events,
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Skip jobs behind a blocked dependency and, when `enqueue` is set,
    /// move jobs whose dependencies all succeeded to the ready queue.
    /// Walking in topological order lets skips cascade in one pass.
    fn advance(&mut self, enqueue: bool) -> Result<()> {
        let dag = self.dag;
        for node in dag.topological_order() {
            let id = node.id();
            if self.board.get(id) != JobStatus::Pending {
                continue;
            }

            let predecessors = dag.predecessors(id);
            if let Some(blocker) = predecessors
                .iter()
                .find(|p| self.board.get(p.id()).blocks_dependents())
            {
                info!(job = %id, dependency = %blocker.id(), "Skipping job, dependency did not succeed");
                self.board.transition(id, JobStatus::Skipped)?;
                self.outcomes
                    .insert(id.clone(), JobOutcome::not_started(JobStatus::Skipped, None));
                self.emit(SchedulerEvent::JobFinished {
                    id: id.clone(),
                    status: JobStatus::Skipped,
                });
            } else if enqueue
                && predecessors
                    .iter()
                    .all(|p| self.board.get(p.id()) == JobStatus::Succeeded)
            {
                self.board.transition(id, JobStatus::Ready)?;
                debug!(job = %id, "Job ready");
                self.queue.enqueue(QueuedJob::from_node(node));
            }
        }
        Ok(())
    }

    /// Cancel every job that has not started and stop dispatching.
    fn halt(&mut self, reason: CancelReason) -> Result<()> {
        self.halted = true;
        let dropped = self.queue.drain();
        debug!(dropped = dropped.len(), %reason, "Cleared ready queue");

        let dag = self.dag;
        for node in dag.topological_order() {
            self.cancel_unstarted(node.id(), reason)?;
        }
        Ok(())
    }

    /// Cancel the unstarted instances of one matrix job.
    fn cancel_siblings(&mut self, name: &str) -> Result<()> {
        let dropped = self.queue.remove_named(name);
        debug!(job = %name, dropped = dropped.len(), "Cancelling matrix siblings");

        let dag = self.dag;
        for node in dag.topological_order() {
            if node.job.name == name {
                self.cancel_unstarted(node.id(), CancelReason::FailFast)?;
            }
        }
        Ok(())
    }

    fn cancel_unstarted(&mut self, id: &JobId, reason: CancelReason) -> Result<()> {
        if !matches!(self.board.get(id), JobStatus::Pending | JobStatus::Ready) {
            return Ok(());
        }
        self.board.transition(id, JobStatus::Cancelled)?;
        self.outcomes.insert(
            id.clone(),
            JobOutcome::not_started(JobStatus::Cancelled, Some(FailureKind::Cancelled { reason })),
        );
        self.emit(SchedulerEvent::JobFinished {
            id: id.clone(),
            status: JobStatus::Cancelled,
        });
        Ok(())
    }

    /// External cancellation: halt and ask running jobs to stop.
    fn request_cancel(&mut self) -> Result<()> {
        warn!(running = self.running.len(), "Cancellation requested, stopping run");
        self.halt(CancelReason::UserRequested)?;
        for running in self.running.values() {
            let _ = running.cancel.send(true);
        }
        Ok(())
    }

    fn finish(&mut self, id: JobId, mut outcome: JobOutcome) -> Result<()> {
        if let Some(running) = self.running.remove(&id) {
            self.queue.complete(&running.queued);
        }

        let status = match outcome.status {
            status @ (JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled) => status,
            other => {
                error!(job = %id, status = %other, "Runner returned a non-final status");
                outcome.status = JobStatus::Failed;
                JobStatus::Failed
            }
        };

        self.board.transition(&id, status)?;
        match status {
            JobStatus::Succeeded => {
                info!(job = %id, duration_ms = outcome.duration_ms, "Job succeeded")
            }
            JobStatus::Failed => match &outcome.failure {
                Some(failure) => warn!(job = %id, %failure, "Job failed"),
                None => warn!(job = %id, "Job failed"),
            },
            _ => warn!(job = %id, "Job cancelled"),
        }
        self.emit(SchedulerEvent::JobFinished {
            id: id.clone(),
            status,
        });
        self.outcomes.insert(id.clone(), outcome);

        if status == JobStatus::Failed && self.fail_fast && !self.halted {
            // Skipping wins over fail-fast: dependents of the failure end Skipped
            // first, then the remaining Pending and Ready jobs are cancelled.
            self.advance(false)?;
            self.halt(CancelReason::FailFast)?;
        }

        let dag = self.dag;
        if status == JobStatus::Failed
            && !self.halted
            && let Some(node) = dag.get(&id)
            && self.matrix_fail_fast.contains(&node.job.name)
        {
            self.cancel_siblings(&node.job.name)?;
        }
        Ok(())
    }
}

/// Runs one job with its timeout and the scheduler's cancel signal.
///
/// Always yields an outcome: a runner that ignores cancellation past the
/// grace period is aborted and reported Cancelled.
async fn supervise(
    runner: Arc<dyn JobRunner>,
    job: JobInstance,
    mut cancel: CancelSignal,
    grace: Duration,
) -> JobOutcome {
    let started_at = Utc::now();
    let id = job.id.clone();
    let limit = job.timeout;

    let (runner_cancel, runner_signal) = CancelSignal::new();
    let mut handle = tokio::spawn(async move { runner.run(&job, runner_signal).await });

    let deadline = async move {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let reason = tokio::select! {
        joined = &mut handle => {
            return match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(job = %id, error = %e, "Job runner panicked");
                    let mut outcome = JobOutcome::not_started(
                        JobStatus::Failed,
                        Some(FailureKind::Infrastructure {
                            step: "runner".to_string(),
                            message: e.to_string(),
                            attempts: 1,
                        }),
                    );
                    outcome.started_at = Some(started_at);
                    outcome.finished_at = Some(Utc::now());
                    outcome
                }
            };
        }
        _ = &mut deadline => {
            warn!(job = %id, timeout_secs = limit.map(|l| l.as_secs()), "Job timed out");
            CancelReason::Timeout
        }
        _ = cancel.cancelled() => CancelReason::UserRequested,
    };

    let _ = runner_cancel.send(true);
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(mut outcome)) => {
            outcome.status = JobStatus::Cancelled;
            outcome.failure = Some(FailureKind::Cancelled { reason });
            outcome.started_at.get_or_insert(started_at);
            outcome
        }
        Ok(Err(_)) | Err(_) => {
            warn!(job = %id, grace_ms = grace.as_millis() as u64, "Job did not stop in time, aborting");
            handle.abort();
            JobOutcome::cancelled(reason, started_at, None)
        }
    }
}
