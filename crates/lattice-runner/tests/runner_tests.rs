//! Execution runner behaviour with scripted and real shell executors.

use async_trait::async_trait;
use indexmap::IndexMap;
use lattice_artifacts::ArtifactBroker;
use lattice_core::job::{JobInstance, JobStatus};
use lattice_core::pipeline::{ActionStep, ResourceRequirements, ShellStep, Step, StepKind};
use lattice_core::ports::{CancelSignal, ExecOutput, ExecRequest, Executor, JobRunner};
use lattice_core::run::{CancelReason, FailureKind, StepStatus};
use lattice_core::{Error, JobId, Result};
use lattice_runner::{ExecutionRunner, LogStore, RetryPolicy, RunnerConfig, ShellExecutor};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Fails with an infrastructure error a fixed number of times, then
/// answers every command with the configured exit code.
struct FlakyExecutor {
    failures: u32,
    exit_code: i32,
    calls: AtomicU32,
    seen: Mutex<Vec<ExecRequest>>,
}

impl FlakyExecutor {
    fn new(failures: u32, exit_code: i32) -> Self {
        Self {
            failures,
            exit_code,
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Executor for FlakyExecutor {
    async fn execute(&self, request: &ExecRequest) -> Result<ExecOutput> {
        self.seen.lock().unwrap().push(request.clone());
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(Error::Infrastructure(format!("executor unavailable ({})", call)));
        }
        Ok(ExecOutput {
            exit_code: self.exit_code,
            stdout: format!("ran: {}\n", request.command),
            stderr: String::new(),
        })
    }
}

fn shell(run: &str) -> Step {
    Step {
        name: None,
        continue_on_error: false,
        kind: StepKind::Shell(ShellStep {
            run: run.to_string(),
            env: IndexMap::new(),
            working_directory: None,
            shell: None,
        }),
    }
}

fn action(uses: &str, inputs: &[(&str, &str)]) -> Step {
    Step {
        name: None,
        continue_on_error: false,
        kind: StepKind::Action(ActionStep {
            uses: uses.to_string(),
            inputs: inputs
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
                .collect(),
        }),
    }
}

fn job(id: &str, steps: Vec<Step>) -> JobInstance {
    JobInstance {
        id: JobId::new(id),
        name: id.split(' ').next().unwrap_or(id).to_string(),
        index: 0,
        matrix: IndexMap::new(),
        steps,
        needs: Vec::new(),
        env: IndexMap::new(),
        resources: ResourceRequirements::default(),
        concurrency_group: None,
        timeout: None,
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new()
        .with_max_attempts(max_attempts)
        .with_initial_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(5))
}

fn runner(executor: Arc<dyn Executor>, workspace: &TempDir, retry: RetryPolicy) -> ExecutionRunner {
    ExecutionRunner::new(
        executor,
        Arc::new(ArtifactBroker::default()),
        RunnerConfig {
            workspace_root: workspace.path().to_path_buf(),
            shell: "sh".to_string(),
            retry,
        },
    )
}

#[tokio::test]
async fn test_steps_run_in_order() {
    let ws = TempDir::new().unwrap();
    let executor = Arc::new(FlakyExecutor::new(0, 0));
    let runner = runner(executor.clone(), &ws, fast_retry(1));

    let outcome = runner
        .run(&job("lint", vec![shell("cargo fmt --check"), shell("cargo clippy")]), CancelSignal::never())
        .await;

    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert!(outcome.failure.is_none());
    assert_eq!(outcome.steps.len(), 2);
    assert!(outcome.steps.iter().all(|s| s.status == StepStatus::Succeeded));

    let seen = executor.seen.lock().unwrap();
    assert_eq!(seen[0].command, "cargo fmt --check");
    assert_eq!(seen[1].command, "cargo clippy");
    assert_eq!(seen[0].working_directory, ws.path().join("lint"));
    assert_eq!(seen[0].env.get("LATTICE_JOB_ID").map(String::as_str), Some("lint"));
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let ws = TempDir::new().unwrap();
    let executor = Arc::new(FlakyExecutor::new(2, 0));
    let runner = runner(executor.clone(), &ws, fast_retry(3));

    let outcome = runner.run(&job("build", vec![shell("make")]), CancelSignal::never()).await;

    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(outcome.steps[0].attempts, 3);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retries_exhausted_reports_infrastructure() {
    let ws = TempDir::new().unwrap();
    let executor = Arc::new(FlakyExecutor::new(10, 0));
    let runner = runner(executor.clone(), &ws, fast_retry(2));

    let outcome = runner
        .run(&job("build", vec![shell("make"), shell("make install")]), CancelSignal::never())
        .await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert!(matches!(
        outcome.failure,
        Some(FailureKind::Infrastructure { ref step, attempts: 2, .. }) if step == "make"
    ));
    assert_eq!(outcome.steps[1].status, StepStatus::NotRun);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_missing_working_directory_is_not_retried() {
    let ws = TempDir::new().unwrap();
    let executor = Arc::new(FlakyExecutor::new(0, 0));
    let runner = runner(executor.clone(), &ws, fast_retry(3));

    let mut step = shell("make");
    if let StepKind::Shell(s) = &mut step.kind {
        s.working_directory = Some("no-such-dir".to_string());
    }
    let outcome = runner
        .run(&job("build", vec![step, shell("make install")]), CancelSignal::never())
        .await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert!(matches!(
        outcome.failure,
        Some(FailureKind::ActionFailed { ref message, .. }) if message.contains("no-such-dir")
    ));
    assert_eq!(outcome.steps[0].attempts, 1);
    assert_eq!(outcome.steps[1].status, StepStatus::NotRun);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_nonzero_exit_is_not_retried() {
    let ws = TempDir::new().unwrap();
    let executor = Arc::new(FlakyExecutor::new(0, 2));
    let runner = runner(executor.clone(), &ws, fast_retry(3));

    let outcome = runner.run(&job("test", vec![shell("pytest")]), CancelSignal::never()).await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert!(matches!(
        outcome.failure,
        Some(FailureKind::StepFailure { exit_code: 2, .. })
    ));
    assert_eq!(outcome.steps[0].exit_code, Some(2));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_continue_on_error() {
    let ws = TempDir::new().unwrap();
    let runner = runner(Arc::new(ShellExecutor::new()), &ws, fast_retry(1));

    let mut flaky = shell("exit 1");
    flaky.continue_on_error = true;
    let outcome = runner
        .run(&job("check", vec![flaky, shell("true")]), CancelSignal::never())
        .await;

    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(outcome.steps[0].status, StepStatus::FailedIgnored);
    assert_eq!(outcome.steps[1].status, StepStatus::Succeeded);
}

#[tokio::test]
async fn test_matrix_values_reach_the_shell() {
    let ws = TempDir::new().unwrap();
    let logs = LogStore::new();
    let runner = runner(Arc::new(ShellExecutor::new()), &ws, fast_retry(1)).with_logs(logs.clone());

    let mut instance = job("build (linux, 3.12)", vec![shell(
        "echo ${{ matrix.os }}-$MATRIX_PYTHON_VERSION ${{ job.name }}",
    )]);
    instance.matrix.insert("os".to_string(), serde_json::json!("linux"));
    instance.matrix.insert("python-version".to_string(), serde_json::json!(3.12));

    let outcome = runner.run(&instance, CancelSignal::never()).await;
    assert_eq!(outcome.status, JobStatus::Succeeded);

    let log = outcome.log.expect("log reference");
    let text = logs.render(&log).await;
    assert!(text.contains("linux-3.12 build"), "log was: {}", text);
}

#[tokio::test]
async fn test_upload_then_download() {
    let ws = TempDir::new().unwrap();
    let broker = Arc::new(ArtifactBroker::default());
    let config = RunnerConfig {
        workspace_root: ws.path().to_path_buf(),
        shell: "sh".to_string(),
        retry: fast_retry(1),
    };
    let runner = ExecutionRunner::new(Arc::new(ShellExecutor::new()), broker.clone(), config);

    let producer = job("build", vec![
        shell("mkdir -p dist && echo wheel > dist/pkg.whl"),
        action("upload-artifact", &[("name", "wheel"), ("path", "dist/pkg.whl")]),
    ]);
    let outcome = runner.run(&producer, CancelSignal::never()).await;
    assert_eq!(outcome.status, JobStatus::Succeeded, "{:?}", outcome.failure);
    assert_eq!(outcome.artifacts.len(), 1);
    assert_eq!(outcome.artifacts[0].name, "wheel");

    let consumer = job("publish", vec![
        action("lattice/download-artifact", &[("pattern", "whe*"), ("path", "in")]),
        shell("test \"$(cat in/wheel)\" = wheel"),
    ]);
    let outcome = runner.run(&consumer, CancelSignal::never()).await;
    assert_eq!(outcome.status, JobStatus::Succeeded, "{:?}", outcome.failure);
    assert!(ws.path().join("publish").join("in").join("wheel").exists());
}

#[tokio::test]
async fn test_download_missing_artifact_fails_step() {
    let ws = TempDir::new().unwrap();
    let runner = runner(Arc::new(FlakyExecutor::new(0, 0)), &ws, fast_retry(1));

    let outcome = runner
        .run(&job("deploy", vec![action("download-artifact", &[("pattern", "bundle-*")])]), CancelSignal::never())
        .await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert!(matches!(
        outcome.failure,
        Some(FailureKind::ArtifactNotFound { ref pattern, .. }) if pattern == "bundle-*"
    ));
}

#[tokio::test]
async fn test_unknown_action_fails_step() {
    let ws = TempDir::new().unwrap();
    let runner = runner(Arc::new(FlakyExecutor::new(0, 0)), &ws, fast_retry(1));

    let outcome = runner
        .run(&job("deploy", vec![action("docker/build", &[])]), CancelSignal::never())
        .await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert!(matches!(outcome.failure, Some(FailureKind::ActionFailed { .. })));
}

#[tokio::test]
async fn test_cancel_interrupts_running_step() {
    let ws = TempDir::new().unwrap();
    let runner = runner(Arc::new(ShellExecutor::new()), &ws, fast_retry(1));
    let (tx, cancel) = CancelSignal::new();

    let instance = job("slow", vec![shell("sleep 30"), shell("true")]);
    let handle = tokio::spawn(async move { runner.run(&instance, cancel).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.send(true).unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("runner stopped")
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Cancelled);
    assert!(matches!(
        outcome.failure,
        Some(FailureKind::Cancelled { reason: CancelReason::UserRequested })
    ));
    assert!(outcome.steps.iter().all(|s| s.status == StepStatus::NotRun));
}
