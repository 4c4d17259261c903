//! End-to-end runs through the CLI handlers with a real shell.

use crate::commands::{OutputFormat, RunArgs};
use crate::config::CliConfig;
use crate::handlers::{self, RunSettings};
use lattice_artifacts::{MANIFEST_FILE, RetentionPolicy};
use lattice_core::job::JobStatus;
use lattice_core::pipeline::PipelineDefinition;
use lattice_core::ports::CancelSignal;
use lattice_core::run::RunStatus;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

const WHEELS: &str = r#"
name: wheels
jobs:
  build:
    matrix:
      dimensions:
        py: ["1", "2"]
    steps:
      - run: mkdir -p dist && echo "wheel ${{ matrix.py }}" > dist/out.whl
      - uses: upload-artifact
        with:
          name: wheel-${{ matrix.py }}
          path: dist/out.whl
  merge:
    needs: build
    steps:
      - uses: merge-artifacts
        with:
          pattern: wheel-*
          name: wheels
"#;

const FLAKY_BUILD: &str = r#"
name: flaky
jobs:
  build:
    matrix:
      dimensions:
        py: ["1", "2"]
    steps:
      - run: test "${{ matrix.py }}" != "2"
  merge:
    needs: build
    steps:
      - run: echo merging
"#;

fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn write_pipeline(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("lattice.yaml");
    std::fs::write(&path, content).unwrap();
    path
}

fn args(path: PathBuf) -> RunArgs {
    RunArgs {
        path,
        max_concurrency: None,
        fail_fast: false,
        dry_run: false,
        artifacts_dir: None,
        logs_dir: None,
        output: Some(OutputFormat::Json),
    }
}

fn config(dir: &Path) -> CliConfig {
    CliConfig {
        workspace_dir: Some(dir.join("work")),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_matrix_build_and_merge() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let mut run_args = args(write_pipeline(dir.path(), WHEELS));
    let out = dir.path().join("artifacts");
    run_args.artifacts_dir = Some(out.clone());
    run_args.logs_dir = Some(dir.path().join("logs"));

    let report = handlers::execute(&config(dir.path()), &run_args, CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    let ids: Vec<&str> = report.jobs.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, vec!["build (1)", "build (2)", "merge"]);

    assert_eq!(std::fs::read_to_string(out.join("wheel-1")).unwrap(), "wheel 1\n");
    assert!(out.join("wheels").join("wheel-1").exists());
    assert!(out.join("wheels").join("wheel-2").exists());
    assert!(out.join(MANIFEST_FILE).exists());

    assert!(dir.path().join("logs").join("merge.log").exists());
    assert!(dir.path().join("logs").join("build (2).log").exists());
}

#[tokio::test]
async fn test_failed_instance_skips_dependent() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let run_args = args(write_pipeline(dir.path(), FLAKY_BUILD));

    let report = handlers::execute(&config(dir.path()), &run_args, CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.status.exit_code(), 1);
    assert_eq!(report.job("build (1)").unwrap().status, JobStatus::Succeeded);
    assert_eq!(report.job("build (2)").unwrap().status, JobStatus::Failed);
    assert_eq!(report.job("merge").unwrap().status, JobStatus::Skipped);
    assert!(report.job("build (2)").unwrap().failed_step.is_some());
}

#[tokio::test]
async fn test_cancelled_run_exits_with_two() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let path = write_pipeline(
        dir.path(),
        "name: slow\njobs:\n  wait:\n    steps:\n      - run: sleep 30\n",
    );
    let mut cfg = config(dir.path());
    cfg.cancel_grace_secs = 1;

    let (tx, cancel) = CancelSignal::new();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = tx.send(true);
    });

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        handlers::execute(&cfg, &args(path), cancel),
    )
    .await
    .expect("run stopped after cancel")
    .unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.status.exit_code(), 2);
}

#[tokio::test]
async fn test_cycle_is_structural() {
    let dir = TempDir::new().unwrap();
    let path = write_pipeline(
        dir.path(),
        "name: loop\njobs:\n  a:\n    needs: b\n    steps: [{run: 'true'}]\n  b:\n    needs: a\n    steps: [{run: 'true'}]\n",
    );

    let err = handlers::execute(&config(dir.path()), &args(path), CancelSignal::never())
        .await
        .unwrap_err();
    assert_eq!(crate::exit_code(&err), 3);
    assert!(err.to_string().contains('a') && err.to_string().contains('b'));
}

#[tokio::test]
async fn test_unparseable_file_is_structural() {
    let dir = TempDir::new().unwrap();
    let path = write_pipeline(dir.path(), "name: [unterminated");

    let err = handlers::execute(&config(dir.path()), &args(path), CancelSignal::never())
        .await
        .unwrap_err();
    assert_eq!(crate::exit_code(&err), 3);

    let missing = handlers::load_pipeline(&dir.path().join("nope.yaml")).unwrap_err();
    assert!(missing.is_structural());
}

#[test]
fn test_flags_override_config_and_pipeline() {
    let pipeline = PipelineDefinition::from_yaml(
        "name: p\nmax_concurrency: 2\nretry: {max_attempts: 5}\njobs:\n  a:\n    steps: [{run: 'true'}]\n",
    )
    .unwrap();
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    let mut run_args = args(dir.path().join("lattice.yaml"));
    run_args.output = None;

    let settings = RunSettings::resolve(&pipeline, &cfg, &run_args);
    assert_eq!(settings.scheduler.max_concurrency, 2);
    assert_eq!(settings.runner.retry.max_attempts, 5);
    assert_eq!(settings.retention, RetentionPolicy::ReleaseAfterRun);
    assert_eq!(settings.output, OutputFormat::Table);
    assert!(settings.runner.workspace_root.starts_with(dir.path().join("work")));

    cfg.max_concurrency = Some(6);
    cfg.keep_artifacts = true;
    cfg.set("retry.max_attempts", "2").unwrap();
    let settings = RunSettings::resolve(&pipeline, &cfg, &run_args);
    assert_eq!(settings.scheduler.max_concurrency, 6);
    assert_eq!(settings.runner.retry.max_attempts, 2);
    assert_eq!(settings.retention, RetentionPolicy::KeepAfterRun);

    run_args.max_concurrency = Some(1);
    run_args.fail_fast = true;
    let settings = RunSettings::resolve(&pipeline, &cfg, &run_args);
    assert_eq!(settings.scheduler.max_concurrency, 1);
    assert!(settings.scheduler.fail_fast);
}
