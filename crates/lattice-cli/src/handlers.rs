//! Command handlers.

use crate::commands::{OutputFormat, RunArgs};
use crate::config::CliConfig;
use crate::output;
use anyhow::Context;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use lattice_artifacts::{ArtifactBroker, RetentionPolicy};
use lattice_core::job::JobStatus;
use lattice_core::pipeline::PipelineDefinition;
use lattice_core::ports::CancelSignal;
use lattice_core::run::RunReport;
use lattice_core::{Error, RunId};
use lattice_runner::{ExecutionRunner, LogStore, RetryPolicy, RunnerConfig, ShellExecutor};
use lattice_scheduler::scheduler::SchedulerEvent;
use lattice_scheduler::{DagBuilder, JobDag, Scheduler, SchedulerConfig, finalize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Read and parse a pipeline file. Unreadable files count as invalid input.
pub fn load_pipeline(path: &Path) -> lattice_core::Result<PipelineDefinition> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::InvalidSpec(format!("cannot read {}: {}", path.display(), e)))?;
    PipelineDefinition::from_yaml(&content)
}

/// Validate a pipeline file: parse, expand matrices and build the graph.
pub fn validate(path: &Path) -> anyhow::Result<()> {
    let pipeline = load_pipeline(path)?;
    let dag = DagBuilder::build_pipeline(&pipeline)?;

    println!(
        "{} Pipeline \"{}\" is valid",
        style("✓").green(),
        pipeline.name
    );
    println!("  Jobs: {} ({} instances)", pipeline.jobs.len(), dag.len());
    for (name, job) in &pipeline.jobs {
        let instances = dag.jobs().iter().filter(|n| &n.job.name == name).count();
        println!("    - {} ({} steps, {} instances)", name, job.steps.len(), instances);
    }
    Ok(())
}

/// Print the JSON Schema of the pipeline format.
pub fn schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(PipelineDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

pub fn show_config(config: &CliConfig) -> anyhow::Result<()> {
    println!("{}", style(format!("# {}", CliConfig::config_path()?.display())).dim());
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

pub fn set_config(key: &str, value: &str) -> anyhow::Result<()> {
    let mut config = CliConfig::load()?;
    config.set(key, value).map_err(anyhow::Error::msg)?;
    config.save()?;
    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}

/// Settings for one run after merging flags, config and pipeline.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub scheduler: SchedulerConfig,
    pub runner: RunnerConfig,
    pub retention: RetentionPolicy,
    pub output: OutputFormat,
}

impl RunSettings {
    pub fn resolve(pipeline: &PipelineDefinition, config: &CliConfig, args: &RunArgs) -> Self {
        let mut scheduler = SchedulerConfig::from_pipeline(pipeline);
        if let Some(max) = args.max_concurrency.or(config.max_concurrency) {
            scheduler.max_concurrency = max.max(1);
        }
        scheduler.fail_fast |= args.fail_fast;
        scheduler.cancel_grace = Duration::from_secs(config.cancel_grace_secs);

        let retry = config
            .retry
            .as_ref()
            .or(pipeline.retry.as_ref())
            .map(RetryPolicy::from)
            .unwrap_or_default()
            .with_jitter(true);

        let run_id = RunId::new();
        let workspace_root = config
            .workspace_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("lattice"))
            .join(run_id.to_string());

        Self {
            scheduler,
            runner: RunnerConfig {
                workspace_root,
                shell: config.shell.clone(),
                retry,
            },
            retention: if config.keep_artifacts {
                RetentionPolicy::KeepAfterRun
            } else {
                RetentionPolicy::ReleaseAfterRun
            },
            output: args.output.unwrap_or(config.output_format),
        }
    }
}

/// Print scheduler events until the scheduler drops its sender.
fn spawn_progress(
    dag: &JobDag,
    mut events: mpsc::UnboundedReceiver<SchedulerEvent>,
    visible: bool,
) -> tokio::task::JoinHandle<()> {
    let bar = if visible {
        let bar = ProgressBar::new(dag.len() as u64);
        if let Ok(bar_style) =
            ProgressStyle::with_template("{spinner:.cyan} [{bar:30}] {pos}/{len} jobs {elapsed}")
        {
            bar.set_style(bar_style.progress_chars("=> "));
        }
        bar.enable_steady_tick(Duration::from_millis(120));
        bar
    } else {
        ProgressBar::hidden()
    };

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SchedulerEvent::JobStarted { id } => {
                    bar.println(format!("{} {}", style("▶").cyan(), style(&id).bold()));
                }
                SchedulerEvent::JobFinished { id, status } => {
                    let icon = match status {
                        JobStatus::Succeeded => style("✓").green(),
                        JobStatus::Failed => style("✗").red(),
                        JobStatus::Skipped => style("⏭").dim(),
                        _ => style("⊘").yellow(),
                    };
                    bar.println(format!("{} {} {}", icon, id, style(status).dim()));
                    bar.inc(1);
                }
            }
        }
        bar.finish_and_clear();
    })
}

/// Run a pipeline to completion and return its report.
///
/// Artifacts and logs are written out before the broker releases its
/// content.
pub async fn execute(
    config: &CliConfig,
    args: &RunArgs,
    cancel: CancelSignal,
) -> anyhow::Result<RunReport> {
    let pipeline = load_pipeline(&args.path)?;
    let dag = DagBuilder::build_pipeline(&pipeline)?;
    let settings = RunSettings::resolve(&pipeline, config, args);
    let table = settings.output == OutputFormat::Table;

    info!(
        pipeline = %pipeline.name,
        jobs = dag.len(),
        workspace = %settings.runner.workspace_root.display(),
        "Starting pipeline"
    );
    if table {
        println!(
            "{} Running {} ({} jobs)",
            style("▶").cyan().bold(),
            style(&pipeline.name).bold(),
            dag.len()
        );
    }

    let broker = Arc::new(ArtifactBroker::new(settings.retention));
    let logs = LogStore::new();
    let runner = ExecutionRunner::new(
        Arc::new(ShellExecutor::new()),
        broker.clone(),
        settings.runner.clone(),
    )
    .with_logs(logs.clone());

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let progress = spawn_progress(&dag, events_rx, table);
    let scheduler =
        Scheduler::new(Arc::new(runner), settings.scheduler.clone()).with_events(events_tx);

    let outcomes = scheduler.run(&dag, cancel).await;
    drop(scheduler);
    if let Err(e) = progress.await {
        warn!(error = %e, "Progress printer stopped");
    }
    let report = finalize(&dag, &outcomes?);

    if let Some(dir) = &args.logs_dir {
        let written = logs
            .write_to(dir)
            .await
            .with_context(|| format!("writing logs to {}", dir.display()))?;
        if table {
            println!("{} Wrote {} log(s) to {}", style("✓").green(), written.len(), dir.display());
        }
    }

    match &args.artifacts_dir {
        Some(dir) => {
            let exported = broker
                .export_to(dir)
                .await
                .with_context(|| format!("exporting artifacts to {}", dir.display()))?;
            if table {
                println!(
                    "{} Exported {} artifact(s) to {}",
                    style("✓").green(),
                    exported.len(),
                    dir.display()
                );
            }
        }
        None if table => {
            let artifacts = broker.latest().await;
            if !artifacts.is_empty() {
                println!("\n{}", style("Artifacts").bold());
                for artifact in artifacts {
                    println!(
                        "  {}  {}  {} bytes",
                        artifact.name,
                        style(artifact.short_digest()).dim(),
                        artifact.size_bytes
                    );
                }
            }
        }
        None => {}
    }

    let freed = broker.release().await;
    info!(status = %report.status, freed_bytes = freed, "Run finished");
    Ok(report)
}

/// `lattice run`: execute, print the report and return the exit code.
pub async fn run_pipeline(
    config: &CliConfig,
    args: &RunArgs,
    cancel: CancelSignal,
) -> anyhow::Result<i32> {
    if args.dry_run {
        let pipeline = load_pipeline(&args.path)?;
        let dag = DagBuilder::build_pipeline(&pipeline)?;
        print!("{}", output::render_plan(&dag));
        return Ok(0);
    }

    let report = execute(config, args, cancel).await?;
    match args.output.unwrap_or(config.output_format) {
        OutputFormat::Table => {
            println!();
            print!("{}", output::render_table(&report));
        }
        OutputFormat::Json => println!("{}", output::render_json(&report)?),
    }
    Ok(report.status.exit_code())
}
