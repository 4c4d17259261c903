//! Lattice CI CLI entrypoint.

use clap::Parser;
use console::style;
use lattice_core::ports::CancelSignal;
use tracing::warn;

mod commands;
mod config;
mod handlers;
mod output;
mod telemetry;

#[cfg(test)]
mod run_tests;

use commands::{Commands, ConfigCommands, LogFormat};
use config::CliConfig;

/// Exit code for pipeline files that fail to parse or validate.
const EXIT_INVALID: i32 = 3;

#[derive(Parser)]
#[command(name = "lattice")]
#[command(author, version, about = "Lattice CI build and test orchestrator", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

/// Trip the run's cancel signal on the first Ctrl-C; exit on the second.
fn install_ctrl_c() -> CancelSignal {
    let (tx, cancel) = CancelSignal::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupt received, cancelling run (press Ctrl-C again to exit)");
        let _ = tx.send(true);
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
    cancel
}

fn exit_code(error: &anyhow::Error) -> i32 {
    let structural = error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<lattice_core::Error>())
        .any(lattice_core::Error::is_structural);
    if structural { EXIT_INVALID } else { 1 }
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let config = CliConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Ignoring unreadable config file");
        CliConfig::default()
    });

    match cli.command {
        Commands::Run(args) => handlers::run_pipeline(&config, &args, install_ctrl_c()).await,
        Commands::Validate { path } => handlers::validate(&path).map(|_| 0),
        Commands::Schema => handlers::schema().map(|_| 0),
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config).map(|_| 0),
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value).map(|_| 0),
        },
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    telemetry::init(cli.verbose, cli.log_format);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", style("✗").red().bold(), e);
            exit_code(&e)
        }
    };
    std::process::exit(code);
}
