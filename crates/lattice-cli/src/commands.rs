//! CLI command definitions.

use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run a pipeline locally
    Run(RunArgs),

    /// Validate a pipeline file without running it
    Validate {
        /// Path to pipeline file
        #[arg(default_value = "lattice.yaml")]
        path: PathBuf,
    },

    /// Print the JSON Schema of the pipeline format
    Schema,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Path to pipeline file
    #[arg(default_value = "lattice.yaml")]
    pub path: PathBuf,

    /// Maximum number of jobs running at once
    #[arg(short = 'j', long)]
    pub max_concurrency: Option<usize>,

    /// Cancel remaining jobs as soon as one fails
    #[arg(long)]
    pub fail_fast: bool,

    /// Print the execution plan and exit
    #[arg(long)]
    pub dry_run: bool,

    /// Write final artifacts into this directory
    #[arg(long)]
    pub artifacts_dir: Option<PathBuf>,

    /// Write one log file per job into this directory
    #[arg(long)]
    pub logs_dir: Option<PathBuf>,

    /// Report format (defaults to the configured one)
    #[arg(short, long, value_enum)]
    pub output: Option<OutputFormat>,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}
