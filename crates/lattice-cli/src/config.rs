//! CLI configuration management.

use crate::commands::OutputFormat;
use anyhow::{Context, anyhow};
use lattice_core::pipeline::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Overrides the config file location.
pub const CONFIG_ENV: &str = "LATTICE_CONFIG";

/// CLI configuration.
///
/// Values here override the pipeline file; command-line flags override both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Default cap on simultaneously running jobs.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Retry policy for infrastructure failures.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Seconds a cancelled job gets to stop before it is aborted.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_secs: u64,
    /// Shell for `run:` steps.
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Root of per-job workspaces. Defaults to a temporary directory.
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,
    /// Keep artifact content in memory after the run finishes.
    #[serde(default)]
    pub keep_artifacts: bool,
    /// Output format.
    #[serde(default)]
    pub output_format: OutputFormat,
}

fn default_cancel_grace() -> u64 {
    10
}

fn default_shell() -> String {
    "sh".to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            retry: None,
            cancel_grace_secs: default_cancel_grace(),
            shell: default_shell(),
            workspace_dir: None,
            keep_artifacts: false,
            output_format: OutputFormat::default(),
        }
    }
}

impl CliConfig {
    /// Load configuration from file.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Save configuration to file.
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> anyhow::Result<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let dirs = directories::ProjectDirs::from("dev", "lattice-ci", "lattice")
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "max_concurrency" => {
                let max = parse::<usize>(key, value)?;
                if max == 0 {
                    return Err("max_concurrency must be at least 1".to_string());
                }
                self.max_concurrency = Some(max);
            }
            "retry.max_attempts" => {
                self.retry.get_or_insert_with(RetryConfig::default).max_attempts = parse(key, value)?
            }
            "retry.initial_backoff_ms" => {
                self.retry.get_or_insert_with(RetryConfig::default).initial_backoff_ms =
                    parse(key, value)?
            }
            "retry.max_backoff_ms" => {
                self.retry.get_or_insert_with(RetryConfig::default).max_backoff_ms =
                    parse(key, value)?
            }
            "cancel_grace_secs" => self.cancel_grace_secs = parse(key, value)?,
            "shell" => self.shell = value.to_string(),
            "workspace_dir" => self.workspace_dir = Some(PathBuf::from(value)),
            "keep_artifacts" => self.keep_artifacts = parse(key, value)?,
            "output_format" => {
                self.output_format = match value {
                    "table" => OutputFormat::Table,
                    "json" => OutputFormat::Json,
                    _ => return Err(format!("Invalid output format: {}", value)),
                };
            }
            _ => return Err(format!("Unknown config key: {}", key)),
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid value for {}: {}", key, value))
}
