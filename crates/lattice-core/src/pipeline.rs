//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline YAML configuration. The
//! rest of the system never looks at raw text; it consumes these types (and
//! the job instances expanded from them).

use crate::{Error, Result};
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// A scalar matrix value as written in the pipeline file.
pub type MatrixValue = serde_json::Value;

/// A partial mapping of axis name to value.
pub type ExclusionRule = IndexMap<String, MatrixValue>;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Environment shared by every job.
    #[serde(default)]
    pub env: IndexMap<String, String>,
    /// Cancel unstarted work as soon as one job fails.
    #[serde(default)]
    pub fail_fast: bool,
    /// Upper bound on simultaneously running jobs.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Concurrency group limits. Named groups without an entry default to 1.
    #[serde(default)]
    pub concurrency: HashMap<String, usize>,
    /// Retry policy for infrastructure failures.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    pub jobs: IndexMap<String, JobDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobDefinition {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub matrix: Option<MatrixSpec>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub needs: Vec<String>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub concurrency_group: Option<String>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    pub steps: Vec<Step>,
}

/// Compact matrix specification: axes plus exclusion and inclusion rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MatrixSpec {
    /// Axes in declaration order. Declaration order governs job naming.
    #[serde(alias = "axes")]
    pub dimensions: IndexMap<String, Vec<MatrixValue>>,
    #[serde(default)]
    pub exclude: Vec<ExclusionRule>,
    #[serde(default)]
    pub include: Vec<ExclusionRule>,
    #[serde(default)]
    pub max_parallel: Option<usize>,
    /// Cancel unstarted instances of this job once one instance fails.
    #[serde(default)]
    pub fail_fast: Option<bool>,
}

/// Borrowed view of one matrix axis.
#[derive(Debug, Clone, Copy)]
pub struct MatrixAxis<'a> {
    pub name: &'a str,
    pub values: &'a [MatrixValue],
}

impl MatrixSpec {
    pub fn axes(&self) -> impl Iterator<Item = MatrixAxis<'_>> {
        self.dimensions.iter().map(|(name, values)| MatrixAxis {
            name: name.as_str(),
            values: values.as_slice(),
        })
    }
}

/// Render a matrix value the way it appears in ids, env vars and
/// interpolated commands.
pub fn render_value(value: &MatrixValue) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// One step of a job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum StepKind {
    Shell(ShellStep),
    Action(ActionStep),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ShellStep {
    pub run: String,
    #[serde(default)]
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub shell: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ActionStep {
    pub uses: String,
    #[serde(default, rename = "with")]
    pub inputs: IndexMap<String, serde_json::Value>,
}

impl Step {
    /// Display name: explicit name, else the action or the first command line.
    pub fn label(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match &self.kind {
            StepKind::Shell(shell) => shell
                .run
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("run")
                .to_string(),
            StepKind::Action(action) => action.uses.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

impl PipelineDefinition {
    /// Parse a pipeline from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let definition: PipelineDefinition = serde_yaml::from_str(content)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Shape checks that do not need matrix expansion.
    pub fn validate(&self) -> Result<()> {
        if self.jobs.is_empty() {
            return Err(Error::InvalidSpec("pipeline has no jobs".to_string()));
        }
        if self.max_concurrency == Some(0) {
            return Err(Error::InvalidSpec(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if let Some((group, _)) = self.concurrency.iter().find(|(_, limit)| **limit == 0) {
            return Err(Error::InvalidSpec(format!(
                "concurrency limit for group {} must be at least 1",
                group
            )));
        }
        for (name, job) in &self.jobs {
            if job.steps.is_empty() {
                return Err(Error::InvalidSpec(format!("job {} has no steps", name)));
            }
        }
        Ok(())
    }
}
