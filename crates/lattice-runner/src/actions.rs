//! Built-in actions invoked with `uses:` steps.

use async_trait::async_trait;
use indexmap::IndexMap;
use lattice_artifacts::ArtifactBroker;
use lattice_core::artifact::ArtifactRef;
use lattice_core::job::JobInstance;
use lattice_core::{Error, Result};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Action inputs after interpolation.
pub type ActionInputs = IndexMap<String, String>;

/// What an action can reach while it runs.
pub struct ActionContext<'a> {
    pub job: &'a JobInstance,
    pub workspace: &'a Path,
    pub broker: &'a ArtifactBroker,
}

#[derive(Debug, Default)]
pub struct ActionOutput {
    /// Artifacts the action published.
    pub artifacts: Vec<ArtifactRef>,
    /// Human readable summary for the job log.
    pub summary: String,
}

/// A step implemented in-process rather than by a shell command.
#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &ActionContext<'_>, inputs: &ActionInputs) -> Result<ActionOutput>;
}

/// Actions by name.
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn empty() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Registry with the artifact actions, also reachable as `lattice/<name>`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(UploadArtifact));
        registry.register(Arc::new(DownloadArtifact));
        registry.register(Arc::new(MergeArtifacts));
        registry
    }

    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.actions.insert(action.name().to_string(), action);
    }

    pub fn get(&self, uses: &str) -> Result<Arc<dyn Action>> {
        let name = uses.strip_prefix("lattice/").unwrap_or(uses);
        self.actions
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownAction(uses.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn required<'a>(action: &str, inputs: &'a ActionInputs, key: &str) -> Result<&'a str> {
    match inputs.get(key).map(|v| v.trim()) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::InvalidActionInput {
            action: action.to_string(),
            reason: format!("missing '{}'", key),
        }),
    }
}

/// Resolve a relative path inside the job workspace.
fn workspace_path(action: &str, workspace: &Path, relative: &str) -> Result<PathBuf> {
    let relative = Path::new(relative);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(Error::InvalidActionInput {
            action: action.to_string(),
            reason: format!("path {} must stay inside the workspace", relative.display()),
        });
    }
    Ok(workspace.join(relative))
}

/// `upload-artifact`: publish a workspace file (`path`) under `name`.
pub struct UploadArtifact;

#[async_trait]
impl Action for UploadArtifact {
    fn name(&self) -> &'static str {
        "upload-artifact"
    }

    async fn run(&self, ctx: &ActionContext<'_>, inputs: &ActionInputs) -> Result<ActionOutput> {
        let name = required(self.name(), inputs, "name")?;
        let path = workspace_path(self.name(), ctx.workspace, required(self.name(), inputs, "path")?)?;

        let content = tokio::fs::read(&path).await.map_err(|e| Error::InvalidActionInput {
            action: self.name().to_string(),
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        let artifact = ctx.broker.publish(&ctx.job.id, name, content).await?;

        info!(job = %ctx.job.id, artifact = %name, "Uploaded artifact");
        Ok(ActionOutput {
            summary: format!(
                "uploaded {} ({} bytes, {})",
                artifact.name,
                artifact.size_bytes,
                artifact.short_digest()
            ),
            artifacts: vec![artifact],
        })
    }
}

/// `download-artifact`: write every artifact matching `pattern` into the
/// workspace directory `path` (default: the workspace root).
pub struct DownloadArtifact;

#[async_trait]
impl Action for DownloadArtifact {
    fn name(&self) -> &'static str {
        "download-artifact"
    }

    async fn run(&self, ctx: &ActionContext<'_>, inputs: &ActionInputs) -> Result<ActionOutput> {
        let pattern = required(self.name(), inputs, "pattern")?;
        let dest = match inputs.get("path").map(|p| p.trim()).filter(|p| !p.is_empty()) {
            Some(path) => workspace_path(self.name(), ctx.workspace, path)?,
            None => ctx.workspace.to_path_buf(),
        };

        let found = ctx.broker.fetch(pattern).await?;
        let mut files = 0;
        for artifact in &found {
            files += ctx.broker.materialize(artifact, &dest).await?.len();
        }

        info!(job = %ctx.job.id, %pattern, artifacts = found.len(), "Downloaded artifacts");
        Ok(ActionOutput {
            artifacts: Vec::new(),
            summary: format!(
                "downloaded {} artifact(s), {} file(s) into {}",
                found.len(),
                files,
                dest.display()
            ),
        })
    }
}

/// `merge-artifacts`: merge everything matching `pattern` into `name`.
pub struct MergeArtifacts;

#[async_trait]
impl Action for MergeArtifacts {
    fn name(&self) -> &'static str {
        "merge-artifacts"
    }

    async fn run(&self, ctx: &ActionContext<'_>, inputs: &ActionInputs) -> Result<ActionOutput> {
        let pattern = required(self.name(), inputs, "pattern")?;
        let target = required(self.name(), inputs, "name")?;

        let sources: Vec<ArtifactRef> = ctx
            .broker
            .fetch(pattern)
            .await?
            .into_iter()
            .filter(|a| a.name != target)
            .collect();
        if sources.is_empty() {
            return Err(Error::ArtifactNotFound(pattern.to_string()));
        }

        let merged = ctx.broker.merge(&sources, target).await?;
        info!(job = %ctx.job.id, artifact = %target, sources = sources.len(), "Merged artifacts");
        Ok(ActionOutput {
            summary: format!(
                "merged {} artifact(s) into {} ({} part(s), {})",
                sources.len(),
                merged.name,
                merged.parts.len(),
                merged.short_digest()
            ),
            artifacts: vec![merged],
        })
    }
}
