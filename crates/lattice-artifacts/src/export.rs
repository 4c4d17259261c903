//! Writing artifact content to disk.

use crate::broker::ArtifactBroker;
use crate::keys::sanitize_key;
use lattice_core::Result;
use lattice_core::artifact::ArtifactRef;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name of the export manifest.
pub const MANIFEST_FILE: &str = "manifest.json";

/// One artifact written by [`ArtifactBroker::export_to`].
#[derive(Debug, Clone, Serialize)]
pub struct ExportedArtifact {
    pub name: String,
    pub digest: String,
    pub size_bytes: u64,
    pub files: Vec<PathBuf>,
}

impl ArtifactBroker {
    /// Write an artifact under `dest`.
    ///
    /// A single-part artifact becomes the file `dest/<name>`. A merged
    /// artifact becomes the directory `dest/<name>/` with one file per part.
    pub async fn materialize(&self, artifact: &ArtifactRef, dest: &Path) -> Result<Vec<PathBuf>> {
        let parts = self.read(artifact).await?;
        let base = dest.join(sanitize_key(&artifact.name));
        let mut files = Vec::with_capacity(parts.len());

        if !artifact.is_merged() && parts.len() == 1 {
            tokio::fs::create_dir_all(dest).await?;
            tokio::fs::write(&base, &*parts[0].1).await?;
            files.push(base);
        } else {
            tokio::fs::create_dir_all(&base).await?;
            let mut used = HashSet::new();
            for (part, content) in &parts {
                let mut file_name = sanitize_key(&part.name);
                if !used.insert(file_name.clone()) {
                    file_name = format!("{}-{}", file_name, &part.digest[..part.digest.len().min(8)]);
                    used.insert(file_name.clone());
                }
                let path = base.join(file_name);
                tokio::fs::write(&path, &**content).await?;
                files.push(path);
            }
        }

        debug!(artifact = %artifact.name, files = files.len(), dest = %dest.display(), "Materialized artifact");
        Ok(files)
    }

    /// Export the latest version of every artifact into `dir`, with a
    /// `manifest.json` describing what was written.
    pub async fn export_to(&self, dir: &Path) -> Result<Vec<ExportedArtifact>> {
        tokio::fs::create_dir_all(dir).await?;

        let mut exported = Vec::new();
        for artifact in self.latest().await {
            let files = self.materialize(&artifact, dir).await?;
            exported.push(ExportedArtifact {
                name: artifact.name.clone(),
                digest: artifact.digest.clone(),
                size_bytes: artifact.size_bytes,
                files,
            });
        }

        let manifest = serde_json::to_vec_pretty(&exported)?;
        tokio::fs::write(dir.join(MANIFEST_FILE), manifest).await?;

        info!(artifacts = exported.len(), dir = %dir.display(), "Exported artifacts");
        Ok(exported)
    }
}
