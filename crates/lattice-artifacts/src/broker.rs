//! In-memory, content-addressed artifact broker.

use crate::keys::{content_digest, glob_to_regex, merged_digest};
use chrono::Utc;
use indexmap::IndexMap;
use lattice_core::artifact::{ArtifactPart, ArtifactRef, Producer};
use lattice_core::{ArtifactId, Error, JobId, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// What happens to stored content once the run report is final.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    ReleaseAfterRun,
    KeepAfterRun,
}

#[derive(Default)]
struct Store {
    /// Every published version per name, oldest first. Never rewritten.
    by_name: IndexMap<String, Vec<ArtifactRef>>,
    blobs: HashMap<String, Arc<[u8]>>,
}

/// Shared artifact store for one run.
///
/// Artifacts are immutable once published. Content is deduplicated by
/// SHA-256 digest, so republishing or re-merging identical content is free.
pub struct ArtifactBroker {
    store: RwLock<Store>,
    retention: RetentionPolicy,
}

impl ArtifactBroker {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            store: RwLock::new(Store::default()),
            retention,
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Publish content under a name.
    ///
    /// Identical content from the same producer returns the existing ref.
    pub async fn publish(&self, producer: &JobId, name: &str, content: Vec<u8>) -> Result<ArtifactRef> {
        let digest = content_digest(&content);
        let producer = Producer::Job(producer.clone());

        let mut store = self.store.write().await;
        if let Some(existing) = store.by_name.get(name).and_then(|history| {
            history
                .iter()
                .find(|r| r.digest == digest && r.producer == producer)
        }) {
            debug!(artifact = %name, digest = %existing.short_digest(), "Artifact already published");
            return Ok(existing.clone());
        }

        let size_bytes = content.len() as u64;
        store
            .blobs
            .entry(digest.clone())
            .or_insert_with(|| Arc::from(content));

        let artifact = ArtifactRef {
            id: ArtifactId::new(),
            name: name.to_string(),
            digest: digest.clone(),
            parts: vec![ArtifactPart {
                name: name.to_string(),
                digest,
                size_bytes,
            }],
            size_bytes,
            producer,
            published_at: Utc::now(),
        };
        store
            .by_name
            .entry(name.to_string())
            .or_default()
            .push(artifact.clone());

        info!(artifact = %name, size_bytes, digest = %artifact.short_digest(), "Published artifact");
        Ok(artifact)
    }

    /// Latest version of every artifact whose name matches a glob pattern,
    /// sorted by name.
    pub async fn fetch(&self, pattern: &str) -> Result<Vec<ArtifactRef>> {
        let re = glob_to_regex(pattern)?;
        let store = self.store.read().await;

        let mut matches: Vec<ArtifactRef> = store
            .by_name
            .iter()
            .filter(|(name, _)| re.is_match(name))
            .filter_map(|(_, history)| history.last().cloned())
            .collect();

        if matches.is_empty() {
            return Err(Error::ArtifactNotFound(pattern.to_string()));
        }
        matches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(matches)
    }

    /// Merge artifacts into one logical artifact.
    ///
    /// Parts are deduplicated by digest, keeping first-seen order. Merging a
    /// set whose result already exists under `target` returns that ref.
    pub async fn merge(&self, refs: &[ArtifactRef], target: &str) -> Result<ArtifactRef> {
        if refs.is_empty() {
            return Err(Error::ArtifactNotFound(format!(
                "no artifacts to merge into {}",
                target
            )));
        }

        let mut seen = HashSet::new();
        let mut parts = Vec::new();
        let mut producers: Vec<JobId> = Vec::new();
        for artifact in refs {
            for part in &artifact.parts {
                if seen.insert(part.digest.clone()) {
                    parts.push(part.clone());
                }
            }
            for job in artifact.producer.jobs() {
                if !producers.contains(job) {
                    producers.push(job.clone());
                }
            }
        }

        let digest = merged_digest(parts.iter().map(|p| p.digest.as_str()));

        let mut store = self.store.write().await;
        for part in &parts {
            if !store.blobs.contains_key(&part.digest) {
                return Err(Error::ArtifactNotFound(part.name.clone()));
            }
        }
        if let Some(existing) = store
            .by_name
            .get(target)
            .and_then(|history| history.iter().find(|r| r.digest == digest))
        {
            debug!(artifact = %target, "Merge already performed");
            return Ok(existing.clone());
        }

        let artifact = ArtifactRef {
            id: ArtifactId::new(),
            name: target.to_string(),
            digest,
            size_bytes: parts.iter().map(|p| p.size_bytes).sum(),
            parts,
            producer: Producer::Merge(producers),
            published_at: Utc::now(),
        };
        store
            .by_name
            .entry(target.to_string())
            .or_default()
            .push(artifact.clone());

        info!(
            artifact = %target,
            sources = refs.len(),
            parts = artifact.parts.len(),
            "Merged artifacts"
        );
        Ok(artifact)
    }

    /// Content of every part of an artifact, in part order.
    pub async fn read(&self, artifact: &ArtifactRef) -> Result<Vec<(ArtifactPart, Arc<[u8]>)>> {
        let store = self.store.read().await;
        artifact
            .parts
            .iter()
            .map(|part| {
                store
                    .blobs
                    .get(&part.digest)
                    .map(|blob| (part.clone(), Arc::clone(blob)))
                    .ok_or_else(|| Error::ArtifactNotFound(artifact.name.clone()))
            })
            .collect()
    }

    /// The most recent version of each artifact name, in first-publish order.
    pub async fn latest(&self) -> Vec<ArtifactRef> {
        let store = self.store.read().await;
        store
            .by_name
            .values()
            .filter_map(|history| history.last().cloned())
            .collect()
    }

    /// Every version published under a name, oldest first.
    pub async fn history(&self, name: &str) -> Vec<ArtifactRef> {
        let store = self.store.read().await;
        store.by_name.get(name).cloned().unwrap_or_default()
    }

    /// Drop stored content unless the policy keeps it. Returns bytes freed.
    ///
    /// References stay listed; reading them afterwards fails.
    pub async fn release(&self) -> u64 {
        if self.retention == RetentionPolicy::KeepAfterRun {
            debug!("Keeping artifact content after run");
            return 0;
        }
        let mut store = self.store.write().await;
        let freed: u64 = store.blobs.values().map(|b| b.len() as u64).sum();
        store.blobs.clear();
        info!(freed_bytes = freed, "Released artifact content");
        freed
    }
}

impl Default for ArtifactBroker {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}
