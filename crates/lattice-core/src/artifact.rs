//! Artifact references handed out by the artifact broker.

use crate::ids::{ArtifactId, JobId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Who produced an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "kind", content = "jobs")]
pub enum Producer {
    Job(JobId),
    Merge(Vec<JobId>),
}

impl Producer {
    pub fn jobs(&self) -> Vec<&JobId> {
        match self {
            Producer::Job(id) => vec![id],
            Producer::Merge(ids) => ids.iter().collect(),
        }
    }
}

/// One content blob of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactPart {
    /// Name of the artifact the blob was first published under.
    pub name: String,
    pub digest: String,
    pub size_bytes: u64,
}

/// A read-only handle to published artifact content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactRef {
    pub id: ArtifactId,
    pub name: String,
    /// Content identity: SHA-256 of the single part, or of the part digests
    /// for merged artifacts.
    pub digest: String,
    /// Content blobs, deduplicated by digest, in first-seen order.
    pub parts: Vec<ArtifactPart>,
    pub size_bytes: u64,
    pub producer: Producer,
    pub published_at: DateTime<Utc>,
}

impl ArtifactRef {
    pub fn is_merged(&self) -> bool {
        matches!(self.producer, Producer::Merge(_))
    }

    /// Short digest prefix for display.
    pub fn short_digest(&self) -> &str {
        &self.digest[..self.digest.len().min(12)]
    }
}
