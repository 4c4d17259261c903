//! Captured job output.

use chrono::{DateTime, Utc};
use lattice_artifacts::sanitize_key;
use lattice_core::run::LogRef;
use lattice_core::{JobId, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Where a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// Lines written by the runner itself.
    System,
}

/// One line of job output.
#[derive(Debug, Clone, Serialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: DateTime<Utc>,
}

/// In-memory log store keyed by job id. Cheap to clone.
#[derive(Clone, Default)]
pub struct LogStore {
    logs: Arc<RwLock<HashMap<String, Vec<OutputLine>>>>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh log for a job.
    pub async fn open(&self, job: &JobId) -> LogRef {
        let key = job.to_string();
        self.logs.write().await.insert(key.clone(), Vec::new());
        LogRef::new(key)
    }

    /// Append text, one entry per line.
    pub async fn append(&self, log: &LogRef, stream: OutputStream, text: &str) {
        let mut logs = self.logs.write().await;
        let lines = logs.entry(log.as_str().to_string()).or_default();
        for content in text.lines() {
            let line_number = lines.len() as u32 + 1;
            lines.push(OutputLine {
                stream,
                content: content.to_string(),
                line_number,
                timestamp: Utc::now(),
            });
        }
    }

    pub async fn lines(&self, log: &LogRef) -> Vec<OutputLine> {
        self.logs
            .read()
            .await
            .get(log.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Plain-text rendering; runner lines are prefixed with `==>`.
    pub async fn render(&self, log: &LogRef) -> String {
        let mut out = String::new();
        for line in self.lines(log).await {
            if line.stream == OutputStream::System {
                out.push_str("==> ");
            }
            out.push_str(&line.content);
            out.push('\n');
        }
        out
    }

    /// Write every log to `dir/<job id>.log`.
    pub async fn write_to(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(dir).await?;
        let keys: Vec<String> = self.logs.read().await.keys().cloned().collect();

        let mut written = Vec::with_capacity(keys.len());
        for key in keys {
            let path = dir.join(format!("{}.log", sanitize_key(&key)));
            let text = self.render(&LogRef::new(key)).await;
            tokio::fs::write(&path, text).await?;
            written.push(path);
        }
        written.sort();
        Ok(written)
    }
}
