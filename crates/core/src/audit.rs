//! Append-only audit log
//!
//! One JSON-lines file per group at `{base_path}/{group}.jsonl`.
//! Entries are serialized with absent optional fields omitted, never
//! written as null. Existing lines are never mutated; queries read the
//! whole file and tolerate absence by returning empty.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::protocol::ToolError;

/// Outcome recorded for an audit entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// Request validated and answered successfully
    Routed,
    /// Pipeline rejected the request at a named stage
    Rejected,
    /// Outbound payload had credentials redacted
    Sanitized,
    /// Handler produced an error
    Error,
}

/// Which side of error normalization an entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationPhase {
    /// Handler's original error, as received
    BeforeNormalization,
    /// Error after reserved-code rewriting / opaquing
    AfterNormalization,
}

/// One audit record.
///
/// Error normalization writes two linked entries with the same
/// correlation, distinguished by `phase`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Record time
    pub timestamp: DateTime<Utc>,
    /// Authorization compartment (also selects the file)
    pub group: String,
    /// Container source tag
    pub source: String,
    /// Request topic
    pub topic: String,
    /// Reply key, when one was readable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<String>,
    /// Pipeline stage, for rejections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Entry outcome
    pub outcome: AuditOutcome,
    /// Free-form detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Redacted JSONPaths, for sanitize entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_paths: Option<Vec<String>>,
    /// Structured error, for rejected/error entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    /// Normalization side, for the dual error entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<NormalizationPhase>,
}

impl AuditEntry {
    /// Entry skeleton with only the required fields
    pub fn new(
        group: impl Into<String>,
        source: impl Into<String>,
        topic: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            group: group.into(),
            source: source.into(),
            topic: topic.into(),
            correlation: None,
            stage: None,
            outcome,
            reason: None,
            field_paths: None,
            error: None,
            phase: None,
        }
    }

    /// Attach the reply key
    pub fn with_correlation(mut self, correlation: impl Into<String>) -> Self {
        self.correlation = Some(correlation.into());
        self
    }

    /// Attach the rejecting stage name
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Attach free-form detail
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach redacted paths
    pub fn with_field_paths(mut self, paths: Vec<String>) -> Self {
        self.field_paths = Some(paths);
        self
    }

    /// Attach the structured error
    pub fn with_error(mut self, error: ToolError) -> Self {
        self.error = Some(error);
        self
    }

    /// Attach the normalization phase
    pub fn with_phase(mut self, phase: NormalizationPhase) -> Self {
        self.phase = Some(phase);
        self
    }
}

/// Append-only per-group audit writer with query support.
///
/// File handles are opened on first append for a group and held for
/// the life of the log (they are part of the supervisor's process-wide
/// state, torn down at stop).
pub struct AuditLog {
    base_path: PathBuf,
    files: Mutex<HashMap<String, File>>,
}

impl AuditLog {
    /// Open a log rooted at `base_path`, creating the directory
    pub async fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        tokio::fs::create_dir_all(&base_path).await?;
        Ok(Self {
            base_path,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Path of one group's file
    pub fn group_path(&self, group: &str) -> PathBuf {
        self.base_path.join(format!("{}.jsonl", group))
    }

    /// Append one entry to its group's file
    pub async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut files = self.files.lock().await;
        let file = match files.entry(entry.group.clone()) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                let opened = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.base_path.join(format!("{}.jsonl", entry.group)))
                    .await?;
                vacant.insert(opened)
            }
        };
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_group(&self, group: &str) -> Result<Vec<AuditEntry>> {
        let path = self.group_path(group);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        read_entries(&path, &contents)
    }

    /// Entries linked by one correlation id, in write order
    pub async fn by_correlation(&self, group: &str, correlation: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .read_group(group)
            .await?
            .into_iter()
            .filter(|e| e.correlation.as_deref() == Some(correlation))
            .collect())
    }

    /// Entries within an inclusive time range
    pub async fn in_range(
        &self,
        group: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AuditEntry>> {
        Ok(self
            .read_group(group)
            .await?
            .into_iter()
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .collect())
    }

    /// Entries for one topic
    pub async fn by_topic(&self, group: &str, topic: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .read_group(group)
            .await?
            .into_iter()
            .filter(|e| e.topic == topic)
            .collect())
    }

    /// Entries with one outcome
    pub async fn by_outcome(&self, group: &str, outcome: AuditOutcome) -> Result<Vec<AuditEntry>> {
        Ok(self
            .read_group(group)
            .await?
            .into_iter()
            .filter(|e| e.outcome == outcome)
            .collect())
    }
}

fn read_entries(path: &Path, contents: &str) -> Result<Vec<AuditEntry>> {
    let mut entries = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %e,
                    "skipping unreadable audit line"
                );
            }
        }
    }
    Ok(entries)
}
