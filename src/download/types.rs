// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types: task records, their status machine and request inputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::TaskError;

/// Default revision fetched when a request names none.
pub const DEFAULT_REVISION: &str = "main";

/// Status of a download task.
///
/// ```text
/// Pending ──▶ Running ──▶ Completed | Failed
///    │           │
///    └───────────┴──▶ Cancelled
/// ```
///
/// Serialized lowercase, which is what the front end polls for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Registered, waiting for a worker slot
    Pending,
    /// Fetch in flight
    Running,
    /// File is in the cache
    Completed,
    /// Fetch failed, see `error`
    Failed,
    /// Cancelled by a client
    Cancelled,
}

impl TaskStatus {
    /// Returns true if no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// Returns true if the move from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of hub repository.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum RepoType {
    #[default]
    Model,
    Dataset,
    Space,
}

impl RepoType {
    /// Prefix of the cache folder name, e.g. `models` in `models--gpt2`.
    pub fn folder_prefix(&self) -> &'static str {
        match self {
            RepoType::Model => "models",
            RepoType::Dataset => "datasets",
            RepoType::Space => "spaces",
        }
    }

    /// Path prefix used in hub URLs. Models have none.
    pub fn url_prefix(&self) -> &'static str {
        match self {
            RepoType::Model => "",
            RepoType::Dataset => "datasets/",
            RepoType::Space => "spaces/",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RepoType::Model => "model",
            RepoType::Dataset => "dataset",
            RepoType::Space => "space",
        }
    }
}

impl fmt::Display for RepoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepoType {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "model" | "models" => Ok(RepoType::Model),
            "dataset" | "datasets" => Ok(RepoType::Dataset),
            "space" | "spaces" => Ok(RepoType::Space),
            other => Err(TaskError::InvalidArgument(format!("unknown repo_type '{}'", other))),
        }
    }
}

/// Inputs for a new download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub repo_id: String,
    pub filename: String,
    pub revision: String,
    pub repo_type: RepoType,
}

impl DownloadRequest {
    /// Build a request for the default revision of a model repo.
    pub fn new(repo_id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
            filename: filename.into(),
            revision: DEFAULT_REVISION.to_string(),
            repo_type: RepoType::Model,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    pub fn with_repo_type(mut self, repo_type: RepoType) -> Self {
        self.repo_type = repo_type;
        self
    }

    /// Trim the inputs and reject empty ones.
    ///
    /// `filename` and `revision` end up as path components under the cache
    /// directory, so parent segments and absolute forms are refused.
    pub fn validate(mut self) -> Result<Self, TaskError> {
        self.repo_id = self.repo_id.trim().to_string();
        self.filename = self.filename.trim().trim_start_matches('/').to_string();
        self.revision = self.revision.trim().to_string();

        if self.repo_id.is_empty() || self.filename.is_empty() {
            return Err(TaskError::InvalidArgument(
                "repo_id and filename are required".to_string(),
            ));
        }
        if escapes_parent(&self.filename) {
            return Err(TaskError::InvalidArgument(
                "filename must be a relative path without '..' segments".to_string(),
            ));
        }
        if self.revision.is_empty() {
            self.revision = DEFAULT_REVISION.to_string();
        }
        if escapes_parent(&self.revision) {
            return Err(TaskError::InvalidArgument(
                "revision must be a branch, tag or commit without '..' segments".to_string(),
            ));
        }
        Ok(self)
    }
}

/// True for absolute paths and paths with a `..` segment, either separator.
fn escapes_parent(value: &str) -> bool {
    value.starts_with('/')
        || value.starts_with('\\')
        || value.split(['/', '\\']).any(|part| part == "..")
}

/// A tracked download and its current state.
///
/// This is also the JSON snapshot returned to pollers. `end_time` and
/// `file_path` only appear once they are set; `error` is always present
/// (null unless the task failed).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadTask {
    #[serde(rename = "download_id")]
    pub id: String,
    pub repo_id: String,
    pub filename: String,
    pub revision: String,
    pub repo_type: RepoType,
    pub status: TaskStatus,
    /// 0-100, never decreasing
    pub progress: u8,
    #[serde(rename = "start_time")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "end_time", default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(rename = "file_path", default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<PathBuf>,
}

impl DownloadTask {
    /// Create a pending task.
    pub fn new(id: impl Into<String>, request: &DownloadRequest) -> Self {
        Self {
            id: id.into(),
            repo_id: request.repo_id.clone(),
            filename: request.filename.clone(),
            revision: request.revision.clone(),
            repo_type: request.repo_type,
            status: TaskStatus::Pending,
            progress: 0,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
            result_path: None,
        }
    }

    /// Apply a status transition if the state machine allows it.
    ///
    /// Returns false, leaving the task untouched, when it does not. Entering
    /// a terminal state stamps `ended_at`.
    fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        true
    }

    pub fn start(&mut self) -> bool {
        self.transition(TaskStatus::Running)
    }

    pub fn complete(&mut self, path: PathBuf) -> bool {
        if !self.transition(TaskStatus::Completed) {
            return false;
        }
        self.progress = 100;
        self.result_path = Some(path);
        true
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if !self.transition(TaskStatus::Failed) {
            return false;
        }
        self.error = Some(error.into());
        true
    }

    pub fn cancel(&mut self) -> bool {
        self.transition(TaskStatus::Cancelled)
    }

    /// Raise progress while running. Capped at 99; only completion reports 100.
    pub fn advance_progress(&mut self, percent: u8) -> bool {
        let percent = percent.min(99);
        if self.status != TaskStatus::Running || percent <= self.progress {
            return false;
        }
        self.progress = percent;
        true
    }
}
