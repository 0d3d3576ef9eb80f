// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Snapshot types for the cache directory.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::download::RepoType;

/// Errors from scanning or modifying the cache directory.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Repository not found in cache: {0}")]
    RepoNotFound(String),
    #[error("'{key}' matches several cached repositories ({}); use the folder name", candidates.join(", "))]
    AmbiguousRepo { key: String, candidates: Vec<String> },
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CacheError::Io { path: path.into(), source }
    }
}

/// One snapshot directory of a repository.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CachedRevision {
    /// Commit hash (the snapshot folder name)
    pub commit: String,
    /// Refs pointing at this commit, e.g. `main`
    pub refs: Vec<String>,
    /// Number of files in the snapshot
    pub nb_files: usize,
    pub snapshot_path: PathBuf,
}

/// A repository folder in the cache.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CachedRepo {
    pub repo_id: String,
    pub repo_type: RepoType,
    pub repo_path: PathBuf,
    /// Bytes used by the unique files referenced from all snapshots
    pub size_on_disk: u64,
    /// Number of unique files referenced from all snapshots
    pub nb_files: usize,
    pub last_accessed: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    pub revisions: Vec<CachedRevision>,
}

impl CachedRepo {
    /// Folder name inside the cache directory, e.g. `models--gpt2`.
    pub fn folder_name(&self) -> String {
        self.repo_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Returns true if `key` is this repo's folder name or full path.
    pub fn matches_location(&self, key: &str) -> bool {
        let key = normalize_key(key);
        if key.is_empty() {
            return false;
        }
        let path = self.repo_path.to_string_lossy();
        // Wildcard routes drop the leading slash of an absolute path.
        self.folder_name() == key || path == key || path.strip_prefix('/') == Some(key)
    }

    /// Returns true if `key` is this repo's id, whatever its type.
    pub fn matches_id(&self, key: &str) -> bool {
        let key = normalize_key(key);
        !key.is_empty() && self.repo_id == key
    }
}

fn normalize_key(key: &str) -> &str {
    key.trim().trim_end_matches('/')
}

/// Point-in-time view of the whole cache directory.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheSnapshot {
    pub cache_dir: PathBuf,
    pub repos: Vec<CachedRepo>,
    /// Folders that could not be interpreted as repositories
    pub warnings: Vec<String>,
    pub size_on_disk: u64,
}

impl CacheSnapshot {
    /// Total number of unique files across all repos.
    pub fn total_files(&self) -> usize {
        self.repos.iter().map(|r| r.nb_files).sum()
    }
}

/// Result of clearing the cache.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub struct ClearSummary {
    /// Repository folders removed
    pub removed: usize,
    /// Bytes freed
    pub freed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> CachedRepo {
        CachedRepo {
            repo_id: "openai/whisper-tiny".to_string(),
            repo_type: RepoType::Model,
            repo_path: PathBuf::from("/hub/models--openai--whisper-tiny"),
            size_on_disk: 0,
            nb_files: 0,
            last_accessed: None,
            last_modified: None,
            revisions: Vec::new(),
        }
    }

    #[test]
    fn test_matches_location() {
        let repo = repo();
        assert!(repo.matches_location("models--openai--whisper-tiny"));
        assert!(repo.matches_location("/hub/models--openai--whisper-tiny"));
        assert!(repo.matches_location("hub/models--openai--whisper-tiny/"));
        assert!(!repo.matches_location("openai/whisper-tiny"));
        assert!(!repo.matches_location("  "));
    }

    #[test]
    fn test_matches_id() {
        let repo = repo();
        assert!(repo.matches_id("openai/whisper-tiny"));
        assert!(repo.matches_id("openai/whisper-tiny/"));
        assert!(!repo.matches_id("whisper-tiny"));
        assert!(!repo.matches_id(""));
    }

    #[test]
    fn test_ambiguous_message_names_candidates() {
        let err = CacheError::AmbiguousRepo {
            key: "gpt2".to_string(),
            candidates: vec!["datasets--gpt2".to_string(), "models--gpt2".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("datasets--gpt2, models--gpt2"));
        assert!(message.contains("folder name"));
    }

    #[test]
    fn test_folder_name() {
        assert_eq!(repo().folder_name(), "models--openai--whisper-tiny");
    }
}
