// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Read-mostly view over a hub-style cache directory.
//!
//! Each repository lives in its own folder named `{type}s--{owner}--{name}`
//! holding `blobs/`, `snapshots/` and `refs/`. [`CacheIndex`] rescans the
//! directory on every call; nothing is cached between calls, so downloads
//! finished in the meantime always show up.
//!
//! # Example
//!
//! ```no_run
//! use hfcache::cache::CacheIndex;
//!
//! let index = CacheIndex::new("/home/me/.cache/huggingface/hub");
//! let snapshot = index.snapshot()?;
//! for repo in &snapshot.repos {
//!     println!("{} {}", repo.repo_id, repo.size_on_disk);
//! }
//! # Ok::<(), hfcache::cache::CacheError>(())
//! ```

mod scan;
pub mod types;

pub use types::{CacheError, CacheSnapshot, CachedRepo, CachedRevision, ClearSummary};

use std::fs;
use std::path::{Path, PathBuf};

/// Name of the lock directory the hub tooling keeps next to repo folders.
const LOCKS_DIR: &str = ".locks";

/// Scanner and removal primitive for one cache directory.
#[derive(Debug, Clone)]
pub struct CacheIndex {
    cache_dir: PathBuf,
}

impl CacheIndex {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self { cache_dir: cache_dir.into() }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Scan the cache directory.
    ///
    /// A missing directory yields an empty snapshot. Folders that do not look
    /// like repositories are reported in `warnings` and otherwise ignored.
    pub fn snapshot(&self) -> Result<CacheSnapshot, CacheError> {
        let mut snapshot = CacheSnapshot {
            cache_dir: self.cache_dir.clone(),
            repos: Vec::new(),
            warnings: Vec::new(),
            size_on_disk: 0,
        };

        if !self.cache_dir.is_dir() {
            tracing::debug!("Cache directory {} does not exist", self.cache_dir.display());
            return Ok(snapshot);
        }

        let entries = fs::read_dir(&self.cache_dir).map_err(|e| CacheError::io(&self.cache_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| CacheError::io(&self.cache_dir, e))?;
            let path = entry.path();
            if entry.file_name() == LOCKS_DIR {
                continue;
            }
            if !path.is_dir() {
                snapshot
                    .warnings
                    .push(format!("Scan cache expects a folder: {}", path.display()));
                continue;
            }

            match scan::scan_repo(&path)? {
                Ok(repo) => snapshot.repos.push(repo),
                Err(warning) => snapshot.warnings.push(warning),
            }
        }

        for warning in &snapshot.warnings {
            tracing::warn!("{}", warning);
        }

        snapshot.repos.sort_by(|a, b| a.repo_path.cmp(&b.repo_path));
        snapshot.size_on_disk = snapshot.repos.iter().map(|r| r.size_on_disk).sum();
        Ok(snapshot)
    }

    /// Delete one repository folder.
    ///
    /// `repo_key` may be the folder name (`models--owner--name`), the
    /// folder's full path or the repo id (`owner/name`). A repo id shared by
    /// several repo types is refused rather than guessed.
    pub fn remove(&self, repo_key: &str) -> Result<CachedRepo, CacheError> {
        let repo = self.resolve(repo_key)?;

        self.delete_repo_folder(&repo.repo_path)?;
        tracing::info!(
            "Removed {} {} ({} bytes)",
            repo.repo_type,
            repo.repo_id,
            repo.size_on_disk
        );
        Ok(repo)
    }

    /// Find the single repo named by `repo_key`.
    fn resolve(&self, repo_key: &str) -> Result<CachedRepo, CacheError> {
        let repos = self.snapshot()?.repos;

        if let Some(repo) = repos.iter().find(|r| r.matches_location(repo_key)) {
            return Ok(repo.clone());
        }

        let mut by_id: Vec<CachedRepo> = repos.into_iter().filter(|r| r.matches_id(repo_key)).collect();
        match by_id.len() {
            0 => Err(CacheError::RepoNotFound(repo_key.to_string())),
            1 => Ok(by_id.remove(0)),
            _ => Err(CacheError::AmbiguousRepo {
                key: repo_key.to_string(),
                candidates: by_id.iter().map(CachedRepo::folder_name).collect(),
            }),
        }
    }

    /// Delete every repository folder and the lock directory.
    ///
    /// Only folders that parse as repositories are touched, so pointing the
    /// index at the wrong directory cannot wipe unrelated data.
    pub fn clear(&self) -> Result<ClearSummary, CacheError> {
        let snapshot = self.snapshot()?;
        let mut summary = ClearSummary::default();

        for repo in &snapshot.repos {
            self.delete_repo_folder(&repo.repo_path)?;
            summary.removed += 1;
            summary.freed += repo.size_on_disk;
        }

        let locks = self.cache_dir.join(LOCKS_DIR);
        if locks.is_dir() {
            fs::remove_dir_all(&locks).map_err(|e| CacheError::io(&locks, e))?;
        }

        tracing::info!(
            "Cleared cache {}: {} repos, {} bytes",
            self.cache_dir.display(),
            summary.removed,
            summary.freed
        );
        Ok(summary)
    }

    fn delete_repo_folder(&self, repo_path: &Path) -> Result<(), CacheError> {
        fs::remove_dir_all(repo_path).map_err(|e| CacheError::io(repo_path, e))?;

        if let Some(folder) = repo_path.file_name() {
            let lock_dir = self.cache_dir.join(LOCKS_DIR).join(folder);
            if lock_dir.is_dir() {
                // Stale locks are harmless; failing to remove them is not an error.
                if let Err(e) = fs::remove_dir_all(&lock_dir) {
                    tracing::debug!("Could not remove {}: {}", lock_dir.display(), e);
                }
            }
        }
        Ok(())
    }
}
