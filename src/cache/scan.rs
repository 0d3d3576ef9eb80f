// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Walking a single repository folder.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::types::{CacheError, CachedRepo, CachedRevision};
use crate::download::RepoType;

/// Parse a folder name like `models--google--bert` into type and repo id.
pub(crate) fn parse_folder_name(name: &str) -> Option<(RepoType, String)> {
    let mut parts = name.split("--");
    let repo_type = match parts.next()? {
        "models" => RepoType::Model,
        "datasets" => RepoType::Dataset,
        "spaces" => RepoType::Space,
        _ => return None,
    };
    let id_parts: Vec<&str> = parts.collect();
    if id_parts.is_empty() || id_parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    Some((repo_type, id_parts.join("/")))
}

/// All regular files below `dir`, following symlinks to their targets.
fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), CacheError> {
    let mut visited = HashSet::new();
    walk_files(dir, out, &mut visited)
}

/// Each directory is entered once by canonical path, so symlink cycles end.
fn walk_files(dir: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<(), CacheError> {
    let canonical = fs::canonicalize(dir).map_err(|e| CacheError::io(dir, e))?;
    if !visited.insert(canonical) {
        tracing::debug!("Skipping already visited directory {}", dir.display());
        return Ok(());
    }

    let entries = fs::read_dir(dir).map_err(|e| CacheError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| CacheError::io(dir, e))?;
        let path = entry.path();
        // `metadata` follows symlinks; a dangling link is skipped.
        match fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => walk_files(&path, out, visited)?,
            Ok(_) => out.push(path),
            Err(_) => tracing::debug!("Skipping dangling entry {}", path.display()),
        }
    }
    Ok(())
}

/// Map of commit -> ref names, read from `refs/`.
fn read_refs(refs_dir: &Path) -> Result<HashMap<String, Vec<String>>, CacheError> {
    let mut refs: HashMap<String, Vec<String>> = HashMap::new();
    if !refs_dir.is_dir() {
        return Ok(refs);
    }

    let mut files = Vec::new();
    collect_files(refs_dir, &mut files)?;
    for file in files {
        let name = file
            .strip_prefix(refs_dir)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        let commit = fs::read_to_string(&file).map_err(|e| CacheError::io(&file, e))?;
        refs.entry(commit.trim().to_string()).or_default().push(name);
    }
    for names in refs.values_mut() {
        names.sort();
    }
    Ok(refs)
}

fn latest(current: Option<SystemTime>, candidate: Option<SystemTime>) -> Option<SystemTime> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Scan one repository folder.
///
/// Returns `Ok(Err(reason))` for folders that exist but are not laid out
/// like a cached repository, so the caller can report them as warnings.
pub(crate) fn scan_repo(repo_path: &Path) -> Result<Result<CachedRepo, String>, CacheError> {
    let folder = repo_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let Some((repo_type, repo_id)) = parse_folder_name(&folder) else {
        return Ok(Err(format!("Repo path is not a valid cache folder name: {}", repo_path.display())));
    };

    let snapshots_dir = repo_path.join("snapshots");
    if !snapshots_dir.is_dir() {
        return Ok(Err(format!("Snapshots folder missing in {}", repo_path.display())));
    }

    let refs = read_refs(&repo_path.join("refs"))?;

    let mut revisions = Vec::new();
    let mut unique_files: HashSet<PathBuf> = HashSet::new();

    let entries = fs::read_dir(&snapshots_dir).map_err(|e| CacheError::io(&snapshots_dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| CacheError::io(&snapshots_dir, e))?;
        let snapshot_path = entry.path();
        if !snapshot_path.is_dir() {
            continue;
        }
        let commit = entry.file_name().to_string_lossy().into_owned();

        let mut files = Vec::new();
        collect_files(&snapshot_path, &mut files)?;
        for file in &files {
            // Symlinked snapshots share blobs; count each blob once.
            let resolved = fs::canonicalize(file).unwrap_or_else(|_| file.clone());
            unique_files.insert(resolved);
        }

        revisions.push(CachedRevision {
            refs: refs.get(&commit).cloned().unwrap_or_default(),
            commit,
            nb_files: files.len(),
            snapshot_path,
        });
    }
    revisions.sort_by(|a, b| a.commit.cmp(&b.commit));

    let mut size_on_disk = 0u64;
    let mut accessed = None;
    let mut modified = None;
    for file in &unique_files {
        let meta = fs::metadata(file).map_err(|e| CacheError::io(file, e))?;
        size_on_disk += meta.len();
        accessed = latest(accessed, meta.accessed().ok());
        modified = latest(modified, meta.modified().ok());
    }

    Ok(Ok(CachedRepo {
        repo_id,
        repo_type,
        repo_path: repo_path.to_path_buf(),
        size_on_disk,
        nb_files: unique_files.len(),
        last_accessed: accessed.map(DateTime::<Utc>::from),
        last_modified: modified.map(DateTime::<Utc>::from),
        revisions,
    }))
}
