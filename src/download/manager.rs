// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download task manager.
//!
//! Owns the registry of download tasks. Each enqueued task gets its own tokio
//! task which waits for a worker permit, runs the blocking fetch on the
//! blocking pool and records the outcome. The registry lock is never held
//! across the fetch itself.
//!
//! Terminal writes are first-writer-wins: a cancel that lands while the fetch
//! is in flight marks the task `cancelled` at once, and the fetch's eventual
//! result is dropped (logged at debug level, never stored).

use anyhow::{Context, Result};
use chrono::Utc;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

use super::fetcher::{FetchProgress, Fetcher};
use super::types::{DownloadRequest, DownloadTask, TaskStatus};
use crate::config::Config;
use crate::errors::TaskError;
use crate::locks::{resilient_read, resilient_write};
use crate::utils::new_task_id;

/// Limits for the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Fetches allowed to run at once. Tasks beyond this wait in `pending`.
    pub max_concurrent: usize,
    /// Registry size above which finished tasks are evicted, oldest first.
    pub max_tasks: usize,
    /// Age after which a finished task is evicted.
    pub task_ttl: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_tasks: 512,
            task_ttl: Duration::from_secs(3600),
        }
    }
}

impl From<&Config> for ManagerConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent: config.max_concurrent_downloads,
            max_tasks: config.max_tasks,
            task_ttl: config.task_ttl(),
        }
    }
}

/// A registered task and the token used to cancel it.
struct TaskEntry {
    task: DownloadTask,
    token: CancellationToken,
}

/// Task id -> entry. Only ever touched through the manager.
#[derive(Default)]
struct Registry {
    tasks: HashMap<String, TaskEntry>,
}

impl Registry {
    /// Drop finished tasks that are too old, then the oldest finished tasks
    /// until there is room for one more. Unfinished tasks are never dropped.
    fn evict(&mut self, ttl: Duration, max_tasks: usize) -> usize {
        let now = Utc::now();
        let before = self.tasks.len();

        self.tasks.retain(|_, entry| match entry.task.ended_at {
            Some(ended) if entry.task.status.is_terminal() => (now - ended)
                .to_std()
                .map(|age| age <= ttl)
                .unwrap_or(true),
            _ => true,
        });

        if self.tasks.len() >= max_tasks {
            let mut finished: Vec<(chrono::DateTime<Utc>, String)> = self
                .tasks
                .iter()
                .filter(|(_, e)| e.task.status.is_terminal())
                .map(|(id, e)| (e.task.ended_at.unwrap_or(e.task.started_at), id.clone()))
                .collect();
            finished.sort();

            let excess = self.tasks.len() + 1 - max_tasks.max(1);
            for (_, id) in finished.into_iter().take(excess) {
                self.tasks.remove(&id);
            }
        }

        before - self.tasks.len()
    }
}

struct Inner {
    registry: RwLock<Registry>,
    fetcher: Arc<dyn Fetcher>,
    permits: Arc<Semaphore>,
    config: ManagerConfig,
    runtime: Handle,
    /// Bumped on every state change; lets waiters sleep instead of polling.
    changes: watch::Sender<u64>,
}

impl Inner {
    /// Apply `f` to a task under the write lock.
    ///
    /// Returns `Some(applied)` where `applied` is what `f` returned, or
    /// `None` when the task is no longer registered.
    fn update<F>(&self, id: &str, f: F) -> Option<bool>
    where
        F: FnOnce(&mut DownloadTask) -> bool,
    {
        let applied = {
            let mut registry = resilient_write(&self.registry);
            let entry = registry.tasks.get_mut(id)?;
            f(&mut entry.task)
        };
        if applied {
            self.changes.send_modify(|generation| *generation += 1);
        }
        Some(applied)
    }
}

/// Creates, tracks and cancels asynchronous downloads.
///
/// Cheap to clone; clones share the same registry.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use hfcache::download::{DownloadManager, DownloadRequest, HubFetcher, ManagerConfig};
///
/// # async fn example() -> anyhow::Result<()> {
/// let fetcher = Arc::new(HubFetcher::new("/tmp/hub", "https://huggingface.co"));
/// let manager = DownloadManager::new(fetcher, ManagerConfig::default())?;
///
/// let id = manager.enqueue(DownloadRequest::new("bert-base-uncased", "config.json"))?;
/// let task = manager.wait(&id).await?;
/// println!("{}: {:?}", task.status, task.result_path);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    /// Create a manager bound to the current tokio runtime.
    pub fn new(fetcher: Arc<dyn Fetcher>, config: ManagerConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .context("DownloadManager must be created inside a tokio runtime")?;
        let (changes, _) = watch::channel(0);
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));

        Ok(Self {
            inner: Arc::new(Inner {
                registry: RwLock::new(Registry::default()),
                fetcher,
                permits,
                config,
                runtime,
                changes,
            }),
        })
    }

    /// Register a new download and start it in the background.
    ///
    /// Returns the task id immediately; the fetch has not necessarily started.
    pub fn enqueue(&self, request: DownloadRequest) -> Result<String, TaskError> {
        let request = request.validate()?;
        let token = CancellationToken::new();

        let id = {
            let mut registry = resilient_write(&self.inner.registry);
            let evicted = registry.evict(self.inner.config.task_ttl, self.inner.config.max_tasks);
            if evicted > 0 {
                tracing::debug!("Evicted {} finished download tasks", evicted);
            }

            let mut id = new_task_id();
            while registry.tasks.contains_key(&id) {
                id = new_task_id();
            }
            registry.tasks.insert(
                id.clone(),
                TaskEntry {
                    task: DownloadTask::new(&id, &request),
                    token: token.clone(),
                },
            );
            id
        };
        self.inner.changes.send_modify(|generation| *generation += 1);

        tracing::info!(
            download_id = %id,
            "Queued download {}/{} ({} @ {})",
            request.repo_id,
            request.filename,
            request.repo_type,
            request.revision
        );

        self.inner
            .runtime
            .spawn(run_task(self.inner.clone(), id.clone(), request, token));
        Ok(id)
    }

    /// Snapshot of a task's current state.
    pub fn get(&self, id: &str) -> Result<DownloadTask, TaskError> {
        resilient_read(&self.inner.registry)
            .tasks
            .get(id)
            .map(|entry| entry.task.clone())
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    /// Cancel a task.
    ///
    /// Pending tasks never start their fetch. Running tasks are marked
    /// cancelled immediately, but the fetch already in flight keeps going in
    /// the background and its result is discarded. Cancelling a finished task
    /// changes nothing. Returns the task's status after the call.
    pub fn cancel(&self, id: &str) -> Result<TaskStatus, TaskError> {
        let (status, cancelled) = {
            let mut registry = resilient_write(&self.inner.registry);
            let entry = registry
                .tasks
                .get_mut(id)
                .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
            let was = entry.task.status;
            let cancelled = entry.task.cancel();
            if cancelled {
                entry.token.cancel();
                tracing::info!(download_id = %id, "Cancelled download (was {})", was);
            } else {
                tracing::debug!(download_id = %id, "Cancel ignored, task already {}", was);
            }
            (entry.task.status, cancelled)
        };

        if cancelled {
            self.inner.changes.send_modify(|generation| *generation += 1);
        }
        Ok(status)
    }

    /// Snapshots of every registered task, oldest first.
    pub fn list(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<DownloadTask> = resilient_read(&self.inner.registry)
            .tasks
            .values()
            .map(|entry| entry.task.clone())
            .collect();
        tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Number of tasks that are pending or running.
    pub fn active_count(&self) -> usize {
        resilient_read(&self.inner.registry)
            .tasks
            .values()
            .filter(|entry| !entry.task.status.is_terminal())
            .count()
    }

    /// Wait until a task reaches a terminal state and return it.
    pub async fn wait(&self, id: &str) -> Result<DownloadTask, TaskError> {
        let mut changes = self.inner.changes.subscribe();
        loop {
            let task = self.get(id)?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            if changes.changed().await.is_err() {
                return Err(TaskError::Internal("download manager dropped".to_string()));
            }
        }
    }
}

/// Body of one execution unit.
async fn run_task(inner: Arc<Inner>, id: String, request: DownloadRequest, token: CancellationToken) {
    let permit = tokio::select! {
        biased;
        _ = token.cancelled() => {
            tracing::debug!(download_id = %id, "Cancelled before start, fetch skipped");
            return;
        }
        permit = inner.permits.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                inner.update(&id, |task| {
                    task.start() && task.fail("Internal failure: worker pool closed")
                });
                return;
            }
        },
    };

    match inner.update(&id, |task| task.start()) {
        Some(true) => {}
        // Cancelled (or evicted) between getting the permit and starting.
        _ => return,
    }

    let fetcher = inner.fetcher.clone();
    let progress_inner = inner.clone();
    let progress_id = id.clone();
    let fetch_request = request.clone();

    let outcome = tokio::task::spawn_blocking(move || {
        let last_percent = Cell::new(0u8);
        let report = |progress: FetchProgress| {
            if let Some(percent) = progress.percent() {
                if percent > last_percent.get() {
                    last_percent.set(percent);
                    progress_inner.update(&progress_id, |task| task.advance_progress(percent));
                }
            }
        };
        fetcher.fetch(&fetch_request, &report)
    })
    .await;

    // The permit covers the blocking fetch even if the task was cancelled
    // meanwhile, so the number of live transfers stays bounded.
    drop(permit);

    let target = format!("{}/{}", request.repo_id, request.filename);
    let recorded = match outcome {
        Ok(Ok(path)) => {
            let recorded = inner.update(&id, |task| task.complete(path.clone()));
            if recorded == Some(true) {
                tracing::info!(download_id = %id, "Download completed: {} -> {}", target, path.display());
            }
            recorded
        }
        Ok(Err(e)) => {
            let recorded = inner.update(&id, |task| task.fail(e.to_string()));
            if recorded == Some(true) {
                tracing::warn!(download_id = %id, "Download failed for {}: {}", target, e);
            }
            recorded
        }
        Err(join_error) => {
            tracing::error!(download_id = %id, "Fetch worker for {} panicked: {}", target, join_error);
            inner.update(&id, |task| task.fail("Internal failure: fetch worker panicked"))
        }
    };

    if recorded != Some(true) {
        tracing::debug!(download_id = %id, "Discarded fetch result for {}, task already finished", target);
    }
}
