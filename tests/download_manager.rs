// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download manager behavior tests.
//!
//! A scripted fetcher stands in for the hub. Its behavior is picked by the
//! requested filename:
//!
//! - `missing*` fails with a not-found error
//! - `panic*` panics inside the fetch
//! - `gated*` blocks until the test opens the gate
//! - `gated-progress*` reports 10%, 50%, then 30% before blocking
//! - anything else succeeds at once

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tokio::time::timeout;

use hfcache::download::{
    DownloadManager, DownloadRequest, DownloadTask, FetchError, FetchProgress, Fetcher, ManagerConfig,
    TaskStatus,
};
use hfcache::errors::TaskError;

// Test configuration
const CONCURRENCY_LEVEL: usize = 50;
const TEST_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// SCRIPTED FETCHER
// =============================================================================

#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
    }

    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }
}

#[derive(Default)]
struct ScriptedFetcher {
    gate: Gate,
    calls: AtomicUsize,
    finished: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    fetched: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    fn run(&self, request: &DownloadRequest, progress: &dyn Fn(FetchProgress)) -> Result<PathBuf, FetchError> {
        let name = request.filename.as_str();
        if name.starts_with("missing") {
            return Err(FetchError::NotFound(format!("{}/{}", request.repo_id, name)));
        }
        if name.starts_with("panic") {
            panic!("scripted fetch of {} blew up", name);
        }
        if name.starts_with("gated-progress") {
            for downloaded in [10, 50, 30] {
                progress(FetchProgress { downloaded, total: Some(100) });
            }
        }
        if name.starts_with("gated") {
            self.gate.wait();
        }
        Ok(PathBuf::from("/cache/snapshots/abc").join(name))
    }

    fn fetched(&self, filename: &str) -> usize {
        self.fetched.lock().unwrap().iter().filter(|f| *f == filename).count()
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch(&self, request: &DownloadRequest, progress: &dyn Fn(FetchProgress)) -> Result<PathBuf, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.fetched.lock().unwrap().push(request.filename.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result = self.run(request, progress);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
        result
    }
}

fn setup(config: ManagerConfig) -> (DownloadManager, Arc<ScriptedFetcher>) {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let manager = DownloadManager::new(fetcher.clone(), config).unwrap();
    (manager, fetcher)
}

fn with_workers(max_concurrent: usize) -> ManagerConfig {
    ManagerConfig {
        max_concurrent,
        ..ManagerConfig::default()
    }
}

/// Poll until `pred` holds for the task.
async fn wait_until<F>(manager: &DownloadManager, id: &str, pred: F) -> DownloadTask
where
    F: Fn(&DownloadTask) -> bool,
{
    timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        loop {
            let task = manager.get(id).unwrap();
            if pred(&task) {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

async fn wait_terminal(manager: &DownloadManager, id: &str) -> DownloadTask {
    timeout(Duration::from_secs(TEST_TIMEOUT_SECS), manager.wait(id))
        .await
        .expect("task did not finish in time")
        .unwrap()
}

async fn wait_fetches_finished(fetcher: &ScriptedFetcher, count: usize) {
    timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        while fetcher.finished.load(Ordering::SeqCst) < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("fetches did not finish in time");
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_enqueue_returns_pending_or_running() {
    let (manager, fetcher) = setup(ManagerConfig::default());

    let id = manager.enqueue(DownloadRequest::new("bert-base-uncased", "gated.json")).unwrap();
    let task = manager.get(&id).unwrap();
    assert!(matches!(task.status, TaskStatus::Pending | TaskStatus::Running));
    assert_eq!(task.progress, 0);
    assert_eq!(task.repo_id, "bert-base-uncased");
    assert!(task.ended_at.is_none());
    assert!(task.result_path.is_none());

    fetcher.gate.open();
    wait_terminal(&manager, &id).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_successful_fetch_completes() {
    let (manager, _fetcher) = setup(ManagerConfig::default());

    let id = manager.enqueue(DownloadRequest::new("bert-base-uncased", "config.json")).unwrap();
    let task = wait_terminal(&manager, &id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100);
    assert_eq!(task.result_path, Some(PathBuf::from("/cache/snapshots/abc/config.json")));
    assert!(task.error.is_none());
    assert!(task.ended_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fetch_error_fails_task() {
    let (manager, _fetcher) = setup(ManagerConfig::default());

    let id = manager.enqueue(DownloadRequest::new("bert-base-uncased", "missing.bin")).unwrap();
    let task = wait_terminal(&manager, &id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    let error = task.error.unwrap();
    assert!(!error.is_empty());
    assert!(error.contains("missing.bin"));
    assert!(task.result_path.is_none());
    assert!(task.progress < 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_fetch_fails_task() {
    // One worker: the next download only runs if the panic released the permit.
    let (manager, _fetcher) = setup(with_workers(1));

    let id = manager.enqueue(DownloadRequest::new("gpt2", "panic.bin")).unwrap();
    let task = wait_terminal(&manager, &id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("Internal failure: fetch worker panicked"));
    assert!(task.result_path.is_none());
    assert!(task.ended_at.is_some());

    let next = manager.enqueue(DownloadRequest::new("gpt2", "config.json")).unwrap();
    assert_eq!(wait_terminal(&manager, &next).await.status, TaskStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_get_is_idempotent() {
    let (manager, _fetcher) = setup(ManagerConfig::default());

    let id = manager.enqueue(DownloadRequest::new("gpt2", "config.json")).unwrap();
    wait_terminal(&manager, &id).await;

    assert_eq!(manager.get(&id).unwrap(), manager.get(&id).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_id_is_not_found() {
    let (manager, _fetcher) = setup(ManagerConfig::default());

    assert!(matches!(manager.cancel("nonexistent-id"), Err(TaskError::NotFound(_))));
    assert!(matches!(manager.get("nonexistent-id"), Err(TaskError::NotFound(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalid_request_registers_nothing() {
    let (manager, fetcher) = setup(ManagerConfig::default());

    let err = manager.enqueue(DownloadRequest::new("", "config.json")).unwrap_err();
    assert_eq!(err, TaskError::InvalidArgument("repo_id and filename are required".to_string()));
    assert!(manager.enqueue(DownloadRequest::new("gpt2", "  ")).is_err());

    assert!(manager.list().is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
}

// =============================================================================
// CANCELLATION
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_immediately_after_enqueue_stays_cancelled() {
    let (manager, fetcher) = setup(ManagerConfig::default());

    let id = manager.enqueue(DownloadRequest::new("gpt2", "config.json")).unwrap();
    assert_eq!(manager.cancel(&id).unwrap(), TaskStatus::Cancelled);

    // Whatever the fetch does (if it got to start at all), it must not show.
    for _ in 0..20 {
        let task = manager.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.result_path.is_none());
        assert!(task.error.is_none());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let started = fetcher.calls.load(Ordering::SeqCst);
    wait_fetches_finished(&fetcher, started).await;
    assert_eq!(manager.get(&id).unwrap().status, TaskStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_pending_never_fetches() {
    let (manager, fetcher) = setup(with_workers(1));

    let blocker = manager.enqueue(DownloadRequest::new("gpt2", "gated.bin")).unwrap();
    wait_until(&manager, &blocker, |t| t.status == TaskStatus::Running).await;

    let queued = manager.enqueue(DownloadRequest::new("gpt2", "queued.bin")).unwrap();
    assert_eq!(manager.get(&queued).unwrap().status, TaskStatus::Pending);
    assert_eq!(manager.cancel(&queued).unwrap(), TaskStatus::Cancelled);

    fetcher.gate.open();
    assert_eq!(wait_terminal(&manager, &blocker).await.status, TaskStatus::Completed);

    // Give the worker a chance to (wrongly) pick up the cancelled task.
    let next = manager.enqueue(DownloadRequest::new("gpt2", "after.bin")).unwrap();
    wait_terminal(&manager, &next).await;

    assert_eq!(fetcher.fetched("queued.bin"), 0);
    assert_eq!(manager.get(&queued).unwrap().status, TaskStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_running_discards_result() {
    let (manager, fetcher) = setup(ManagerConfig::default());

    let id = manager.enqueue(DownloadRequest::new("gpt2", "gated.bin")).unwrap();
    wait_until(&manager, &id, |t| t.status == TaskStatus::Running).await;
    wait_until(&manager, &id, |_| fetcher.calls.load(Ordering::SeqCst) == 1).await;

    assert_eq!(manager.cancel(&id).unwrap(), TaskStatus::Cancelled);
    let cancelled = manager.get(&id).unwrap();
    assert!(cancelled.ended_at.is_some());

    fetcher.gate.open();
    wait_fetches_finished(&fetcher, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let task = manager.get(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.result_path.is_none());
    assert_ne!(task.progress, 100);
    assert_eq!(task.ended_at, cancelled.ended_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_finished_task_is_noop() {
    let (manager, _fetcher) = setup(ManagerConfig::default());

    let done = manager.enqueue(DownloadRequest::new("gpt2", "config.json")).unwrap();
    let failed = manager.enqueue(DownloadRequest::new("gpt2", "missing.bin")).unwrap();
    let done_task = wait_terminal(&manager, &done).await;
    wait_terminal(&manager, &failed).await;

    assert_eq!(manager.cancel(&done).unwrap(), TaskStatus::Completed);
    assert_eq!(manager.cancel(&failed).unwrap(), TaskStatus::Failed);
    assert_eq!(manager.get(&done).unwrap(), done_task);

    // Cancelling twice reports the same terminal state.
    let id = manager.enqueue(DownloadRequest::new("gpt2", "other.json")).unwrap();
    manager.cancel(&id).unwrap();
    assert_eq!(manager.cancel(&id).unwrap(), TaskStatus::Cancelled);
}

// =============================================================================
// WORKER POOL & PROGRESS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_cap_is_respected() {
    let (manager, fetcher) = setup(with_workers(2));

    let ids: Vec<String> = (0..6)
        .map(|i| manager.enqueue(DownloadRequest::new("gpt2", format!("gated-{}.bin", i))).unwrap())
        .collect();

    timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        while fetcher.calls.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let running = manager.list().iter().filter(|t| t.status == TaskStatus::Running).count();
    assert_eq!(running, 2);
    assert_eq!(manager.active_count(), 6);

    fetcher.gate.open();
    for id in &ids {
        assert_eq!(wait_terminal(&manager, id).await.status, TaskStatus::Completed);
    }
    assert!(fetcher.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 6);
    assert_eq!(manager.active_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_progress_only_increases() {
    let (manager, fetcher) = setup(ManagerConfig::default());

    let id = manager.enqueue(DownloadRequest::new("gpt2", "gated-progress.bin")).unwrap();
    let task = wait_until(&manager, &id, |t| t.progress >= 50).await;
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.progress, 50);

    // The later 30% report must not pull it back.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(manager.get(&id).unwrap().progress, 50);

    fetcher.gate.open();
    let task = wait_terminal(&manager, &id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100);
}

// =============================================================================
// REGISTRY
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_enqueue_unique_ids() {
    let (manager, _fetcher) = setup(ManagerConfig::default());

    let mut handles = Vec::with_capacity(CONCURRENCY_LEVEL);
    for i in 0..CONCURRENCY_LEVEL {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager.enqueue(DownloadRequest::new("gpt2", format!("file-{}.json", i))).unwrap()
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap());
    }
    assert_eq!(ids.len(), CONCURRENCY_LEVEL);

    for id in &ids {
        assert_eq!(wait_terminal(&manager, id).await.status, TaskStatus::Completed);
    }
    let listed: HashSet<String> = manager.list().into_iter().map(|t| t.id).collect();
    assert_eq!(listed, ids);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_list_is_oldest_first() {
    let (manager, _fetcher) = setup(ManagerConfig::default());

    let first = manager.enqueue(DownloadRequest::new("gpt2", "a.json")).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = manager.enqueue(DownloadRequest::new("gpt2", "b.json")).unwrap();

    let listed: Vec<String> = manager.list().into_iter().map(|t| t.id).collect();
    assert_eq!(listed, vec![first, second]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_finished_tasks_evicted_past_capacity() {
    let config = ManagerConfig {
        max_tasks: 2,
        ..ManagerConfig::default()
    };
    let (manager, _fetcher) = setup(config);

    let oldest = manager.enqueue(DownloadRequest::new("gpt2", "a.json")).unwrap();
    wait_terminal(&manager, &oldest).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let middle = manager.enqueue(DownloadRequest::new("gpt2", "b.json")).unwrap();
    wait_terminal(&manager, &middle).await;

    let newest = manager.enqueue(DownloadRequest::new("gpt2", "c.json")).unwrap();

    assert!(matches!(manager.get(&oldest), Err(TaskError::NotFound(_))));
    assert!(manager.get(&middle).is_ok());
    assert!(manager.get(&newest).is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expired_tasks_evicted() {
    let config = ManagerConfig {
        task_ttl: Duration::from_millis(10),
        ..ManagerConfig::default()
    };
    let (manager, _fetcher) = setup(config);

    let old = manager.enqueue(DownloadRequest::new("gpt2", "a.json")).unwrap();
    wait_terminal(&manager, &old).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fresh = manager.enqueue(DownloadRequest::new("gpt2", "b.json")).unwrap();
    assert!(matches!(manager.get(&old), Err(TaskError::NotFound(_))));
    assert!(manager.get(&fresh).is_ok());
}
