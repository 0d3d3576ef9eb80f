// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Asynchronous download tracking for hfcache
//!
//! This module runs file downloads in the background with:
//! - Progress visibility via `GET /api/cache/download/{id}/progress`
//! - Cancellation (clean before the fetch starts, best effort after)
//! - A bounded worker pool
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │ DownloadManager │────▶│ run_task        │
//! │   (registry)    │     │ (tokio task)    │
//! └────────┬────────┘     └────────┬────────┘
//!          │                       │ spawn_blocking
//!          ▼                       ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ DownloadTask    │     │ Fetcher         │
//! │ (snapshots)     │     │ (HubFetcher)    │
//! └─────────────────┘     └─────────────────┘
//! ```

pub mod fetcher;
pub mod manager;
pub mod types;

// Re-export commonly used items
pub use fetcher::{FetchError, FetchProgress, Fetcher, HubFetcher};
pub use manager::{DownloadManager, ManagerConfig};
pub use types::{DownloadRequest, DownloadTask, RepoType, TaskStatus, DEFAULT_REVISION};
