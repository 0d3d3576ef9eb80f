// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! hfcache - Hugging Face cache manager library
//!
//! Inspect, prune and fill a local Hugging Face hub cache, either from the
//! command line or through a small HTTP service backing a web front end.
//!
//! # Core Modules
//!
//! - [`cache`] - Scanning and deleting cached repositories
//! - [`download`] - Background downloads with progress and cancellation
//! - [`server`] - HTTP API and front-end hosting
//! - [`config`] - Settings file and environment resolution
//! - [`errors`] - Task and HTTP error types

pub mod cache;
pub mod config;
pub mod download;
pub mod errors;
pub mod locks;
pub mod server;
pub mod utils;

pub use cache::{CacheError, CacheIndex, CacheSnapshot, CachedRepo};
pub use config::Config;
pub use download::{
    DownloadManager, DownloadRequest, DownloadTask, FetchError, Fetcher, HubFetcher, ManagerConfig,
    RepoType, TaskStatus,
};
pub use errors::{ApiError, TaskError};
pub use server::Server;
pub use utils::format_size;
