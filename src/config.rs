// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration for hfcache.
//!
//! Settings come from `{config_dir}/hfcache/config.json` when it exists,
//! then CLI flags override individual fields. The cache directory and hub
//! endpoint also honor the usual `HF_*` environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default hub endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// Default port for the HTTP service.
pub const DEFAULT_PORT: u16 = 5000;

/// Persistent settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Port to listen on.
    pub port: u16,
    /// Address to bind to (defaults to 127.0.0.1, local only).
    pub bind_address: String,
    /// Cache directory. Resolved from the environment when unset.
    pub cache_dir: Option<PathBuf>,
    /// Directory holding the built front end.
    pub static_dir: PathBuf,
    /// Hub endpoint. Falls back to `HF_ENDPOINT`, then the public hub.
    pub endpoint: Option<String>,
    /// Access token for gated or private repos. Falls back to `HF_TOKEN`.
    pub token: Option<String>,
    /// Number of fetches allowed to run at the same time.
    pub max_concurrent_downloads: usize,
    /// Registry size above which finished tasks are evicted.
    pub max_tasks: usize,
    /// How long a finished task stays queryable.
    pub task_ttl_secs: u64,
    /// Timeout for a single file transfer.
    pub fetch_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: "127.0.0.1".to_string(),
            cache_dir: None,
            static_dir: PathBuf::from("frontend/dist"),
            endpoint: None,
            token: None,
            max_concurrent_downloads: 4,
            max_tasks: 512,
            task_ttl_secs: 3600,
            fetch_timeout_secs: 3600,
        }
    }
}

impl Config {
    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hfcache")
            .join("config.json")
    }

    /// Load the config from `path`, or from [`Config::default_path`].
    ///
    /// A missing file is not an error; it yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Cache directory after applying environment fallbacks.
    pub fn resolved_cache_dir(&self) -> PathBuf {
        resolve_cache_dir(self.cache_dir.as_deref(), |key| std::env::var(key).ok())
    }

    /// Hub endpoint after applying environment fallbacks, without a trailing slash.
    pub fn resolved_endpoint(&self) -> String {
        self.endpoint
            .clone()
            .or_else(|| std::env::var("HF_ENDPOINT").ok())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
            .trim_end_matches('/')
            .to_string()
    }

    /// Access token after applying environment fallbacks.
    pub fn resolved_token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| std::env::var("HF_TOKEN").ok())
            .filter(|t| !t.trim().is_empty())
    }

    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Resolve the hub cache directory.
///
/// Order: explicit path, `HF_HUB_CACHE`, `$HF_HOME/hub`, `~/.cache/huggingface/hub`.
pub fn resolve_cache_dir<F>(explicit: Option<&Path>, env: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(hub_cache) = env("HF_HUB_CACHE").filter(|v| !v.is_empty()) {
        return PathBuf::from(hub_cache);
    }
    if let Some(home) = env("HF_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home).join("hub");
    }
    dirs::home_dir()
        .map(|h| h.join(".cache").join("huggingface").join("hub"))
        .unwrap_or_else(|| PathBuf::from(".cache/huggingface/hub"))
}
