// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP server
//!
//! Serves the cache manager's REST API and the web front end.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /api/cache/stats` - Cache totals
//! - `GET /api/cache/files` - Cached repositories
//! - `POST /api/cache/clear` - Delete every cached repository
//! - `DELETE /api/cache/remove/{repo}` - Delete one repository
//! - `POST /api/cache/download` - Start a download
//! - `GET /api/cache/downloads` - All tracked downloads
//! - `GET /api/cache/download/{id}/progress` - One download's state
//! - `DELETE /api/cache/download/{id}` - Cancel a download
//!
//! Everything else is the front end: files under `assets/` and `static/`
//! come from the static directory, any other path gets `index.html`.
//!
//! # Example
//!
//! ```no_run
//! use hfcache::config::Config;
//! use hfcache::server::Server;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = Server::from_config(Config::default()).with_port(5000);
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{StatusCode, Uri},
    response::{Html, IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::cache::{CacheError, CacheIndex};
use crate::config::Config;
use crate::download::{DownloadManager, DownloadRequest, DownloadTask, Fetcher, HubFetcher, ManagerConfig, RepoType, TaskStatus};
use crate::errors::ApiError;
use crate::utils::format_size;

// Maximum request body size (64 KiB); requests only carry small JSON bodies
const MAX_BODY_SIZE: usize = 64 * 1024;
// Per-request timeout
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Page served when the front end has not been built.
const PLACEHOLDER_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Hugging Face Cache Manager</title>
</head>
<body>
    <h1>Backend server running</h1>
    <p>Frontend not built yet. Please run:</p>
    <pre>cd frontend &amp;&amp; npm run build</pre>
</body>
</html>
"#;

/// Server state shared across handlers.
pub struct AppState {
    /// Cache directory scanner.
    pub cache: CacheIndex,
    /// Download task manager.
    pub downloads: DownloadManager,
    /// Directory holding the built front end.
    pub static_dir: PathBuf,
}

impl AppState {
    pub fn new(cache: CacheIndex, downloads: DownloadManager, static_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache,
            downloads,
            static_dir: static_dir.into(),
        }
    }
}

/// API server configuration.
pub struct Server {
    config: Config,
    /// Overrides the hub fetcher built from `config`.
    fetcher: Option<Arc<dyn Fetcher>>,
}

impl Server {
    /// Create a server from loaded configuration.
    pub fn from_config(config: Config) -> Self {
        Self { config, fetcher: None }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the bind address.
    /// Use "0.0.0.0" to allow network access, "127.0.0.1" (default) for localhost only.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_address = addr.into();
        self
    }

    /// Use a custom fetcher instead of the hub client.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Build the shared state. Must run inside a tokio runtime.
    pub fn build_state(&self) -> Result<Arc<AppState>> {
        let cache_dir = self.config.resolved_cache_dir();
        let fetcher = match &self.fetcher {
            Some(fetcher) => fetcher.clone(),
            None => Arc::new(HubFetcher::from_config(&self.config)),
        };
        let downloads = DownloadManager::new(fetcher, ManagerConfig::from(&self.config))?;

        Ok(Arc::new(AppState::new(
            CacheIndex::new(cache_dir),
            downloads,
            self.config.static_dir.clone(),
        )))
    }

    /// Start the server with graceful shutdown.
    pub async fn start(&self) -> Result<()> {
        let state = self.build_state()?;
        let router = build_router(state.clone());
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);

        tracing::info!("Cache directory: {}", state.cache.cache_dir().display());
        tracing::info!("Starting server on http://{}", addr);

        if self.config.bind_address == "0.0.0.0" {
            tracing::warn!(
                "Server is binding to 0.0.0.0 which exposes cache deletion to the network. \
                Use 127.0.0.1 (default) for local-only access."
            );
        }

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. Another hfcache server may be running; \
                    stop it or pick a different port with --port <PORT>",
                    self.config.port
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        let abandoned = state.downloads.active_count();
        if abandoned > 0 {
            tracing::warn!("Shutting down with {} downloads still in progress", abandoned);
        }
        Ok(())
    }
}

/// Build the router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let assets = ServeDir::new(state.static_dir.join("assets"));
    let static_files = ServeDir::new(state.static_dir.join("static"));

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/cache/stats", get(cache_stats_handler))
        .route("/api/cache/files", get(cache_files_handler))
        .route("/api/cache/clear", post(cache_clear_handler))
        .route("/api/cache/remove/*repo", delete(cache_remove_handler))
        .route("/api/cache/download", post(start_download_handler))
        .route("/api/cache/downloads", get(list_downloads_handler))
        .route("/api/cache/download/:id/progress", get(download_progress_handler))
        .route("/api/cache/download/:id", delete(cancel_download_handler))
        .nest_service("/assets", assets)
        .nest_service("/static", static_files)
        .fallback(frontend_handler)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    cache_dir: String,
    active_downloads: usize,
}

/// Cache totals.
#[derive(Serialize)]
struct StatsResponse {
    size: u64,
    size_formatted: String,
    folders: usize,
    files: usize,
    last_updated: String,
}

/// One cached repository in the file listing.
#[derive(Serialize)]
struct FileEntry {
    path: String,
    size: u64,
    size_formatted: String,
    last_accessed: Option<String>,
    folder: String,
    repo_id: String,
    repo_type: RepoType,
    nb_files: usize,
}

#[derive(Serialize)]
struct FilesResponse {
    files: Vec<FileEntry>,
    total_count: usize,
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Serialize)]
struct ClearResponse {
    message: String,
    removed: usize,
    freed: u64,
    freed_formatted: String,
}

/// Download request body. Every field is optional here so that missing
/// fields produce our own 400 message rather than a deserializer error.
#[derive(Deserialize, Default)]
struct StartDownloadRequest {
    #[serde(default)]
    repo_id: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    revision: Option<String>,
    #[serde(default)]
    repo_type: Option<String>,
}

#[derive(Serialize)]
struct StartDownloadResponse {
    download_id: String,
    message: &'static str,
}

#[derive(Serialize)]
struct DownloadsResponse {
    downloads: Vec<DownloadTask>,
    total_count: usize,
}

#[derive(Serialize)]
struct CancelResponse {
    message: String,
    status: TaskStatus,
}

// =============================================================================
// Handlers
// =============================================================================

/// Run a cache operation on the blocking pool.
async fn run_blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, CacheError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::from)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        cache_dir: state.cache.cache_dir().display().to_string(),
        active_downloads: state.downloads.active_count(),
    })
}

async fn cache_stats_handler(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>, ApiError> {
    let cache = state.cache.clone();
    let snapshot = run_blocking(move || cache.snapshot()).await?;

    Ok(Json(StatsResponse {
        size: snapshot.size_on_disk,
        size_formatted: format_size(snapshot.size_on_disk),
        folders: snapshot.repos.len(),
        files: snapshot.total_files(),
        last_updated: Utc::now().to_rfc3339(),
    }))
}

async fn cache_files_handler(State(state): State<Arc<AppState>>) -> Result<Json<FilesResponse>, ApiError> {
    let cache = state.cache.clone();
    let snapshot = run_blocking(move || cache.snapshot()).await?;

    let files: Vec<FileEntry> = snapshot
        .repos
        .into_iter()
        .map(|repo| {
            let path = repo.repo_path.display().to_string();
            FileEntry {
                folder: path.clone(),
                path,
                size: repo.size_on_disk,
                size_formatted: format_size(repo.size_on_disk),
                last_accessed: repo.last_accessed.map(|t| t.to_rfc3339()),
                repo_id: repo.repo_id,
                repo_type: repo.repo_type,
                nb_files: repo.nb_files,
            }
        })
        .collect();

    Ok(Json(FilesResponse {
        total_count: files.len(),
        files,
    }))
}

async fn cache_clear_handler(State(state): State<Arc<AppState>>) -> Result<Json<ClearResponse>, ApiError> {
    let cache = state.cache.clone();
    let summary = run_blocking(move || cache.clear()).await?;

    Ok(Json(ClearResponse {
        message: "Cache cleared successfully".to_string(),
        removed: summary.removed,
        freed: summary.freed,
        freed_formatted: format_size(summary.freed),
    }))
}

async fn cache_remove_handler(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let cache = state.cache.clone();
    let removed = run_blocking(move || cache.remove(&repo)).await?;

    Ok(Json(MessageResponse {
        message: format!("Repository {} removed successfully", removed.repo_id),
    }))
}

/// Start a download. Malformed JSON counts as missing fields.
async fn start_download_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<StartDownloadResponse>), ApiError> {
    let body: StartDownloadRequest = serde_json::from_slice(&body).unwrap_or_default();

    let mut request = DownloadRequest::new(
        body.repo_id.unwrap_or_default(),
        body.filename.unwrap_or_default(),
    );
    if let Some(revision) = body.revision {
        request = request.with_revision(revision);
    }
    if let Some(repo_type) = body.repo_type {
        request = request.with_repo_type(repo_type.parse()?);
    }

    let download_id = state.downloads.enqueue(request)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartDownloadResponse {
            download_id,
            message: "Download started",
        }),
    ))
}

async fn list_downloads_handler(State(state): State<Arc<AppState>>) -> Json<DownloadsResponse> {
    let downloads = state.downloads.list();
    Json(DownloadsResponse {
        total_count: downloads.len(),
        downloads,
    })
}

async fn download_progress_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DownloadTask>, ApiError> {
    Ok(Json(state.downloads.get(&id)?))
}

async fn cancel_download_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let status = state.downloads.cancel(&id)?;
    let message = match status {
        TaskStatus::Cancelled => "Download cancelled".to_string(),
        other => format!("Download already {}", other),
    };
    Ok(Json(CancelResponse { message, status }))
}

/// Serve the single-page front end for any non-API path.
async fn frontend_handler(State(state): State<Arc<AppState>>, uri: Uri) -> Response {
    let path = uri.path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::NotFound("Not Found".to_string()).into_response();
    }

    let index = state.static_dir.join("index.html");
    match tokio::fs::read_to_string(&index).await {
        Ok(content) => Html(content).into_response(),
        Err(_) => Html(PLACEHOLDER_PAGE).into_response(),
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
    }
}
