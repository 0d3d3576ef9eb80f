// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Fetching a single file from the hub into the cache directory.
//!
//! [`Fetcher`] is the seam the download manager talks to: one blocking call,
//! one file, a local path back. [`HubFetcher`] is the real implementation and
//! writes the same layout the hub's own tooling uses:
//!
//! ```text
//! {cache}/models--owner--name/
//!     blobs/{etag}                      file content
//!     snapshots/{commit}/{filename}     symlink to ../../blobs/{etag}
//!     refs/{revision}                   commit hash
//! ```

use rand::Rng;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_LENGTH, LOCATION};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use super::types::DownloadRequest;
use crate::config::Config;
use crate::utils::mask_sensitive;

/// Timeout for the metadata request.
const HEAD_TIMEOUT_SECS: u64 = 30;

/// Maximum number of same-host redirects followed while resolving metadata.
const MAX_METADATA_REDIRECTS: usize = 5;

/// Read buffer for file transfers.
const CHUNK_SIZE: usize = 64 * 1024;

/// Byte-level progress reported during a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

impl FetchProgress {
    /// Percentage complete, when the total size is known.
    pub fn percent(&self) -> Option<u8> {
        match self.total {
            Some(0) => Some(100),
            Some(total) => Some(((self.downloaded.min(total) * 100) / total) as u8),
            None => None,
        }
    }
}

/// Why a fetch failed. Stored on the task as its display string.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Entry not found: {0}")]
    NotFound(String),
    #[error("Access denied to {0} (gated or private repository, check your token)")]
    Unauthorized(String),
    #[error("HTTP {status} from hub: {message}")]
    Http { status: u16, message: String },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Unexpected hub response: {0}")]
    Protocol(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Network(format!("request timed out: {}", e))
        } else if e.is_connect() {
            FetchError::Network(format!("cannot connect to hub: {}", e))
        } else {
            FetchError::Network(e.to_string())
        }
    }
}

/// A blocking, single-file fetch primitive.
///
/// Implementations must not assume they run on an async runtime thread; the
/// manager always calls them from `spawn_blocking`. There is no interruption
/// hook: once called, a fetch runs to completion or failure.
pub trait Fetcher: Send + Sync + 'static {
    /// Retrieve `request.filename` from `request.repo_id` into the cache and
    /// return its local path. `progress` may be called any number of times.
    fn fetch(
        &self,
        request: &DownloadRequest,
        progress: &dyn Fn(FetchProgress),
    ) -> Result<PathBuf, FetchError>;
}

/// Metadata resolved from the hub for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileMetadata {
    commit: String,
    etag: String,
    size: Option<u64>,
}

/// Fetcher for a hub-compatible HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HubFetcher {
    cache_dir: PathBuf,
    endpoint: String,
    token: Option<String>,
    timeout: Duration,
}

impl HubFetcher {
    /// Create a fetcher writing into `cache_dir`, talking to `endpoint`.
    pub fn new(cache_dir: impl Into<PathBuf>, endpoint: impl Into<String>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: None,
            timeout: Duration::from_secs(3600),
        }
    }

    /// Build from resolved configuration.
    pub fn from_config(config: &Config) -> Self {
        let mut fetcher = Self::new(config.resolved_cache_dir(), config.resolved_endpoint())
            .with_timeout(config.fetch_timeout());
        if let Some(token) = config.resolved_token() {
            tracing::info!("Using hub token {}", mask_sensitive(&token, 6));
            fetcher = fetcher.with_token(token);
        }
        fetcher
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Build a client for this call.
    ///
    /// Blocking clients own a private runtime and must not be dropped on an
    /// async thread, so they live only as long as one fetch on the blocking pool.
    fn client(&self, follow_redirects: bool, timeout: Duration) -> Result<Client, FetchError> {
        let policy = if follow_redirects { Policy::limited(10) } else { Policy::none() };
        Client::builder()
            .redirect(policy)
            .timeout(timeout)
            .user_agent(concat!("hfcache/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FetchError::from)
    }

    fn resolve_url(&self, request: &DownloadRequest) -> String {
        format!(
            "{}/{}{}/resolve/{}/{}",
            self.endpoint,
            request.repo_type.url_prefix(),
            request.repo_id,
            request.revision.replace('/', "%2F"),
            request.filename
        )
    }

    fn authorize(&self, builder: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.token {
            Some(token) => builder.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => builder,
        }
    }

    /// Resolve commit, etag and size with a HEAD request.
    fn fetch_metadata(&self, request: &DownloadRequest) -> Result<FileMetadata, FetchError> {
        let client = self.client(false, Duration::from_secs(HEAD_TIMEOUT_SECS))?;
        let mut url = self.resolve_url(request);
        let target = format!("{}/{}", request.repo_id, request.filename);

        for _ in 0..=MAX_METADATA_REDIRECTS {
            let response = self
                .authorize(client.head(&url).header("Accept-Encoding", "identity"))
                .send()?;
            check_status(&response, &target)?;

            // Renamed repos answer with a same-host relative redirect; follow it.
            // Files stored out of band answer with a CDN redirect that already
            // carries the metadata headers.
            if response.status().is_redirection() {
                if let Some(location) = header_str(response.headers(), LOCATION.as_str()) {
                    if location.starts_with('/') {
                        url = format!("{}{}", self.endpoint, location);
                        continue;
                    }
                }
            }

            return parse_metadata(response.headers());
        }

        Err(FetchError::Protocol(format!("too many redirects resolving {}", target)))
    }

    /// Stream the file body into `dest`, reporting progress.
    fn download_blob(
        &self,
        request: &DownloadRequest,
        dest: &Path,
        expected_size: Option<u64>,
        progress: &dyn Fn(FetchProgress),
    ) -> Result<(), FetchError> {
        let client = self.client(true, self.timeout)?;
        let target = format!("{}/{}", request.repo_id, request.filename);
        let mut response = self.authorize(client.get(self.resolve_url(request))).send()?;
        check_status(&response, &target)?;

        let total = expected_size.or_else(|| response.content_length());
        let parent = dest.parent().ok_or_else(|| {
            FetchError::Protocol(format!("blob path has no parent: {}", dest.display()))
        })?;
        fs::create_dir_all(parent)?;

        let incomplete = incomplete_path(dest);
        let result = (|| -> Result<(), FetchError> {
            let mut writer = BufWriter::new(File::create(&incomplete)?);
            let mut buffer = vec![0u8; CHUNK_SIZE];
            let mut downloaded = 0u64;
            progress(FetchProgress { downloaded, total });

            loop {
                let read = response.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                writer.write_all(&buffer[..read])?;
                downloaded += read as u64;
                progress(FetchProgress { downloaded, total });
            }
            writer.flush()?;

            if let Some(expected) = total {
                if downloaded != expected {
                    return Err(FetchError::Protocol(format!(
                        "size mismatch for {}: expected {} bytes, got {}",
                        target, expected, downloaded
                    )));
                }
            }
            fs::rename(&incomplete, dest)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&incomplete);
        }
        result
    }
}

impl Fetcher for HubFetcher {
    fn fetch(
        &self,
        request: &DownloadRequest,
        progress: &dyn Fn(FetchProgress),
    ) -> Result<PathBuf, FetchError> {
        let metadata = self.fetch_metadata(request)?;
        let repo_dir = self.cache_dir.join(repo_folder_name(request));
        let blob_path = repo_dir.join("blobs").join(&metadata.etag);
        let pointer_path = repo_dir
            .join("snapshots")
            .join(&metadata.commit)
            .join(&request.filename);

        if blob_path.exists() {
            tracing::debug!(
                "Blob for {}/{} already cached, skipping transfer",
                request.repo_id,
                request.filename
            );
            let size = fs::metadata(&blob_path)?.len();
            progress(FetchProgress { downloaded: size, total: Some(size) });
        } else {
            self.download_blob(request, &blob_path, metadata.size, progress)?;
        }

        link_snapshot(&blob_path, &pointer_path, &request.filename)?;

        if request.revision != metadata.commit {
            let ref_path = repo_dir.join("refs").join(&request.revision);
            if let Some(parent) = ref_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&ref_path, &metadata.commit)?;
        }

        Ok(pointer_path)
    }
}

/// Cache folder name for a request, e.g. `models--google--bert`.
pub fn repo_folder_name(request: &DownloadRequest) -> String {
    format!(
        "{}--{}",
        request.repo_type.folder_prefix(),
        request.repo_id.replace('/', "--")
    )
}

fn check_status(response: &Response, target: &str) -> Result<(), FetchError> {
    let status = response.status();
    if status.is_success() || status.is_redirection() {
        return Ok(());
    }
    match status {
        StatusCode::NOT_FOUND => Err(FetchError::NotFound(target.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(FetchError::Unauthorized(target.to_string()))
        }
        _ => {
            let message = header_str(response.headers(), "x-error-message")
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());
            Err(FetchError::Http { status: status.as_u16(), message })
        }
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Strip weak-validator prefix and quotes from an etag.
fn normalize_etag(raw: &str) -> String {
    raw.trim().trim_start_matches("W/").trim_matches('"').to_string()
}

fn parse_metadata(headers: &HeaderMap) -> Result<FileMetadata, FetchError> {
    let commit = header_str(headers, "x-repo-commit")
        .ok_or_else(|| FetchError::Protocol("missing X-Repo-Commit header".to_string()))?;
    let etag = header_str(headers, "x-linked-etag")
        .or_else(|| header_str(headers, "etag"))
        .map(|e| normalize_etag(&e))
        .filter(|e| !e.is_empty())
        .ok_or_else(|| FetchError::Protocol("missing ETag header".to_string()))?;
    for (name, value) in [("X-Repo-Commit", &commit), ("ETag", &etag)] {
        if !is_single_component(value) {
            return Err(FetchError::Protocol(format!("invalid {} header: {:?}", name, value)));
        }
    }
    let size = header_str(headers, "x-linked-size")
        .or_else(|| header_str(headers, CONTENT_LENGTH.as_str()))
        .and_then(|s| s.parse().ok());

    Ok(FileMetadata { commit, etag, size })
}

/// Commit and etag values become file names under the repo folder.
fn is_single_component(value: &str) -> bool {
    !value.contains(['/', '\\']) && !value.contains("..")
}

fn incomplete_path(dest: &Path) -> PathBuf {
    let suffix: u32 = rand::thread_rng().gen();
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!("{}.{:08x}.incomplete", name, suffix))
}

/// Relative path from a snapshot pointer to its blob.
///
/// `snapshots/{commit}/a/b.bin` needs to climb the commit directory, the
/// `snapshots` directory and one level per nested filename component.
fn relative_blob_target(filename: &str, etag: &str) -> PathBuf {
    let depth = 2 + filename.split('/').filter(|p| !p.is_empty()).count().saturating_sub(1);
    let mut target = PathBuf::new();
    for _ in 0..depth {
        target.push("..");
    }
    target.push("blobs");
    target.push(etag);
    target
}

fn link_snapshot(blob: &Path, pointer: &Path, filename: &str) -> Result<(), FetchError> {
    if let Some(parent) = pointer.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::symlink_metadata(pointer).is_ok() {
        fs::remove_file(pointer)?;
    }

    #[cfg(unix)]
    {
        let etag = blob
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        std::os::unix::fs::symlink(relative_blob_target(filename, &etag), pointer)?;
    }

    #[cfg(not(unix))]
    {
        let _ = filename;
        fs::copy(blob, pointer)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::types::RepoType;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_progress_percent() {
        assert_eq!(FetchProgress { downloaded: 50, total: Some(200) }.percent(), Some(25));
        assert_eq!(FetchProgress { downloaded: 10, total: None }.percent(), None);
        assert_eq!(FetchProgress { downloaded: 0, total: Some(0) }.percent(), Some(100));
        assert_eq!(FetchProgress { downloaded: 300, total: Some(200) }.percent(), Some(100));
    }

    #[test]
    fn test_repo_folder_name() {
        let req = DownloadRequest::new("google/bert-base-uncased", "config.json");
        assert_eq!(repo_folder_name(&req), "models--google--bert-base-uncased");

        let req = DownloadRequest::new("squad", "README.md").with_repo_type(RepoType::Dataset);
        assert_eq!(repo_folder_name(&req), "datasets--squad");
    }

    #[test]
    fn test_resolve_url() {
        let fetcher = HubFetcher::new("/tmp/cache", "https://hub.example.com/");
        let req = DownloadRequest::new("org/model", "onnx/model.onnx").with_revision("refs/pr/1");
        assert_eq!(
            fetcher.resolve_url(&req),
            "https://hub.example.com/org/model/resolve/refs%2Fpr%2F1/onnx/model.onnx"
        );

        let req = DownloadRequest::new("squad", "data.json").with_repo_type(RepoType::Dataset);
        assert_eq!(
            fetcher.resolve_url(&req),
            "https://hub.example.com/datasets/squad/resolve/main/data.json"
        );
    }

    #[test]
    fn test_parse_metadata_prefers_linked_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-repo-commit", HeaderValue::from_static("abc123"));
        headers.insert("etag", HeaderValue::from_static("\"small\""));
        headers.insert("x-linked-etag", HeaderValue::from_static("\"sha256deadbeef\""));
        headers.insert("x-linked-size", HeaderValue::from_static("4096"));
        headers.insert("content-length", HeaderValue::from_static("1100"));

        let meta = parse_metadata(&headers).unwrap();
        assert_eq!(meta.commit, "abc123");
        assert_eq!(meta.etag, "sha256deadbeef");
        assert_eq!(meta.size, Some(4096));
    }

    #[test]
    fn test_parse_metadata_requires_commit() {
        let mut headers = HeaderMap::new();
        headers.insert("etag", HeaderValue::from_static("W/\"abc\""));
        assert!(matches!(parse_metadata(&headers), Err(FetchError::Protocol(_))));
    }

    #[test]
    fn test_parse_metadata_rejects_path_like_values() {
        let cases = [
            ("../../../../tmp", "\"abc\""),
            ("abc/def", "\"abc\""),
            ("abc123", "\"../escape\""),
            ("abc123", "\"a\\\\b\""),
        ];
        for (commit, etag) in cases {
            let mut headers = HeaderMap::new();
            headers.insert("x-repo-commit", HeaderValue::from_static(commit));
            headers.insert("etag", HeaderValue::from_static(etag));
            assert!(
                matches!(parse_metadata(&headers), Err(FetchError::Protocol(_))),
                "commit {:?} etag {:?}",
                commit,
                etag
            );
        }
    }

    #[test]
    fn test_normalize_etag() {
        assert_eq!(normalize_etag("W/\"abc\""), "abc");
        assert_eq!(normalize_etag("\"abc\""), "abc");
        assert_eq!(normalize_etag("abc"), "abc");
    }

    #[test]
    fn test_relative_blob_target() {
        assert_eq!(relative_blob_target("config.json", "e1"), PathBuf::from("../../blobs/e1"));
        assert_eq!(
            relative_blob_target("onnx/fp16/model.onnx", "e2"),
            PathBuf::from("../../../../blobs/e2")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_link_snapshot_resolves_to_blob() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("models--gpt2");
        let blob = repo.join("blobs").join("etag1");
        fs::create_dir_all(blob.parent().unwrap()).unwrap();
        fs::write(&blob, b"weights").unwrap();

        let pointer = repo.join("snapshots").join("c0ffee").join("sub").join("w.bin");
        link_snapshot(&blob, &pointer, "sub/w.bin").unwrap();
        assert_eq!(fs::read(&pointer).unwrap(), b"weights");

        // Relinking replaces the old pointer.
        link_snapshot(&blob, &pointer, "sub/w.bin").unwrap();
        assert_eq!(fs::read(&pointer).unwrap(), b"weights");
    }

    #[test]
    #[ignore]
    fn test_live_fetch_small_file() {
        let tmp = tempfile::tempdir().unwrap();
        let fetcher = HubFetcher::new(tmp.path(), crate::config::DEFAULT_ENDPOINT);
        let path = fetcher
            .fetch(&DownloadRequest::new("gpt2", "config.json"), &|_| {})
            .unwrap();
        assert!(path.exists());
    }
}
