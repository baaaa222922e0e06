//! Snapshot persistence, debug artifacts, browser auth state and Gist publishing.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use marginalia_core::Snapshot;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "marginalia-storage";

pub const DEFAULT_GIST_FILENAME: &str = "latest.json";
pub const GITHUB_API_BASE: &str = "https://api.github.com";
const GITHUB_API_VERSION: &str = "2022-11-28";

/// Source of a previously published snapshot.
pub trait SnapshotReader {
    fn read_snapshot(&self) -> anyhow::Result<Snapshot>;
}

/// Destination for a freshly built snapshot.
pub trait SnapshotWriter {
    fn write_snapshot(&self, snapshot: &Snapshot) -> anyhow::Result<()>;
}

/// Pretty JSON with two-space indentation; non-ASCII text is written as-is.
pub fn snapshot_to_pretty_json(snapshot: &Snapshot) -> anyhow::Result<String> {
    serde_json::to_string_pretty(snapshot).context("serializing snapshot")
}

#[derive(Debug, Clone)]
pub struct JsonSnapshotStore {
    path: PathBuf,
}

impl JsonSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

impl SnapshotReader for JsonSnapshotStore {
    fn read_snapshot(&self) -> anyhow::Result<Snapshot> {
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))
    }
}

impl SnapshotWriter for JsonSnapshotStore {
    fn write_snapshot(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let json = snapshot_to_pretty_json(snapshot)?;
        write_atomic(&self.path, json.as_bytes())?;
        info!(path = %self.path.display(), items = snapshot.items.len(), "saved snapshot");
        Ok(())
    }
}

/// Write through a sibling temp file and rename it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed dump of raw pages, kept for diagnosing selector breakage.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        label: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(label)
            .join(format!("{content_hash}.{ext}"))
    }

    pub fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        label: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(fetched_at, label, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = absolute_path.exists();
        if !deduplicated {
            write_atomic(&absolute_path, bytes)?;
        }

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

#[derive(Debug, Error)]
pub enum AuthStateError {
    #[error("auth state file not found at {0}")]
    Missing(PathBuf),
    #[error("invalid base64 auth state: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("auth state json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("auth state io: {0}")]
    Io(#[from] std::io::Error),
}

/// Browser session state in the Playwright `storage_state` layout, so files
/// produced by either tool can be swapped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageState {
    #[serde(default)]
    pub cookies: Vec<StoredCookie>,
    #[serde(default)]
    pub origins: Vec<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    /// Seconds since the epoch; -1 marks a session cookie.
    #[serde(default = "session_expiry")]
    pub expires: f64,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

fn session_expiry() -> f64 {
    -1.0
}

impl StorageState {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AuthStateError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(AuthStateError::Missing(path.to_path_buf()));
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self).context("serializing auth state")?;
        write_atomic(path.as_ref(), json.as_bytes())
    }
}

/// Decode a base64 auth state (as stored in a CI secret) into `path`.
pub fn install_auth_from_base64(encoded: &str, path: impl AsRef<Path>) -> Result<(), AuthStateError> {
    let path = path.as_ref();
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let decoded = base64::engine::general_purpose::STANDARD.decode(compact)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, decoded)?;
    info!(path = %path.display(), "decoded auth state");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct GistConfig {
    pub gist_id: String,
    pub token: String,
    pub api_base: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl GistConfig {
    pub fn new(gist_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            gist_id: gist_id.into(),
            token: token.into(),
            api_base: GITHUB_API_BASE.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: "marginalia/0.1".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("gist upload failed with http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("gist response has no raw_url for {0}")]
    MissingRawUrl(String),
    #[error("serializing snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct GistResponse {
    #[serde(default)]
    files: HashMap<String, GistFileResponse>,
}

#[derive(Debug, Deserialize)]
struct GistFileResponse {
    raw_url: Option<String>,
}

/// Stable (un-hashed) raw URL of a file in a gist.
pub fn gist_raw_url(gist_id: &str, filename: &str) -> String {
    format!("https://gist.githubusercontent.com/raw/{gist_id}/{filename}")
}

pub fn gist_patch_body(filename: &str, content: &str) -> JsonValue {
    serde_json::json!({
        "files": {
            filename: { "content": content }
        }
    })
}

fn raw_url_from_response(body: &[u8], filename: &str) -> Result<String, PublishError> {
    let parsed: GistResponse = serde_json::from_slice(body)?;
    parsed
        .files
        .get(filename)
        .and_then(|f| f.raw_url.clone())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| PublishError::MissingRawUrl(filename.to_string()))
}

/// Replaces one file of an existing gist with a snapshot.
#[derive(Debug)]
pub struct GistPublisher {
    client: reqwest::Client,
    config: GistConfig,
}

impl GistPublisher {
    pub fn new(config: GistConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    pub fn gist_url(&self) -> String {
        format!(
            "{}/gists/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.gist_id
        )
    }

    pub async fn publish(&self, filename: &str, snapshot: &Snapshot) -> Result<String, PublishError> {
        let content = serde_json::to_string_pretty(snapshot)?;
        let span = info_span!("gist_publish", gist_id = %self.config.gist_id, filename);
        self.patch_file(filename, &content).instrument(span).await
    }

    async fn patch_file(&self, filename: &str, content: &str) -> Result<String, PublishError> {
        let body = gist_patch_body(filename, content);
        let url = self.gist_url();
        let backoff = self.config.backoff;
        let mut attempt = 0usize;
        loop {
            let result = self
                .client
                .patch(&url)
                .header(reqwest::header::ACCEPT, "application/vnd.github+json")
                .bearer_auth(&self.config.token)
                .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
                .json(&body)
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let bytes = resp.bytes().await?;
                        let raw_url = raw_url_from_response(&bytes, filename)?;
                        info!(%raw_url, "uploaded snapshot to gist");
                        return Ok(raw_url);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "gist upload failed; retrying");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(PublishError::HttpStatus {
                        status: status.as_u16(),
                        url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(error = %err, attempt, "gist upload request error; retrying");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(PublishError::Request(err));
                }
            }
        }
    }
}
