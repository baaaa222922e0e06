//! Sync pipeline: scrape, reconcile with the published snapshot, save, publish.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use indexmap::map::Entry;
use indexmap::IndexMap;
use marginalia_adapters::{
    notebook_url, scrape_highlights, AdapterError, ChromeNotebookSource, ChromeSourceConfig,
    FixtureNotebookSource, ScrapeOptions, SUPPORTED_REGIONS,
};
use marginalia_core::{HighlightRecord, Snapshot};
use marginalia_storage::{
    gist_raw_url, install_auth_from_base64, ArtifactStore, GistConfig, GistPublisher,
    JsonSnapshotStore, SnapshotReader, SnapshotWriter, StorageState, DEFAULT_GIST_FILENAME,
};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "marginalia-sync";

pub const DEFAULT_REGION: &str = "com";

/// Whether `candidate` should take over from the record currently kept for
/// its book. Exact ties keep the incumbent.
fn supersedes(candidate: &HighlightRecord, incumbent: &HighlightRecord) -> bool {
    match (candidate.effective_time(), incumbent.effective_time()) {
        (Some(new), Some(old)) => new > old,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Keep one highlight per book: the one with the latest effective time, or
/// the first seen on a tie. Records without a book title are dropped.
/// Books come out in the order they were first seen.
pub fn deduplicate_highlights(
    highlights: impl IntoIterator<Item = HighlightRecord>,
) -> Vec<HighlightRecord> {
    let mut by_book: IndexMap<String, HighlightRecord> = IndexMap::new();

    for hl in highlights {
        if !hl.has_source_key() {
            continue;
        }
        match by_book.entry(hl.book_title.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(hl);
            }
            Entry::Occupied(mut slot) => {
                if supersedes(&hl, slot.get()) {
                    slot.insert(hl);
                }
            }
        }
    }

    by_book.into_values().collect()
}

fn recency_key(hl: &HighlightRecord) -> &str {
    hl.effective_time().unwrap_or("")
}

/// Most recent first. The sort is stable, so equal times keep input order and
/// records without any time end up last.
pub fn sort_by_recency(mut highlights: Vec<HighlightRecord>) -> Vec<HighlightRecord> {
    highlights.sort_by(|a, b| recency_key(b).cmp(recency_key(a)));
    highlights
}

/// Reconcile fresh records with the previously published snapshot. The fresh
/// records go first so they win exact ties. An unreadable prior snapshot is
/// logged and treated as empty.
pub fn merge_with_existing(
    new_highlights: Vec<HighlightRecord>,
    existing: &impl SnapshotReader,
) -> Vec<HighlightRecord> {
    let existing_highlights = match existing.read_snapshot() {
        Ok(snapshot) => {
            info!(count = snapshot.items.len(), "loaded existing highlights");
            snapshot.items
        }
        Err(err) => {
            warn!(error = %format!("{err:#}"), "could not load existing highlights");
            Vec::new()
        }
    };

    deduplicate_highlights(new_highlights.into_iter().chain(existing_highlights))
}

pub fn merge_with_existing_file(
    new_highlights: Vec<HighlightRecord>,
    existing_path: &Path,
) -> Vec<HighlightRecord> {
    let store = JsonSnapshotStore::new(existing_path);
    if !store.exists() {
        info!(path = %existing_path.display(), "no existing snapshot");
        return deduplicate_highlights(new_highlights);
    }
    merge_with_existing(new_highlights, &store)
}

pub fn build_output_at(highlights: Vec<HighlightRecord>, now: DateTime<Utc>) -> Snapshot {
    let deduped = deduplicate_highlights(highlights);
    Snapshot::new(now, sort_by_recency(deduped))
}

/// Dedup, sort and stamp with the current time.
pub fn build_output(highlights: Vec<HighlightRecord>) -> Snapshot {
    build_output_at(highlights, Utc::now())
}

pub fn save_output(
    highlights: Vec<HighlightRecord>,
    writer: &impl SnapshotWriter,
) -> Result<Snapshot> {
    let output = build_output(highlights);
    writer.write_snapshot(&output)?;
    Ok(output)
}

/// Falls back to `com` for anything other than the supported storefronts.
pub fn resolve_region(requested: Option<&str>) -> String {
    match requested.map(str::trim).filter(|r| !r.is_empty()) {
        None => DEFAULT_REGION.to_string(),
        Some(region) if SUPPORTED_REGIONS.contains(&region) => region.to_string(),
        Some(region) => {
            warn!(region, "unknown region, defaulting to 'com'");
            DEFAULT_REGION.to_string()
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub region: String,
    pub data_dir: PathBuf,
    pub auth_json_b64: Option<String>,
    pub gist_id: Option<String>,
    pub github_token: Option<String>,
    pub gist_filename: String,
    pub headless: bool,
    pub max_books: usize,
    pub user_agent: Option<String>,
    pub http_timeout_secs: u64,
    pub fixture_dir: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            region: resolve_region(non_empty("AMAZON_REGION").as_deref()),
            data_dir: non_empty("MARGINALIA_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            auth_json_b64: non_empty("AMAZON_AUTH_JSON_B64"),
            gist_id: non_empty("GIST_ID"),
            github_token: non_empty("GITHUB_TOKEN"),
            gist_filename: non_empty("MARGINALIA_GIST_FILENAME")
                .unwrap_or_else(|| DEFAULT_GIST_FILENAME.to_string()),
            headless: non_empty("MARGINALIA_HEADLESS")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            max_books: non_empty("MARGINALIA_MAX_BOOKS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            user_agent: non_empty("MARGINALIA_USER_AGENT"),
            http_timeout_secs: non_empty("MARGINALIA_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            fixture_dir: non_empty("MARGINALIA_FIXTURE_DIR").map(PathBuf::from),
        }
    }

    pub fn with_region(mut self, region: Option<&str>) -> Self {
        if region.is_some() {
            self.region = resolve_region(region);
        }
        self
    }

    pub fn auth_path(&self) -> PathBuf {
        self.data_dir.join("auth.json")
    }

    pub fn latest_path(&self) -> PathBuf {
        self.data_dir.join("latest.json")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }

    pub fn notebook_url(&self) -> String {
        notebook_url(&self.region)
    }

    pub fn scrape_options(&self) -> ScrapeOptions {
        ScrapeOptions {
            max_books: self.max_books.max(1),
            ..ScrapeOptions::default()
        }
    }

    /// Gist settings when both the id and the token are configured.
    pub fn gist_config(&self) -> Option<GistConfig> {
        let (Some(gist_id), Some(token)) = (&self.gist_id, &self.github_token) else {
            return None;
        };
        let mut config = GistConfig::new(gist_id.clone(), token.clone());
        config.timeout = Duration::from_secs(self.http_timeout_secs);
        if let Some(user_agent) = &self.user_agent {
            config.user_agent = user_agent.clone();
        }
        Some(config)
    }

    /// Unversioned raw URL of `filename` in the configured gist, which keeps
    /// pointing at the newest upload.
    pub fn stable_raw_url(&self, filename: Option<&str>) -> Option<String> {
        let gist_id = self.gist_id.as_deref()?;
        Some(gist_raw_url(gist_id, filename.unwrap_or(&self.gist_filename)))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scraped: usize,
    pub merged: usize,
    pub output_path: String,
    pub raw_url: Option<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: JsonSnapshotStore,
    artifacts: ArtifactStore,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Self {
        let store = JsonSnapshotStore::new(config.latest_path());
        let artifacts = ArtifactStore::new(config.artifacts_dir());
        Self {
            config,
            store,
            artifacts,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self, upload: bool) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, region = %self.config.region, "starting notebook sync");

        let scraped = self.scrape(started_at).await?;
        if scraped.is_empty() {
            warn!("no highlights scraped");
        }
        info!(count = scraped.len(), "scraped highlights");

        let scraped_count = scraped.len();
        let merged = merge_with_existing_file(scraped, self.store.path());
        let merged_count = merged.len();
        info!(count = merged_count, "total after merge/dedupe");

        let output = save_output(merged, &self.store)?;

        let raw_url = if upload {
            self.publish(&output).await?
        } else {
            None
        };

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            scraped: scraped_count,
            merged: merged_count,
            output_path: self.store.path().display().to_string(),
            raw_url,
        })
    }

    /// One `fetched_at` for the whole run, taken before the browser starts.
    async fn scrape(&self, fetched_at: DateTime<Utc>) -> Result<Vec<HighlightRecord>> {
        let options = self.config.scrape_options();
        let artifacts = self.artifacts.clone();

        if let Some(dir) = self.config.fixture_dir.clone() {
            info!(dir = %dir.display(), "scraping saved notebook pages");
            let source = FixtureNotebookSource::new(dir);
            return Ok(scrape_highlights(&source, &options, fetched_at, Some(&artifacts))?);
        }

        self.prepare_auth()?;
        let auth = StorageState::load(self.config.auth_path()).with_context(|| {
            format!(
                "loading {}; run `marginalia login` to create it",
                self.config.auth_path().display()
            )
        })?;

        let mut chrome = ChromeSourceConfig::new(self.config.notebook_url());
        chrome.headless = self.config.headless;
        chrome.user_agent = self.config.user_agent.clone();

        let records = tokio::task::spawn_blocking(move || -> Result<_, AdapterError> {
            let source = ChromeNotebookSource::open(chrome, &auth)?;
            scrape_highlights(&source, &options, fetched_at, Some(&artifacts))
        })
        .await
        .context("scraper task failed to complete")??;
        Ok(records)
    }

    /// Writes `auth.json` from `AMAZON_AUTH_JSON_B64` when it is set.
    pub fn prepare_auth(&self) -> Result<bool> {
        let Some(encoded) = &self.config.auth_json_b64 else {
            return Ok(false);
        };
        install_auth_from_base64(encoded, self.config.auth_path())
            .context("decoding AMAZON_AUTH_JSON_B64")?;
        Ok(true)
    }

    async fn publish(&self, snapshot: &Snapshot) -> Result<Option<String>> {
        let Some(gist) = self.config.gist_config() else {
            info!("skipping gist upload (GIST_ID or GITHUB_TOKEN not set)");
            return Ok(None);
        };
        let publisher = GistPublisher::new(gist)?;
        let raw_url = publisher
            .publish(&self.config.gist_filename, snapshot)
            .await
            .context("uploading to gist")?;
        Ok(Some(raw_url))
    }
}

/// Upload an already saved snapshot, by default the pipeline's `latest.json`.
pub async fn upload_saved_snapshot(
    config: &SyncConfig,
    file: Option<&Path>,
    filename: Option<&str>,
) -> Result<String> {
    if config.gist_id.is_none() {
        bail!("gist id is required; set GIST_ID");
    }
    let Some(gist) = config.gist_config() else {
        bail!("github token is required; set GITHUB_TOKEN");
    };

    let path = file.map(Path::to_path_buf).unwrap_or_else(|| config.latest_path());
    let store = JsonSnapshotStore::new(&path);
    if !store.exists() {
        bail!("no data file found at {}", path.display());
    }
    let snapshot = store.read_snapshot()?;

    let filename = filename.unwrap_or(&config.gist_filename);
    let publisher = GistPublisher::new(gist)?;
    Ok(publisher.publish(filename, &snapshot).await?)
}

pub async fn run_sync_once_from_env(region: Option<&str>, upload: bool) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env().with_region(region);
    SyncPipeline::new(config).run_once(upload).await
}
