//! Axum + Askama viewer for the published highlight snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use marginalia_core::{HighlightRecord, Snapshot};
use marginalia_sync::SyncConfig;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "marginalia-web";

#[derive(Clone)]
pub struct AppState {
    pub workspace_root: PathBuf,
    pub snapshot_path: PathBuf,
}

impl AppState {
    pub fn new(workspace_root: impl Into<PathBuf>, snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            snapshot_path: snapshot_path.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct HighlightCard {
    book_title: String,
    highlight_text: String,
    relative_time: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    updated_at: String,
    updated_relative: String,
    cards: Vec<HighlightCard>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/latest.json", get(snapshot_json_handler))
        .route("/latest", get(latest_item_handler))
        .route("/assets/static/app.css", get(app_css_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, snapshot = %state.snapshot_path.display(), "viewer listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env(port: Option<u16>) -> anyhow::Result<()> {
    let port = port
        .or_else(|| {
            std::env::var("MARGINALIA_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(8000);
    let config = SyncConfig::from_env();
    serve(port, AppState::new(".", config.latest_path())).await
}

/// Human label for how long ago `iso` was, relative to `now`.
pub fn format_relative(iso: &str, now: DateTime<Utc>) -> String {
    let Some(at) = parse_timestamp(iso) else {
        return "Unknown".to_string();
    };

    let elapsed = now.signed_duration_since(at);
    let minutes = elapsed.num_minutes();
    let hours = elapsed.num_hours();
    let days = elapsed.num_days();

    if minutes < 1 {
        "Just now".to_string()
    } else if minutes < 60 {
        format!("{minutes}m ago")
    } else if hours < 24 {
        format!("{hours}h ago")
    } else if days < 7 {
        format!("{days}d ago")
    } else if at.year() == now.year() {
        at.format("%b %-d").to_string()
    } else {
        at.format("%b %-d, %Y").to_string()
    }
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn card_for(record: &HighlightRecord, now: DateTime<Utc>) -> HighlightCard {
    HighlightCard {
        book_title: record.book_title.clone(),
        highlight_text: record.highlight_text.clone(),
        relative_time: record
            .effective_time()
            .map(|t| format_relative(t, now))
            .unwrap_or_else(|| "Unknown".to_string()),
    }
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = match load_snapshot(&state.snapshot_path).await {
        Ok(snapshot) => snapshot.unwrap_or_default(),
        Err(err) => return server_error(err),
    };
    let now = Utc::now();
    render_html(IndexTemplate {
        updated_relative: format_relative(&snapshot.updated_at, now),
        cards: snapshot.items.iter().map(|r| card_for(r, now)).collect(),
        updated_at: snapshot.updated_at,
    })
}

async fn snapshot_json_handler(State(state): State<Arc<AppState>>) -> Response {
    match tokio::fs::read_to_string(&state.snapshot_path).await {
        Ok(text) => ([(header::CONTENT_TYPE, "application/json")], text).into_response(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => not_found("no snapshot yet"),
        Err(err) => server_error(err.into()),
    }
}

async fn latest_item_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_snapshot(&state.snapshot_path).await {
        Ok(Some(snapshot)) => match snapshot.latest() {
            Some(item) => Json(item.clone()).into_response(),
            None => not_found("no highlights"),
        },
        Ok(None) => not_found("no snapshot yet"),
        Err(err) => server_error(err),
    }
}

async fn app_css_handler(State(state): State<Arc<AppState>>) -> Response {
    let css_path = state.workspace_root.join("assets/static/app.css");
    match tokio::fs::read_to_string(&css_path).await {
        Ok(css) => ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], css).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, Html("/* missing app.css */".to_string())).into_response(),
    }
}

/// `Ok(None)` when nothing has been saved yet.
async fn load_snapshot(path: &Path) -> anyhow::Result<Option<Snapshot>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(Some(serde_json::from_str(&text)?))
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use marginalia_storage::{JsonSnapshotStore, SnapshotWriter};
    use tower::ServiceExt;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    fn sample_snapshot() -> Snapshot {
        Snapshot {
            updated_at: "2026-03-01T06:00:00Z".into(),
            items: vec![
                HighlightRecord::new(
                    "Le Petit Prince",
                    "On ne voit bien qu'avec le cœur.",
                    Some("2026-03-01T00:00:00Z".into()),
                    "2026-03-01T06:00:00Z",
                ),
                HighlightRecord::new("Dune <1965>", "Fear is the mind-killer.", None, "2026-02-27T00:00:00Z"),
            ],
        }
    }

    async fn fetch(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn relative_time_buckets() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().unwrap();
        assert_eq!(format_relative("2026-03-10T11:59:30Z", now), "Just now");
        assert_eq!(format_relative("2026-03-10T11:15:00Z", now), "45m ago");
        assert_eq!(format_relative("2026-03-10T01:00:00Z", now), "11h ago");
        assert_eq!(format_relative("2026-03-07T12:00:00Z", now), "3d ago");
        assert_eq!(format_relative("2026-02-27T00:00:00Z", now), "Feb 27");
        assert_eq!(format_relative("2025-12-24T08:00:00Z", now), "Dec 24, 2025");
        assert_eq!(format_relative("2026-03-10T09:30:00.250", now), "2h ago");
        assert_eq!(format_relative("Yesterday", now), "Unknown");
        assert_eq!(format_relative("", now), "Unknown");
    }

    #[tokio::test]
    async fn index_lists_cards_and_escapes_titles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latest.json");
        JsonSnapshotStore::new(&path).write_snapshot(&sample_snapshot()).unwrap();

        let (status, text) = fetch(app(AppState::new(workspace_root(), &path)), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("Le Petit Prince"));
        assert!(text.contains("Dune &lt;1965&gt;"));
        assert!(text.contains("2026-03-01T06:00:00Z"));
    }

    #[tokio::test]
    async fn index_renders_without_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(workspace_root(), dir.path().join("latest.json"));
        let (status, text) = fetch(app(state), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("No highlights yet"));
    }

    #[tokio::test]
    async fn json_endpoints_serve_snapshot_and_latest_item() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latest.json");
        JsonSnapshotStore::new(&path).write_snapshot(&sample_snapshot()).unwrap();
        let app = app(AppState::new(workspace_root(), &path));

        let (status, text) = fetch(app.clone(), "/latest.json").await;
        assert_eq!(status, StatusCode::OK);
        let parsed: Snapshot = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, sample_snapshot());

        let (status, text) = fetch(app, "/latest").await;
        assert_eq!(status, StatusCode::OK);
        let item: HighlightRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(item.book_title, "Le Petit Prince");
    }

    #[tokio::test]
    async fn json_endpoints_404_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latest.json");
        let missing = app(AppState::new(workspace_root(), &path));
        assert_eq!(fetch(missing.clone(), "/latest.json").await.0, StatusCode::NOT_FOUND);
        assert_eq!(fetch(missing, "/latest").await.0, StatusCode::NOT_FOUND);

        JsonSnapshotStore::new(&path)
            .write_snapshot(&Snapshot::new(Utc::now(), vec![]))
            .unwrap();
        let empty = app(AppState::new(workspace_root(), &path));
        assert_eq!(fetch(empty, "/latest").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serves_stylesheet() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(AppState::new(workspace_root(), dir.path().join("latest.json")));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/assets/static/app.css")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "text/css; charset=utf-8"
        );
    }
}
