//! Core domain model for Marginalia: highlight records and published snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "marginalia-core";

/// Timestamp layout used for every time this system produces.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// One highlight, attributed to the book it was taken from.
///
/// Timestamps stay as ISO-8601 strings: records loaded from an older snapshot
/// are compared lexicographically and passed through without re-formatting.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HighlightRecord {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub book_title: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub highlight_text: String,
    /// Date claimed by the notebook page; `None` when it was relative or unparseable.
    #[serde(default)]
    pub highlight_time: Option<String>,
    /// When the collecting run retrieved the highlight.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub fetched_at: String,
    /// Fields written by other producers, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl HighlightRecord {
    pub fn new(
        book_title: impl Into<String>,
        highlight_text: impl Into<String>,
        highlight_time: Option<String>,
        fetched_at: impl Into<String>,
    ) -> Self {
        Self {
            book_title: book_title.into(),
            highlight_text: highlight_text.into(),
            highlight_time,
            fetched_at: fetched_at.into(),
            extra: Map::new(),
        }
    }

    /// `highlight_time` when present and non-empty, else `fetched_at`, else nothing.
    pub fn effective_time(&self) -> Option<&str> {
        self.highlight_time
            .as_deref()
            .filter(|t| !t.is_empty())
            .or_else(|| Some(self.fetched_at.as_str()).filter(|t| !t.is_empty()))
    }

    pub fn has_source_key(&self) -> bool {
        !self.book_title.is_empty()
    }
}

/// The persisted artifact: generation time plus the reconciled items.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub updated_at: String,
    #[serde(default)]
    pub items: Vec<HighlightRecord>,
}

impl Snapshot {
    pub fn new(updated_at: DateTime<Utc>, items: Vec<HighlightRecord>) -> Self {
        Self {
            updated_at: format_timestamp(updated_at),
            items,
        }
    }

    /// The first item, which is the most recent one in a built snapshot.
    pub fn latest(&self) -> Option<&HighlightRecord> {
        self.items.first()
    }
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn utc_now() -> String {
    format_timestamp(Utc::now())
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}
