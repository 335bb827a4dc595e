//! Core data models used throughout feedloom.
//!
//! These types represent the sources, articles, and filter configurations
//! that flow through the synchronization pipeline, plus the transient
//! [`RawItem`] / [`Candidate`] shapes produced during a fetch.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Free-form adapter configuration (`url`, `selector`, `path`, ...).
pub type ConfigMap = BTreeMap<String, String>;

/// Runtime metadata kept per source (etags, watermarks, mtimes) or per
/// article (content hash, similarity, update trace).
pub type MetadataMap = BTreeMap<String, String>;

pub const SCORE_MIN: i64 = -100;
pub const SCORE_MAX: i64 = 100;

/// Article metadata key holding the content fingerprint.
pub const META_CONTENT_HASH: &str = "content_hash";
/// Article metadata key holding the similarity ratio against the previous capture.
pub const META_SIMILARITY: &str = "similarity";
/// Article metadata key holding the fingerprint an update replaced.
pub const META_PREVIOUS_HASH: &str = "previous_hash";
/// Article metadata key counting in-place updates.
pub const META_UPDATE_COUNT: &str = "update_count";

/// A configured origin of content, polled on its own interval.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Source {
    pub id: i64,
    pub name: String,
    /// Adapter type tag (`feed`, `web`, `file`, `api_id`, `api_date`, ...).
    pub adapter: String,
    pub group_id: Option<i64>,
    pub config: ConfigMap,
    pub metadata: MetadataMap,
    pub interval_secs: i64,
    pub next_refresh: i64,
    pub last_refreshed: Option<i64>,
    pub processing: bool,
    pub enabled: bool,
    pub last_error: Option<String>,
    pub last_error_date: Option<i64>,
    /// `0` defers to the global default, `-1` means unlimited.
    pub max_articles_to_load: i64,
    /// Days. `0` defers to the global default, `-1` means "since last refresh only".
    pub max_age_to_load: i64,
    pub delete_old_articles: bool,
    /// `0` disables the count rule.
    pub num_articles_to_keep: i64,
    /// Days. `0` disables the age rule.
    pub age_articles_to_keep: i64,
    pub use_filters: bool,
    pub apply_global_filters: bool,
    pub use_default_min_score: bool,
    pub min_score: i64,
    pub has_icon: bool,
}

impl Source {
    /// A new, enabled source with an hourly interval and default policies.
    pub fn new(name: impl Into<String>, adapter: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            adapter: adapter.into(),
            group_id: None,
            config: ConfigMap::new(),
            metadata: MetadataMap::new(),
            interval_secs: 3600,
            next_refresh: 0,
            last_refreshed: None,
            processing: false,
            enabled: true,
            last_error: None,
            last_error_date: None,
            max_articles_to_load: 0,
            max_age_to_load: 0,
            delete_old_articles: false,
            num_articles_to_keep: 0,
            age_articles_to_keep: 0,
            use_filters: true,
            apply_global_filters: true,
            use_default_min_score: true,
            min_score: 0,
            has_icon: false,
        }
    }

    /// A trimmed, non-empty configuration value.
    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// A persisted item belonging to exactly one source.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Article {
    pub id: i64,
    pub source_id: i64,
    /// Identity key, unique per source.
    pub internal_id: String,
    pub title: String,
    pub link: Option<String>,
    pub author: Option<String>,
    pub summary: String,
    pub content: String,
    pub published: Option<i64>,
    pub updated: i64,
    pub read: bool,
    pub starred: bool,
    pub score: i64,
    pub metadata: MetadataMap,
}

impl Article {
    pub fn content_hash(&self) -> Option<&str> {
        self.metadata.get(META_CONTENT_HASH).map(String::as_str)
    }
}

/// Item extracted by an adapter before identity and change detection.
#[derive(Debug, Clone, Default)]
pub struct RawItem {
    /// Identity supplied by the origin (feed GUID, API id, relative path).
    pub natural_id: Option<String>,
    pub title: String,
    pub link: Option<String>,
    pub author: Option<String>,
    pub summary: String,
    pub content: String,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
}

/// A new or changed item that survived identity and change detection.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub internal_id: String,
    pub title: String,
    pub link: Option<String>,
    pub author: Option<String>,
    pub summary: String,
    pub content: String,
    pub published: Option<i64>,
    pub updated: i64,
    pub score: i64,
    pub metadata: MetadataMap,
    /// Row to update in place; `None` means insert.
    pub existing_id: Option<i64>,
}

/// A scoring filter attached globally (`source_id = None`) or to one source.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FilterConfig {
    pub id: i64,
    pub name: String,
    pub source_id: Option<i64>,
    pub enabled: bool,
    pub params: ConfigMap,
}

/// Favicon or logo bytes returned by an adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct Icon {
    pub bytes: Vec<u8>,
    pub name: String,
}

/// Selector for `force_refresh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTarget {
    Source(i64),
    Group(i64),
    All,
}
