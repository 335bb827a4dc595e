//! Source adapters and the shared fetch contract.
//!
//! Each source type (feed, web page, monitored file, incremental API)
//! implements [`Adapter`]. Adapters differ only in how they decide that
//! nothing changed and how they extract raw items; everything after that
//! is shared and lives in [`fetch`]:
//!
//! ```text
//!  Adapter::extract            fetch() (shared)
//! ┌─────────────────────┐    ┌────────────────────────────────────────┐
//! │ 1. freshness token   │──▶│ 3. identity  4. change detection       │
//! │ 2. raw extraction    │   │ 5. age window  6. count limit          │
//! └─────────────────────┘    └────────────────────────────────────────┘
//! ```
//!
//! Adapters are registered by type tag in an [`AdapterRegistry`] built at
//! startup; there is no runtime discovery.

pub mod api;
pub mod feed;
pub mod file;
pub mod http;
pub mod web;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::Defaults;
use crate::error::{FetchError, SyncError, ValidationError};
use crate::identity::{self, ChangeDecision};
use crate::models::{Candidate, ConfigMap, Icon, MetadataMap, RawItem, Source};
use crate::store::Store;

// ═══════════════════════════════════════════════════════════════════════
// Fetch session and limits
// ═══════════════════════════════════════════════════════════════════════

/// Everything an adapter may touch during one fetch.
///
/// `metadata` is a working copy of the source's runtime metadata; adapters
/// update freshness tokens in it and the worker persists it only when the
/// whole cycle succeeds.
pub struct FetchSession<'a> {
    pub http: &'a reqwest::Client,
    pub store: &'a dyn Store,
    pub source: &'a Source,
    pub metadata: MetadataMap,
    pub now: DateTime<Utc>,
}

impl<'a> FetchSession<'a> {
    pub fn new(
        http: &'a reqwest::Client,
        store: &'a dyn Store,
        source: &'a Source,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            http,
            store,
            source,
            metadata: source.metadata.clone(),
            now,
        }
    }

    /// A required configuration value.
    pub fn require(&self, key: &str) -> Result<&'a str, FetchError> {
        self.source
            .config_value(key)
            .ok_or_else(|| FetchError::MissingConfig(key.to_string()))
    }
}

/// Load limits resolved from the source and the global defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchLimits {
    /// Keep at most this many of the most recent items.
    pub max_count: Option<usize>,
    /// Drop items older than this many days.
    pub max_age_days: Option<i64>,
    pub similarity_threshold: f64,
}

impl FetchLimits {
    pub fn resolve(source: &Source, defaults: &Defaults) -> Self {
        let max_count = match source.max_articles_to_load {
            n if n > 0 => Some(n as usize),
            0 if defaults.max_articles_to_load > 0 => Some(defaults.max_articles_to_load as usize),
            _ => None,
        };
        let max_age_days = match source.max_age_to_load {
            n if n > 0 => Some(n),
            0 if defaults.max_age_days > 0 => Some(defaults.max_age_days),
            _ => None,
        };
        let similarity_threshold = source
            .config_value("similarity_threshold")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|r| *r > 0.0 && *r <= 1.0)
            .unwrap_or(defaults.similarity_threshold);

        Self {
            max_count,
            max_age_days,
            similarity_threshold,
        }
    }
}

/// Oldest acceptable `updated` timestamp: the later of the last refresh and
/// `now - max_age_days`.
pub fn age_cutoff(last_refreshed: Option<i64>, max_age_days: Option<i64>, now: i64) -> Option<i64> {
    let by_age = max_age_days.map(|days| now - days * 86_400);
    match (last_refreshed, by_age) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Adapter trait
// ═══════════════════════════════════════════════════════════════════════

/// A fetch capability for one source type.
///
/// Implementations are stateless: per-source settings come from
/// [`FetchSession::source`] and per-source runtime state from
/// [`FetchSession::metadata`].
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Type tag stored on sources (e.g. `"feed"`).
    fn type_tag(&self) -> &str;

    /// One-line description for listings.
    fn description(&self) -> &str;

    /// Validate and normalize a configuration. Called when a source is
    /// created or switched to this adapter type.
    fn update_configuration(&self, config: ConfigMap) -> Result<ConfigMap, ValidationError>;

    /// Human-readable key/value pairs describing a configuration.
    fn info(&self, config: &ConfigMap) -> Vec<(String, String)>;

    /// Whether items are whole-resource captures without natural identity
    /// granularity. Such items are checked for near-duplicates against the
    /// most recent stored article.
    fn is_coarse(&self, _config: &ConfigMap) -> bool {
        false
    }

    /// Steps 1–2 of the fetch contract: short-circuit on an unchanged
    /// freshness token (returning an empty list), otherwise extract raw items.
    async fn extract(&self, session: &mut FetchSession<'_>) -> Result<Vec<RawItem>, FetchError>;

    /// Best-effort icon lookup.
    async fn icon(&self, _session: &FetchSession<'_>) -> Option<Icon> {
        None
    }
}

/// Run the full fetch contract for one source and return the candidates
/// that are new or changed.
pub async fn fetch(
    adapter: &dyn Adapter,
    session: &mut FetchSession<'_>,
    limits: &FetchLimits,
) -> Result<Vec<Candidate>, FetchError> {
    let raw = adapter.extract(session).await?;
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    let source = session.source;
    let store = session.store;
    let now = session.now.timestamp();
    let cutoff = age_cutoff(source.last_refreshed, limits.max_age_days, now);

    let latest = if adapter.is_coarse(&source.config) {
        store
            .latest_article(source.id)
            .await
            .map_err(|e| FetchError::Store(format!("{e:#}")))?
    } else {
        None
    };

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for item in raw {
        let stamped = item.updated.or(item.published).map(|t| t.timestamp());
        if let (Some(cutoff), Some(ts)) = (cutoff, stamped) {
            if ts < cutoff {
                continue;
            }
        }

        let internal_id = identity::internal_id(source.id, &item);
        if !seen.insert(internal_id.clone()) {
            continue;
        }

        let fingerprint = identity::fingerprint(&item);
        let prior = store
            .find_article(source.id, &internal_id)
            .await
            .map_err(|e| FetchError::Store(format!("{e:#}")))?;

        if identity::decide(prior.as_ref(), &fingerprint, stamped) == ChangeDecision::Skip {
            continue;
        }

        let mut ratio = None;
        if let Some(latest) = &latest {
            let r = identity::similarity(
                &identity::comparable_text(&latest.content, &latest.summary),
                &identity::comparable_text(&item.content, &item.summary),
            );
            if r >= limits.similarity_threshold {
                tracing::debug!(source_id = source.id, similarity = r, "near-duplicate capture suppressed");
                continue;
            }
            ratio = Some(r);
        }

        let updated = stamped.unwrap_or(now);
        let mut candidate =
            identity::to_candidate(item, internal_id, fingerprint, updated, prior.as_ref());
        if let Some(r) = ratio {
            identity::note_similarity(&mut candidate, r);
        }
        candidates.push(candidate);
    }

    if let Some(max) = limits.max_count {
        candidates.sort_by(|a, b| b.updated.cmp(&a.updated));
        candidates.truncate(max);
    }

    Ok(candidates)
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Static mapping from type tag to adapter.
///
/// Use [`AdapterRegistry::with_builtins`] for the standard set, then
/// [`register`](AdapterRegistry::register) to add or replace adapters.
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    /// Create an empty adapter registry.
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }

    /// Registry pre-loaded with feed, web, file, api_id and api_date.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(feed::FeedAdapter));
        registry.register(Arc::new(web::WebAdapter));
        registry.register(Arc::new(file::FileAdapter));
        registry.register(Arc::new(api::IncrementalIdAdapter));
        registry.register(Arc::new(api::DateWindowAdapter));
        registry
    }

    /// Register an adapter, replacing any adapter with the same tag.
    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        self.adapters
            .retain(|existing| existing.type_tag() != adapter.type_tag());
        self.adapters.push(adapter);
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters
            .iter()
            .find(|a| a.type_tag() == tag)
            .cloned()
    }

    /// Like [`get`](Self::get) but with the taxonomy error for unknown tags.
    pub fn resolve(&self, tag: &str) -> Result<Arc<dyn Adapter>, SyncError> {
        self.get(tag)
            .ok_or_else(|| SyncError::UnknownAdapter(tag.to_string()))
    }

    pub fn adapters(&self) -> &[Arc<dyn Adapter>] {
        &self.adapters
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared config validation helpers.
pub(crate) fn trimmed(config: ConfigMap) -> ConfigMap {
    config
        .into_iter()
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

pub(crate) fn require_url(config: &ConfigMap, key: &str) -> Result<url::Url, ValidationError> {
    let raw = config
        .get(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ValidationError::missing(key))?;
    let parsed = url::Url::parse(raw).map_err(|e| ValidationError::new(key, e))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(ValidationError::new(
            key,
            format!("unsupported scheme '{}'", other),
        )),
    }
}

/// Positive integer option, defaulting when absent.
pub(crate) fn positive_int(
    config: &ConfigMap,
    key: &str,
    default: i64,
) -> Result<i64, ValidationError> {
    match config.get(key).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(v) => match v.parse::<i64>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(ValidationError::new(key, "must be a positive integer")),
        },
    }
}
