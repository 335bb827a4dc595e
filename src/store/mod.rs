//! Storage abstraction for feedloom.
//!
//! The [`Store`] trait defines every persistence operation the scheduler,
//! workers, and retention pass need. Source rows are addressed by id; the
//! only cross-worker coordination is the atomic [`claim_source`] update,
//! so implementations never need a global lock.
//!
//! Implementations must be `Send + Sync` to be shared across worker tasks.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`due_sources`](Store::due_sources) | Enabled, unclaimed sources whose `next_refresh` has passed |
//! | [`claim_source`](Store::claim_source) | Conditional `processing = true`, committed immediately |
//! | [`is_claimed`](Store::is_claimed) | Sanity re-check before mutations are applied |
//! | [`finish_success`](Store::finish_success) | Merge the accepted articles and finalize, in one transaction |
//! | [`finish_failure`](Store::finish_failure) | Record the error and release the claim |
//! | [`merge_articles`](Store::merge_articles) | Merge-or-insert keyed by `(source_id, internal_id)` |
//! | [`prune_articles`](Store::prune_articles) | Retention deletes |
//!
//! [`claim_source`]: Store::claim_source

pub mod sqlite;

pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Article, Candidate, FilterConfig, Icon, MetadataMap, RefreshTarget, Source};

/// Values written when a job completes successfully.
#[derive(Debug, Clone)]
pub struct SuccessFinish {
    /// Start of the cycle; stored as `last_refreshed`.
    pub now: i64,
    pub next_refresh: i64,
    pub metadata: MetadataMap,
    /// Only written when the source has no icon yet.
    pub icon: Option<Icon>,
}

/// Result of merging one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted(i64),
    Updated(i64),
}

impl MergeOutcome {
    pub fn is_insert(&self) -> bool {
        matches!(self, MergeOutcome::Inserted(_))
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // ── Sources ──────────────────────────────────────────────────────

    /// Insert a source; the `id` field is ignored. Returns the new id.
    async fn insert_source(&self, source: &Source) -> Result<i64>;

    /// Update the user-editable fields of a source (name, adapter, config,
    /// metadata, interval, policies). Never touches `processing`.
    async fn update_source(&self, source: &Source) -> Result<()>;

    async fn get_source(&self, id: i64) -> Result<Option<Source>>;

    async fn list_sources(&self) -> Result<Vec<Source>>;

    /// Delete a source with its articles and filters. Returns `false` when
    /// the source does not exist or is currently held by a worker.
    async fn delete_source(&self, id: i64) -> Result<bool>;

    /// Enabled, unclaimed sources with `next_refresh <= now`, oldest first.
    async fn due_sources(&self, now: i64, limit: usize) -> Result<Vec<Source>>;

    /// Atomically verify `processing = false` and `next_refresh <= now`, then
    /// set `processing = true` and commit. Returns whether the claim was won.
    async fn claim_source(&self, id: i64, now: i64) -> Result<bool>;

    /// `None` if the row vanished, otherwise the current `processing` flag.
    async fn is_claimed(&self, id: i64) -> Result<Option<bool>>;

    /// Finalize a successful job: verify the claim, write `finish`, and
    /// merge `candidates`, all in one transaction. Returns `None` with
    /// nothing written if the claim was lost.
    async fn finish_success(
        &self,
        id: i64,
        candidates: &[Candidate],
        finish: &SuccessFinish,
    ) -> Result<Option<Vec<MergeOutcome>>>;

    /// Finalize a failed job. Returns `false` if the claim was lost.
    async fn finish_failure(
        &self,
        id: i64,
        now: i64,
        next_refresh: i64,
        error: &str,
    ) -> Result<bool>;

    /// Set `next_refresh = now` on the targeted sources. Returns rows touched.
    async fn force_refresh(&self, target: RefreshTarget, now: i64) -> Result<u64>;

    /// Release claims left behind by a process that died mid-job.
    async fn reset_stale_claims(&self) -> Result<u64>;

    async fn source_icon(&self, id: i64) -> Result<Option<Icon>>;

    // ── Articles ─────────────────────────────────────────────────────

    async fn find_article(&self, source_id: i64, internal_id: &str) -> Result<Option<Article>>;

    /// Most recently updated article of a source.
    async fn latest_article(&self, source_id: i64) -> Result<Option<Article>>;

    /// Merge-or-insert every candidate in one transaction, without touching
    /// the source row.
    async fn merge_articles(
        &self,
        source_id: i64,
        candidates: &[Candidate],
    ) -> Result<Vec<MergeOutcome>>;

    async fn get_article(&self, id: i64) -> Result<Option<Article>>;

    /// Newest first.
    async fn list_articles(&self, source_id: i64, limit: i64) -> Result<Vec<Article>>;

    async fn count_articles(&self, source_id: i64) -> Result<i64>;

    /// Set the user flags of an article; `None` leaves a flag unchanged.
    /// Returns `false` when the article does not exist.
    async fn set_article_flags(
        &self,
        id: i64,
        read: Option<bool>,
        starred: Option<bool>,
    ) -> Result<bool>;

    /// Delete unstarred articles beyond the newest `keep` (by `updated`)
    /// and/or with `updated < older_than`. Returns rows deleted.
    async fn prune_articles(
        &self,
        source_id: i64,
        keep: Option<i64>,
        older_than: Option<i64>,
    ) -> Result<u64>;

    // ── Filters ──────────────────────────────────────────────────────

    async fn insert_filter(&self, filter: &FilterConfig) -> Result<i64>;

    async fn list_filters(&self) -> Result<Vec<FilterConfig>>;

    async fn delete_filter(&self, id: i64) -> Result<bool>;

    /// Enabled filters applying to `source`: global ones first (only when
    /// the source applies globals), then its own, each in insertion order.
    async fn filters_for_source(&self, source: &Source) -> Result<Vec<FilterConfig>>;
}
