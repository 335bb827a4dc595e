//! SQLite-backed [`Store`] implementation.
//!
//! Maps each [`Store`] operation onto the schema created by
//! [`migrate::apply_schema`](crate::migrate::apply_schema). Key/value maps
//! are stored as JSON text; timestamps as unix seconds.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;

use super::{MergeOutcome, Store, SuccessFinish};
use crate::models::{Article, Candidate, FilterConfig, Icon, RefreshTarget, Source};

const SOURCE_COLUMNS: &str = "id, name, adapter, group_id, config_json, metadata_json, \
    interval_secs, next_refresh, last_refreshed, processing, enabled, last_error, \
    last_error_date, max_articles_to_load, max_age_to_load, delete_old_articles, \
    num_articles_to_keep, age_articles_to_keep, use_filters, apply_global_filters, \
    use_default_min_score, min_score, icon IS NOT NULL AS has_icon";

const ARTICLE_COLUMNS: &str = "id, source_id, internal_id, title, link, author, summary, \
    content, published, updated, read, starred, score, metadata_json";

const FILTER_COLUMNS: &str = "id, name, source_id, enabled, params_json";

/// SQLite implementation of the [`Store`] trait.
///
/// Wraps a [`SqlitePool`]; every worker shares the same pool and performs
/// its own short transactions (claim, merge, finalize).
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `path` and make sure the schema exists.
    pub async fn open(path: &std::path::Path) -> Result<Self> {
        let pool = crate::db::connect_path(path).await?;
        crate::migrate::apply_schema(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// A corrupt map is an error rather than an empty map: losing a source's
/// etag or watermark would silently force a full refetch.
fn parse_map(row: &SqliteRow, column: &str) -> Result<BTreeMap<String, String>> {
    let json: String = row.get(column);
    serde_json::from_str(&json).with_context(|| {
        let id: i64 = row.get("id");
        format!("corrupt {} in row {}", column, id)
    })
}

fn map_json(map: &BTreeMap<String, String>) -> Result<String> {
    Ok(serde_json::to_string(map)?)
}

fn source_from_row(row: &SqliteRow) -> Result<Source> {
    Ok(Source {
        id: row.get("id"),
        name: row.get("name"),
        adapter: row.get("adapter"),
        group_id: row.get("group_id"),
        config: parse_map(row, "config_json")?,
        metadata: parse_map(row, "metadata_json")?,
        interval_secs: row.get("interval_secs"),
        next_refresh: row.get("next_refresh"),
        last_refreshed: row.get("last_refreshed"),
        processing: row.get("processing"),
        enabled: row.get("enabled"),
        last_error: row.get("last_error"),
        last_error_date: row.get("last_error_date"),
        max_articles_to_load: row.get("max_articles_to_load"),
        max_age_to_load: row.get("max_age_to_load"),
        delete_old_articles: row.get("delete_old_articles"),
        num_articles_to_keep: row.get("num_articles_to_keep"),
        age_articles_to_keep: row.get("age_articles_to_keep"),
        use_filters: row.get("use_filters"),
        apply_global_filters: row.get("apply_global_filters"),
        use_default_min_score: row.get("use_default_min_score"),
        min_score: row.get("min_score"),
        has_icon: row.get("has_icon"),
    })
}

fn article_from_row(row: &SqliteRow) -> Result<Article> {
    Ok(Article {
        id: row.get("id"),
        source_id: row.get("source_id"),
        internal_id: row.get("internal_id"),
        title: row.get("title"),
        link: row.get("link"),
        author: row.get("author"),
        summary: row.get("summary"),
        content: row.get("content"),
        published: row.get("published"),
        updated: row.get("updated"),
        read: row.get("read"),
        starred: row.get("starred"),
        score: row.get("score"),
        metadata: parse_map(row, "metadata_json")?,
    })
}

fn filter_from_row(row: &SqliteRow) -> Result<FilterConfig> {
    Ok(FilterConfig {
        id: row.get("id"),
        name: row.get("name"),
        source_id: row.get("source_id"),
        enabled: row.get("enabled"),
        params: parse_map(row, "params_json")?,
    })
}

/// Merge-or-insert every candidate on an open connection or transaction.
async fn merge_on(
    conn: &mut SqliteConnection,
    source_id: i64,
    candidates: &[Candidate],
) -> Result<Vec<MergeOutcome>> {
    let mut outcomes = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        // `read` and `starred` are user state and survive an update.
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO articles (source_id, internal_id, title, link, author, summary,
                                  content, published, updated, score, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id, internal_id) DO UPDATE SET
                title = excluded.title,
                link = excluded.link,
                author = excluded.author,
                summary = excluded.summary,
                content = excluded.content,
                published = excluded.published,
                updated = excluded.updated,
                score = excluded.score,
                metadata_json = excluded.metadata_json
            RETURNING id
            "#,
        )
        .bind(source_id)
        .bind(&candidate.internal_id)
        .bind(&candidate.title)
        .bind(&candidate.link)
        .bind(&candidate.author)
        .bind(&candidate.summary)
        .bind(&candidate.content)
        .bind(candidate.published)
        .bind(candidate.updated)
        .bind(candidate.score)
        .bind(map_json(&candidate.metadata)?)
        .fetch_one(&mut *conn)
        .await?;

        outcomes.push(if candidate.existing_id.is_some() {
            MergeOutcome::Updated(id)
        } else {
            MergeOutcome::Inserted(id)
        });
    }

    Ok(outcomes)
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_source(&self, source: &Source) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO sources (name, adapter, group_id, config_json, metadata_json,
                                 interval_secs, next_refresh, last_refreshed, processing,
                                 enabled, max_articles_to_load, max_age_to_load,
                                 delete_old_articles, num_articles_to_keep,
                                 age_articles_to_keep, use_filters, apply_global_filters,
                                 use_default_min_score, min_score)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&source.name)
        .bind(&source.adapter)
        .bind(source.group_id)
        .bind(map_json(&source.config)?)
        .bind(map_json(&source.metadata)?)
        .bind(source.interval_secs)
        .bind(source.next_refresh)
        .bind(source.last_refreshed)
        .bind(source.enabled)
        .bind(source.max_articles_to_load)
        .bind(source.max_age_to_load)
        .bind(source.delete_old_articles)
        .bind(source.num_articles_to_keep)
        .bind(source.age_articles_to_keep)
        .bind(source.use_filters)
        .bind(source.apply_global_filters)
        .bind(source.use_default_min_score)
        .bind(source.min_score)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn update_source(&self, source: &Source) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sources SET
                name = ?, adapter = ?, group_id = ?, config_json = ?, metadata_json = ?,
                interval_secs = ?, next_refresh = ?, enabled = ?,
                max_articles_to_load = ?, max_age_to_load = ?, delete_old_articles = ?,
                num_articles_to_keep = ?, age_articles_to_keep = ?, use_filters = ?,
                apply_global_filters = ?, use_default_min_score = ?, min_score = ?
            WHERE id = ?
            "#,
        )
        .bind(&source.name)
        .bind(&source.adapter)
        .bind(source.group_id)
        .bind(map_json(&source.config)?)
        .bind(map_json(&source.metadata)?)
        .bind(source.interval_secs)
        .bind(source.next_refresh)
        .bind(source.enabled)
        .bind(source.max_articles_to_load)
        .bind(source.max_age_to_load)
        .bind(source.delete_old_articles)
        .bind(source.num_articles_to_keep)
        .bind(source.age_articles_to_keep)
        .bind(source.use_filters)
        .bind(source.apply_global_filters)
        .bind(source.use_default_min_score)
        .bind(source.min_score)
        .bind(source.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_source(&self, id: i64) -> Result<Option<Source>> {
        let row = sqlx::query(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query(&format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn delete_source(&self, id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM sources WHERE id = ? AND processing = 0")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        // Cascades are declared, but older databases may lack foreign keys.
        sqlx::query("DELETE FROM articles WHERE source_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM filters WHERE source_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn due_sources(&self, now: i64, limit: usize) -> Result<Vec<Source>> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources \
             WHERE enabled = 1 AND processing = 0 AND next_refresh <= ? \
             ORDER BY next_refresh ASC, id ASC LIMIT ?"
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn claim_source(&self, id: i64, now: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE sources SET processing = 1 \
             WHERE id = ? AND processing = 0 AND enabled = 1 AND next_refresh <= ?",
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    async fn is_claimed(&self, id: i64) -> Result<Option<bool>> {
        let flag: Option<bool> = sqlx::query_scalar("SELECT processing FROM sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(flag)
    }

    async fn finish_success(
        &self,
        id: i64,
        candidates: &[Candidate],
        finish: &SuccessFinish,
    ) -> Result<Option<Vec<MergeOutcome>>> {
        let mut tx = self.pool.begin().await?;

        // The claim check comes first so a lost claim writes nothing.
        let result = sqlx::query(
            r#"
            UPDATE sources SET
                next_refresh = ?, last_refreshed = ?, metadata_json = ?, processing = 0,
                last_error = NULL
            WHERE id = ? AND processing = 1
            "#,
        )
        .bind(finish.next_refresh)
        .bind(finish.now)
        .bind(map_json(&finish.metadata)?)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        if let Some(icon) = &finish.icon {
            sqlx::query("UPDATE sources SET icon = ?, icon_name = ? WHERE id = ? AND icon IS NULL")
                .bind(&icon.bytes)
                .bind(&icon.name)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        let outcomes = merge_on(&mut tx, id, candidates).await?;

        tx.commit().await?;
        Ok(Some(outcomes))
    }

    async fn finish_failure(
        &self,
        id: i64,
        now: i64,
        next_refresh: i64,
        error: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sources SET
                next_refresh = ?, last_error = ?, last_error_date = ?, processing = 0
            WHERE id = ? AND processing = 1
            "#,
        )
        .bind(next_refresh)
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn force_refresh(&self, target: RefreshTarget, now: i64) -> Result<u64> {
        let result = match target {
            RefreshTarget::Source(id) => {
                sqlx::query("UPDATE sources SET next_refresh = ? WHERE id = ?")
                    .bind(now)
                    .bind(id)
                    .execute(&self.pool)
                    .await?
            }
            RefreshTarget::Group(group_id) => {
                sqlx::query("UPDATE sources SET next_refresh = ? WHERE group_id = ? AND enabled = 1")
                    .bind(now)
                    .bind(group_id)
                    .execute(&self.pool)
                    .await?
            }
            RefreshTarget::All => {
                sqlx::query("UPDATE sources SET next_refresh = ? WHERE enabled = 1")
                    .bind(now)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    async fn reset_stale_claims(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE sources SET processing = 0 WHERE processing = 1")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn source_icon(&self, id: i64) -> Result<Option<Icon>> {
        let row = sqlx::query(
            "SELECT icon, icon_name FROM sources WHERE id = ? AND icon IS NOT NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Icon {
            bytes: r.get("icon"),
            name: r.get::<Option<String>, _>("icon_name").unwrap_or_default(),
        }))
    }

    async fn find_article(&self, source_id: i64, internal_id: &str) -> Result<Option<Article>> {
        let row = sqlx::query(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE source_id = ? AND internal_id = ?"
        ))
        .bind(source_id)
        .bind(internal_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(article_from_row).transpose()
    }

    async fn latest_article(&self, source_id: i64) -> Result<Option<Article>> {
        let row = sqlx::query(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE source_id = ? \
             ORDER BY updated DESC, id DESC LIMIT 1"
        ))
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(article_from_row).transpose()
    }

    async fn merge_articles(
        &self,
        source_id: i64,
        candidates: &[Candidate],
    ) -> Result<Vec<MergeOutcome>> {
        let mut tx = self.pool.begin().await?;
        let outcomes = merge_on(&mut tx, source_id, candidates).await?;
        tx.commit().await?;
        Ok(outcomes)
    }

    async fn get_article(&self, id: i64) -> Result<Option<Article>> {
        let row = sqlx::query(&format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(article_from_row).transpose()
    }

    async fn list_articles(&self, source_id: i64, limit: i64) -> Result<Vec<Article>> {
        let rows = sqlx::query(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE source_id = ? \
             ORDER BY updated DESC, id DESC LIMIT ?"
        ))
        .bind(source_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(article_from_row).collect()
    }

    async fn count_articles(&self, source_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles WHERE source_id = ?")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn set_article_flags(
        &self,
        id: i64,
        read: Option<bool>,
        starred: Option<bool>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE articles SET read = COALESCE(?, read), starred = COALESCE(?, starred) \
             WHERE id = ?",
        )
        .bind(read)
        .bind(starred)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn prune_articles(
        &self,
        source_id: i64,
        keep: Option<i64>,
        older_than: Option<i64>,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0u64;

        if let Some(keep) = keep {
            let result = sqlx::query(
                r#"
                DELETE FROM articles
                WHERE source_id = ? AND starred = 0 AND id NOT IN (
                    SELECT id FROM articles WHERE source_id = ?
                    ORDER BY updated DESC, id DESC LIMIT ?
                )
                "#,
            )
            .bind(source_id)
            .bind(source_id)
            .bind(keep)
            .execute(&mut *tx)
            .await?;
            deleted += result.rows_affected();
        }

        if let Some(cutoff) = older_than {
            let result = sqlx::query(
                "DELETE FROM articles WHERE source_id = ? AND starred = 0 AND updated < ?",
            )
            .bind(source_id)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
            deleted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(deleted)
    }

    async fn insert_filter(&self, filter: &FilterConfig) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO filters (name, source_id, enabled, params_json) VALUES (?, ?, ?, ?)",
        )
        .bind(&filter.name)
        .bind(filter.source_id)
        .bind(filter.enabled)
        .bind(map_json(&filter.params)?)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list_filters(&self) -> Result<Vec<FilterConfig>> {
        let rows = sqlx::query(&format!("SELECT {FILTER_COLUMNS} FROM filters ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(filter_from_row).collect()
    }

    async fn delete_filter(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM filters WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn filters_for_source(&self, source: &Source) -> Result<Vec<FilterConfig>> {
        let rows = sqlx::query(&format!(
            "SELECT {FILTER_COLUMNS} FROM filters \
             WHERE enabled = 1 AND ((source_id IS NULL AND ?) OR source_id = ?) \
             ORDER BY source_id IS NOT NULL, id"
        ))
        .bind(source.apply_global_filters)
        .bind(source.id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(filter_from_row).collect()
    }
}
