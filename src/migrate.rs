use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Create sources table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            adapter TEXT NOT NULL,
            group_id INTEGER,
            config_json TEXT NOT NULL DEFAULT '{}',
            metadata_json TEXT NOT NULL DEFAULT '{}',
            interval_secs INTEGER NOT NULL,
            next_refresh INTEGER NOT NULL,
            last_refreshed INTEGER,
            processing INTEGER NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_error TEXT,
            last_error_date INTEGER,
            max_articles_to_load INTEGER NOT NULL DEFAULT 0,
            max_age_to_load INTEGER NOT NULL DEFAULT 0,
            delete_old_articles INTEGER NOT NULL DEFAULT 0,
            num_articles_to_keep INTEGER NOT NULL DEFAULT 0,
            age_articles_to_keep INTEGER NOT NULL DEFAULT 0,
            use_filters INTEGER NOT NULL DEFAULT 1,
            apply_global_filters INTEGER NOT NULL DEFAULT 1,
            use_default_min_score INTEGER NOT NULL DEFAULT 1,
            min_score INTEGER NOT NULL DEFAULT 0,
            icon BLOB,
            icon_name TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create articles table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS articles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL,
            internal_id TEXT NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            link TEXT,
            author TEXT,
            summary TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL DEFAULT '',
            published INTEGER,
            updated INTEGER NOT NULL,
            read INTEGER NOT NULL DEFAULT 0,
            starred INTEGER NOT NULL DEFAULT 0,
            score INTEGER NOT NULL DEFAULT 0,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            UNIQUE(source_id, internal_id),
            FOREIGN KEY (source_id) REFERENCES sources(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create filters table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS filters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            source_id INTEGER,
            enabled INTEGER NOT NULL DEFAULT 1,
            params_json TEXT NOT NULL DEFAULT '{}',
            FOREIGN KEY (source_id) REFERENCES sources(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sources_next_refresh ON sources(next_refresh)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_articles_source_updated ON articles(source_id, updated DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_filters_source ON filters(source_id)")
        .execute(pool)
        .await?;

    Ok(())
}
