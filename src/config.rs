use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub defaults: Defaults,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Number of concurrent workers in the pool.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Sleep after a tick that dispatched work.
    #[serde(default = "default_short_sleep")]
    pub short_sleep_secs: u64,
    /// Sleep after a tick with nothing due.
    #[serde(default = "default_long_sleep")]
    pub long_sleep_secs: u64,
    /// Period of the retention pass; 0 disables it.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_true")]
    pub cleanup_on_shutdown: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            short_sleep_secs: default_short_sleep(),
            long_sleep_secs: default_long_sleep(),
            cleanup_interval_secs: default_cleanup_interval(),
            cleanup_on_shutdown: true,
        }
    }
}

impl SchedulerConfig {
    pub fn short_sleep(&self) -> Duration {
        Duration::from_secs(self.short_sleep_secs)
    }

    pub fn long_sleep(&self) -> Duration {
        Duration::from_secs(self.long_sleep_secs)
    }
}

fn default_workers() -> usize {
    3
}
fn default_short_sleep() -> u64 {
    1
}
fn default_long_sleep() -> u64 {
    30
}
fn default_cleanup_interval() -> u64 {
    3600
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    /// Connect + read timeout applied to every network call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    10
}
fn default_user_agent() -> String {
    format!("feedloom/{}", env!("CARGO_PKG_VERSION"))
}

/// Global fallbacks applied when a source defers to the default.
#[derive(Debug, Deserialize, Clone)]
pub struct Defaults {
    /// Global count limit; 0 means unlimited.
    #[serde(default)]
    pub max_articles_to_load: i64,
    /// Global age limit in days; 0 means unlimited.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,
    #[serde(default)]
    pub min_score: i64,
    /// Ratio above which a coarse capture counts as a near-duplicate.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            max_articles_to_load: 0,
            max_age_days: default_max_age_days(),
            min_score: 0,
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

fn default_max_age_days() -> i64 {
    30
}
fn default_similarity_threshold() -> f64 {
    0.95
}

impl Config {
    /// A config with defaults everywhere and the database at `db_path`.
    pub fn with_db(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            scheduler: SchedulerConfig::default(),
            fetch: FetchConfig::default(),
            defaults: Defaults::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.workers == 0 {
            anyhow::bail!("scheduler.workers must be >= 1");
        }
        if self.fetch.timeout_secs == 0 {
            anyhow::bail!("fetch.timeout_secs must be >= 1");
        }
        let ratio = self.defaults.similarity_threshold;
        if !(ratio > 0.0 && ratio <= 1.0) {
            anyhow::bail!("defaults.similarity_threshold must be in (0.0, 1.0]");
        }
        if !(-100..=100).contains(&self.defaults.min_score) {
            anyhow::bail!("defaults.min_score must be in [-100, 100]");
        }
        Ok(())
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}
