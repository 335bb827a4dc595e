//! # feedloom CLI (`loom`)
//!
//! The `loom` binary manages sources and filters, runs one-shot refreshes,
//! and hosts the long-running scheduler.
//!
//! ## Usage
//!
//! ```bash
//! loom --config ./config/loom.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `loom init` | Create the SQLite database and schema |
//! | `loom source add <adapter> <name>` | Register a source (`--set key=value` for adapter config) |
//! | `loom source list` | Sources with next refresh and last error |
//! | `loom source info <id>` | Adapter configuration and runtime state |
//! | `loom source retype <id> <adapter>` | Switch a source to another adapter |
//! | `loom source remove <id>` | Delete a source with its articles |
//! | `loom filter add/list/remove` | Manage scoring filters |
//! | `loom refresh` | Force refresh, run until idle, exit |
//! | `loom run` | Run the scheduler until Ctrl-C |
//! | `loom cleanup` | Run the retention pass once |
//! | `loom articles <source-id>` | List stored articles |
//! | `loom mark <article-id>` | Set read / starred flags |
//!
//! ## Examples
//!
//! ```bash
//! loom init
//! loom source add file notes --set path=./notes --set include='*.md' --interval 300
//! loom filter add length --param min_length=40
//! loom refresh --all --events json
//! loom run
//! ```

use anyhow::{bail, Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use feedloom::adapters::{http, AdapterRegistry};
use feedloom::config::{self, Config};
use feedloom::filters::{self, FilterRegistry};
use feedloom::migrate;
use feedloom::models::{Article, ConfigMap, RefreshTarget};
use feedloom::notify::EventMode;
use feedloom::retention;
use feedloom::scheduler::Scheduler;
use feedloom::sources::{self, NewSource};
use feedloom::store::{SqliteStore, Store};
use feedloom::worker::WorkerContext;

/// feedloom: scheduled fetching, deduplication and scoring of feeds, web
/// pages, files and APIs.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/loom.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "loom",
    about = "feedloom: a local-first source synchronization engine",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/loom.toml")]
    config: PathBuf,

    /// Log line format on stderr. Verbosity follows `RUST_LOG`.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    /// How notification events are surfaced.
    #[arg(long, global = true, value_enum, default_value_t = EventMode::Log)]
    events: EventMode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Compact,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Manage sources.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Manage scoring filters.
    Filter {
        #[command(subcommand)]
        action: FilterAction,
    },

    /// Force the targeted sources due, refresh them once, and exit.
    ///
    /// Without a target every source is refreshed.
    Refresh {
        #[arg(long, conflicts_with_all = ["group", "all"])]
        source: Option<i64>,

        #[arg(long, conflicts_with = "all")]
        group: Option<i64>,

        #[arg(long)]
        all: bool,

        /// Only run sources that are already due; skip the forced refresh.
        #[arg(long, conflicts_with_all = ["source", "group", "all"])]
        due: bool,
    },

    /// Run the scheduler until Ctrl-C, then stop gracefully.
    Run,

    /// Delete old articles according to each source's retention policy.
    Cleanup,

    /// List stored articles of a source, newest first.
    Articles {
        source_id: i64,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Set the read or starred flag of an article. Starred articles are
    /// never removed by cleanup.
    Mark {
        article_id: i64,

        #[arg(long)]
        read: Option<bool>,

        #[arg(long)]
        starred: Option<bool>,
    },
}

#[derive(Subcommand)]
enum SourceAction {
    /// Register a new source. It is refreshed on the next tick.
    Add {
        /// Adapter type tag (`feed`, `web`, `file`, `api_id`, `api_date`).
        adapter: String,

        name: String,

        /// Refresh interval in seconds.
        #[arg(long, default_value_t = 3600)]
        interval: i64,

        #[arg(long)]
        group: Option<i64>,

        /// Adapter configuration as `key=value`; repeatable.
        #[arg(long = "set", value_parser = parse_key_val)]
        settings: Vec<(String, String)>,
    },

    List,

    Info {
        id: i64,
    },

    /// Switch a source to another adapter type.
    Retype {
        id: i64,
        adapter: String,
    },

    Remove {
        id: i64,
    },

    /// List the registered adapter types.
    Adapters,
}

#[derive(Subcommand)]
enum FilterAction {
    /// Add a filter; global unless `--source` is given.
    Add {
        /// Filter name (`length`, `keyword`, `baseline`).
        name: String,

        #[arg(long)]
        source: Option<i64>,

        /// Filter parameter as `key=value`; repeatable.
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },

    List,

    Remove {
        id: i64,
    },
}

/// Parse a `key=value` pair for `--set` / `--param` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("feedloom=info,warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Everything a command needs once the config is loaded.
struct App {
    config: Config,
    store: Arc<SqliteStore>,
    adapters: Arc<AdapterRegistry>,
    filters: Arc<FilterRegistry>,
}

impl App {
    async fn open(config: Config) -> Result<Self> {
        let store = SqliteStore::open(&config.db.path)
            .await
            .with_context(|| format!("Failed to open database {}", config.db.path.display()))?;
        Ok(Self {
            config,
            store: Arc::new(store),
            adapters: Arc::new(AdapterRegistry::with_builtins()),
            filters: Arc::new(FilterRegistry::with_builtins()),
        })
    }

    fn scheduler(&self, events: EventMode) -> Result<Arc<Scheduler>> {
        let ctx = WorkerContext {
            store: self.store.clone(),
            adapters: Arc::clone(&self.adapters),
            filters: Arc::clone(&self.filters),
            http: http::build_client(&self.config.fetch)?,
            defaults: self.config.defaults.clone(),
            sink: events.sink(),
        };
        Ok(Scheduler::new(ctx, self.config.scheduler.clone()))
    }
}

fn format_time(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_articles(articles: &[Article]) {
    if articles.is_empty() {
        println!("No articles.");
        return;
    }
    for a in articles {
        let flags = format!(
            "{}{}",
            if a.read { "r" } else { "-" },
            if a.starred { "*" } else { "-" }
        );
        println!(
            "{:<6} {} {:>4} {}  {}",
            a.id,
            flags,
            a.score,
            format_time(a.updated),
            if a.title.is_empty() { &a.internal_id } else { &a.title }
        );
        if let Some(link) = &a.link {
            println!("{:<17}{}", "", link);
        }
    }
}

async fn run_source(app: &App, action: SourceAction) -> Result<()> {
    let store = app.store.as_ref();
    match action {
        SourceAction::Add {
            adapter,
            name,
            interval,
            group,
            settings,
        } => {
            let source = sources::add_source(
                store,
                &app.adapters,
                NewSource {
                    name,
                    adapter,
                    config: settings.into_iter().collect::<ConfigMap>(),
                    interval_secs: interval,
                    group_id: group,
                },
            )
            .await?;
            println!("Added source {} ({}).", source.id, source.name);
        }
        SourceAction::List => {
            sources::print_sources(&store.list_sources().await?);
        }
        SourceAction::Info { id } => {
            let info = sources::source_info(store, &app.adapters, id).await?;
            sources::print_info(&info);
        }
        SourceAction::Retype { id, adapter } => {
            let source = sources::change_adapter(store, &app.adapters, id, &adapter).await?;
            println!("Source {} now uses adapter '{}'.", source.id, source.adapter);
        }
        SourceAction::Remove { id } => {
            sources::remove_source(store, id).await?;
            println!("Removed source {}.", id);
        }
        SourceAction::Adapters => {
            for adapter in app.adapters.adapters() {
                println!("{:<10} {}", adapter.type_tag(), adapter.description());
            }
        }
    }
    Ok(())
}

async fn run_filter(app: &App, action: FilterAction) -> Result<()> {
    let store = app.store.as_ref();
    match action {
        FilterAction::Add {
            name,
            source,
            params,
        } => {
            if !app.filters.names().contains(&name.as_str()) {
                bail!(
                    "Unknown filter '{}'. Available: {}",
                    name,
                    app.filters.names().join(", ")
                );
            }
            let filter = filters::add_filter(
                store,
                &app.filters,
                &name,
                source,
                params.into_iter().collect(),
            )
            .await?;
            println!("Added filter {} ({}).", filter.id, filter.name);
        }
        FilterAction::List => {
            filters::print_filters(&store.list_filters().await?);
        }
        FilterAction::Remove { id } => {
            if !store.delete_filter(id).await? {
                bail!("No filter with id {}", id);
            }
            println!("Removed filter {}.", id);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let app = App::open(cfg).await?;

    match cli.command {
        Commands::Init => {}
        Commands::Source { action } => run_source(&app, action).await?,
        Commands::Filter { action } => run_filter(&app, action).await?,
        Commands::Refresh {
            source,
            group,
            all: _,
            due,
        } => {
            let scheduler = app.scheduler(cli.events)?;
            if !due {
                let target = match (source, group) {
                    (Some(id), _) => RefreshTarget::Source(id),
                    (None, Some(id)) => RefreshTarget::Group(id),
                    (None, None) => RefreshTarget::All,
                };
                let touched = scheduler.force_refresh(target).await?;
                if touched == 0 {
                    println!("No matching sources.");
                }
            }
            let refreshed = scheduler.run_until_idle().await?;
            scheduler.stop().await?;
            println!("Refreshed {} sources.", refreshed);
        }
        Commands::Run => {
            let scheduler = app.scheduler(cli.events)?;
            scheduler.start().await?;
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            tracing::info!("interrupt received, stopping");
            scheduler.stop().await?;
        }
        Commands::Cleanup => {
            let report =
                retention::run_cleanup(app.store.as_ref(), Utc::now().timestamp()).await?;
            println!(
                "Deleted {} articles from {} sources ({} skipped while refreshing).",
                report.deleted, report.sources, report.skipped
            );
        }
        Commands::Articles { source_id, limit } => {
            if app.store.get_source(source_id).await?.is_none() {
                bail!("No source with id {}", source_id);
            }
            print_articles(&app.store.list_articles(source_id, limit).await?);
        }
        Commands::Mark {
            article_id,
            read,
            starred,
        } => {
            if read.is_none() && starred.is_none() {
                bail!("Nothing to change: pass --read and/or --starred");
            }
            if !app.store.set_article_flags(article_id, read, starred).await? {
                bail!("No article with id {}", article_id);
            }
            if let Some(article) = app.store.get_article(article_id).await? {
                print_articles(std::slice::from_ref(&article));
            }
        }
    }

    app.store.pool().close().await;
    Ok(())
}
