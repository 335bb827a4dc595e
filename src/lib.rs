//! # feedloom
//!
//! A local-first source synchronization engine.
//!
//! feedloom polls heterogeneous content sources (RSS/Atom feeds, web pages,
//! local files, JSON APIs) on per-source intervals, normalizes what they
//! return into articles, deduplicates and scores them through a filter
//! pipeline, and persists the survivors in SQLite.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  ids  ┌─────────────┐  claim/fetch  ┌──────────┐
//! │ Scheduler  │──────▶│ Worker pool │──────────────▶│ Adapters │
//! │ (ticks)    │       │ (N tasks)   │               │ feed/web │
//! └─────┬──────┘       └──────┬──────┘               │ file/api │
//!       │ due sources         │ merge + finalize     └──────────┘
//!       ▼                     ▼
//!  ┌─────────────────────────────────┐       ┌──────────────┐
//!  │  SQLite (sources, articles,     │◀──────│   Filters    │
//!  │          filters)               │       │ score + gate │
//!  └─────────────────────────────────┘       └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! loom init
//! loom source add feed "Rust blog" --set url=https://blog.rust-lang.org/feed.xml
//! loom filter add keyword --param keywords=release --param score=20
//! loom refresh --all
//! loom run                      # scheduler until Ctrl-C
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Sources, articles, filter configs, fetch candidates |
//! | [`error`] | Typed fetch, validation, and sync errors |
//! | [`store`] | Persistence trait and the SQLite implementation |
//! | [`adapters`] | Fetch contract and the built-in adapter variants |
//! | [`identity`] | Internal ids, fingerprints, change decisions |
//! | [`filters`] | Scoring filter pipeline |
//! | [`worker`] | One source's claim → fetch → persist → finalize cycle |
//! | [`pool`] | Bounded worker pool |
//! | [`scheduler`] | Dispatcher loop, force refresh, pause |
//! | [`retention`] | Old-article cleanup |
//! | [`sources`] | Source management |
//! | [`notify`] | Notification events and sinks |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod adapters;
pub mod config;
pub mod db;
pub mod error;
pub mod filters;
pub mod identity;
pub mod migrate;
pub mod models;
pub mod notify;
pub mod pool;
pub mod retention;
pub mod scheduler;
pub mod sources;
pub mod store;
pub mod worker;
