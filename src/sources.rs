//! Source management: add, retype, inspect, remove, list.
//!
//! Every configuration passes through the adapter's
//! [`update_configuration`](crate::adapters::Adapter::update_configuration)
//! before anything is written, so an invalid source is never persisted.

use anyhow::{bail, Result};
use chrono::{TimeZone, Utc};

use crate::adapters::AdapterRegistry;
use crate::error::{SyncResult, ValidationError};
use crate::models::{ConfigMap, Icon, MetadataMap, Source};
use crate::store::Store;

/// Shortest accepted refresh interval.
pub const MIN_INTERVAL_SECS: i64 = 60;

/// User-supplied fields of a new source.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub name: String,
    pub adapter: String,
    pub config: ConfigMap,
    pub interval_secs: i64,
    pub group_id: Option<i64>,
}

/// Validate and insert a source. It is due immediately.
pub async fn add_source(
    store: &dyn Store,
    adapters: &AdapterRegistry,
    new: NewSource,
) -> SyncResult<Source> {
    let name = new.name.trim();
    if name.is_empty() {
        return Err(ValidationError::missing("name").into());
    }
    if new.interval_secs < MIN_INTERVAL_SECS {
        return Err(ValidationError::new(
            "interval",
            format!("must be at least {} seconds", MIN_INTERVAL_SECS),
        )
        .into());
    }

    let adapter = adapters.resolve(&new.adapter)?;
    let config = adapter.update_configuration(new.config)?;

    let mut source = Source::new(name, adapter.type_tag());
    source.config = config;
    source.interval_secs = new.interval_secs;
    source.group_id = new.group_id;
    source.next_refresh = Utc::now().timestamp();

    source.id = store.insert_source(&source).await?;
    tracing::info!(source_id = source.id, adapter = %source.adapter, name = %source.name, "source added");
    Ok(source)
}

/// Switch a source to another adapter type. The existing configuration is
/// re-validated by the new adapter and the runtime metadata is cleared.
pub async fn change_adapter(
    store: &dyn Store,
    adapters: &AdapterRegistry,
    source_id: i64,
    tag: &str,
) -> SyncResult<Source> {
    let mut source = store
        .get_source(source_id)
        .await?
        .ok_or_else(|| ValidationError::new("source", format!("no source with id {}", source_id)))?;
    if source.processing {
        return Err(ValidationError::new("source", "is being refreshed, try again later").into());
    }

    let adapter = adapters.resolve(tag)?;
    source.config = adapter.update_configuration(source.config)?;
    source.adapter = adapter.type_tag().to_string();
    source.metadata = MetadataMap::new();

    store.update_source(&source).await?;
    tracing::info!(source_id, adapter = %source.adapter, "source retyped");
    Ok(source)
}

/// Delete a source with its articles and filters. Refuses while a worker
/// holds it.
pub async fn remove_source(store: &dyn Store, source_id: i64) -> Result<()> {
    let Some(source) = store.get_source(source_id).await? else {
        bail!("No source with id {}", source_id);
    };
    if source.processing {
        bail!("Source {} is being refreshed; try again later", source_id);
    }
    if !store.delete_source(source_id).await? {
        bail!("Source {} could not be removed (claimed concurrently)", source_id);
    }
    tracing::info!(source_id, name = %source.name, "source removed");
    Ok(())
}

/// Adapter-reported configuration plus runtime state.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub source: Source,
    pub adapter_description: Option<String>,
    pub adapter_info: Vec<(String, String)>,
    pub articles: i64,
    pub icon: Option<Icon>,
}

pub async fn source_info(
    store: &dyn Store,
    adapters: &AdapterRegistry,
    source_id: i64,
) -> Result<SourceInfo> {
    let Some(source) = store.get_source(source_id).await? else {
        bail!("No source with id {}", source_id);
    };
    let adapter = adapters.get(&source.adapter);
    let articles = store.count_articles(source_id).await?;
    let icon = store.source_icon(source_id).await?;
    Ok(SourceInfo {
        adapter_description: adapter.as_ref().map(|a| a.description().to_string()),
        adapter_info: adapter
            .map(|a| a.info(&source.config))
            .unwrap_or_default(),
        source,
        articles,
        icon,
    })
}

fn format_time(ts: Option<i64>) -> String {
    ts.and_then(|t| Utc.timestamp_opt(t, 0).single())
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn print_sources(sources: &[Source]) {
    if sources.is_empty() {
        println!("No sources configured.");
        return;
    }
    println!(
        "{:<5} {:<24} {:<9} {:<6} {:<17} {:<17} LAST ERROR",
        "ID", "NAME", "ADAPTER", "STATE", "NEXT REFRESH", "LAST REFRESHED"
    );
    for s in sources {
        let state = if s.processing {
            "busy"
        } else if s.enabled {
            "ok"
        } else {
            "off"
        };
        let name: String = s.name.chars().take(24).collect();
        println!(
            "{:<5} {:<24} {:<9} {:<6} {:<17} {:<17} {}",
            s.id,
            name,
            s.adapter,
            state,
            format_time(Some(s.next_refresh)),
            format_time(s.last_refreshed),
            s.last_error.as_deref().unwrap_or("")
        );
    }
}

pub fn print_info(info: &SourceInfo) {
    let s = &info.source;
    println!("Source {}: {}", s.id, s.name);
    println!(
        "  adapter:        {}{}",
        s.adapter,
        info.adapter_description
            .as_deref()
            .map(|d| format!(" ({})", d))
            .unwrap_or_else(|| " (not registered)".to_string())
    );
    for (key, value) in &info.adapter_info {
        println!("  {:<15} {}", format!("{}:", key), value);
    }
    if let Some(group) = s.group_id {
        println!("  group:          {}", group);
    }
    println!("  interval:       {}s", s.interval_secs);
    println!("  enabled:        {}", s.enabled);
    println!("  processing:     {}", s.processing);
    println!("  next refresh:   {}", format_time(Some(s.next_refresh)));
    println!("  last refreshed: {}", format_time(s.last_refreshed));
    println!("  articles:       {}", info.articles);
    if let Some(icon) = &info.icon {
        println!("  icon:           {} ({} bytes)", icon.name, icon.bytes.len());
    }
    if let Some(err) = &s.last_error {
        println!(
            "  last error:     {} ({})",
            err,
            format_time(s.last_error_date)
        );
    }
    for (key, value) in &s.metadata {
        println!("  meta {:<10} {}", format!("{}:", key), value);
    }
}
