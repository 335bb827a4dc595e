//! Incremental JSON APIs.
//!
//! Two watermark styles, both stored in the source metadata as `watermark`:
//!
//! - **`api_id`**: numeric record ids. The URL template may use
//!   `{since_id}` and `{page}`; records with an id at or below the
//!   watermark are dropped, and paging stops at the first page without new
//!   records or after `max_pages`.
//! - **`api_date`**: date windows. The URL template uses `{from}` and
//!   `{to}` (formatted with `date_format`); windows of `window_days` are
//!   requested from the watermark up to today. A watermark of today means
//!   nothing is fetched.
//!
//! # Shared configuration
//!
//! | Key | Default | Meaning |
//! |-----|---------|---------|
//! | `url` | required | URL template |
//! | `items_pointer` | document root | JSON pointer to the record array |
//! | `id_field` | `id` | |
//! | `title_field` | `title` | |
//! | `link_field` | `url` | |
//! | `author_field` | `author` | |
//! | `summary_field` | `summary` | |
//! | `content_field` | `content` | |
//! | `date_field` | `date` | RFC 3339 / RFC 2822 string or unix seconds |
//!
//! Field names starting with `/` are JSON pointers into the record.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use serde_json::Value;
use std::fmt::Write;

use super::{feed::parse_date, http, positive_int, trimmed, Adapter, FetchSession};
use crate::error::{FetchError, ValidationError};
use crate::models::{ConfigMap, RawItem};

pub const META_WATERMARK: &str = "watermark";

const DEFAULT_MAX_PAGES: i64 = 5;
const DEFAULT_WINDOW_DAYS: i64 = 7;
const MAX_WINDOWS: usize = 30;
const WATERMARK_DATE: &str = "%Y-%m-%d";

/// Record field names resolved from the source configuration.
#[derive(Debug, Clone)]
pub struct FieldMap {
    pub id: String,
    pub title: String,
    pub link: String,
    pub author: String,
    pub summary: String,
    pub content: String,
    pub date: String,
}

impl FieldMap {
    pub fn from_config(config: &ConfigMap) -> Self {
        let get = |key: &str, default: &str| {
            config
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
                .to_string()
        };
        Self {
            id: get("id_field", "id"),
            title: get("title_field", "title"),
            link: get("link_field", "url"),
            author: get("author_field", "author"),
            summary: get("summary_field", "summary"),
            content: get("content_field", "content"),
            date: get("date_field", "date"),
        }
    }
}

fn field<'v>(record: &'v Value, name: &str) -> Option<&'v Value> {
    if name.starts_with('/') {
        record.pointer(name)
    } else {
        record.get(name)
    }
}

fn field_string(record: &Value, name: &str) -> Option<String> {
    match field(record, name)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn field_i64(record: &Value, name: &str) -> Option<i64> {
    match field(record, name)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// The record array at `pointer` (empty pointer means the document root).
pub fn records<'v>(document: &'v Value, pointer: &str) -> Result<&'v [Value], FetchError> {
    let target = if pointer.is_empty() {
        Some(document)
    } else {
        document.pointer(pointer)
    };
    match target {
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(Value::Null) | None => Ok(&[]),
        Some(_) => Err(FetchError::parse(format!(
            "expected an array at '{}'",
            if pointer.is_empty() { "/" } else { pointer }
        ))),
    }
}

/// Map one JSON record onto a raw item.
pub fn record_to_item(record: &Value, fields: &FieldMap) -> RawItem {
    let date = field(record, &fields.date).and_then(|v| match v {
        Value::String(s) => parse_date(s),
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    });
    RawItem {
        natural_id: field_string(record, &fields.id),
        title: field_string(record, &fields.title).unwrap_or_default(),
        link: field_string(record, &fields.link),
        author: field_string(record, &fields.author),
        summary: field_string(record, &fields.summary).unwrap_or_default(),
        content: field_string(record, &fields.content).unwrap_or_default(),
        published: date,
        updated: None,
    }
}

fn validate_common(config: ConfigMap, placeholders: &[&str]) -> Result<ConfigMap, ValidationError> {
    let config = trimmed(config);
    let template = config
        .get("url")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ValidationError::missing("url"))?;
    let sample = placeholders
        .iter()
        .fold(template.clone(), |acc, p| acc.replace(p, "1"));
    let parsed = url::Url::parse(&sample).map_err(|e| ValidationError::new("url", e))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidationError::new("url", "expected an http(s) URL template"));
    }
    if let Some(pointer) = config.get("items_pointer").filter(|p| !p.is_empty()) {
        if !pointer.starts_with('/') {
            return Err(ValidationError::new("items_pointer", "must start with '/'"));
        }
    }
    Ok(config)
}

fn common_info(config: &ConfigMap, extra: &[&str]) -> Vec<(String, String)> {
    ["url", "items_pointer"]
        .iter()
        .chain(extra.iter())
        .filter_map(|key| config.get(*key).map(|v| (key.to_string(), v.clone())))
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
// Numeric id watermark
// ═══════════════════════════════════════════════════════════════════════

pub struct IncrementalIdAdapter;

#[async_trait]
impl Adapter for IncrementalIdAdapter {
    fn type_tag(&self) -> &str {
        "api_id"
    }

    fn description(&self) -> &str {
        "JSON API paged by increasing record id"
    }

    fn update_configuration(&self, config: ConfigMap) -> Result<ConfigMap, ValidationError> {
        let config = validate_common(config, &["{since_id}", "{page}"])?;
        positive_int(&config, "max_pages", DEFAULT_MAX_PAGES)?;
        Ok(config)
    }

    fn info(&self, config: &ConfigMap) -> Vec<(String, String)> {
        common_info(config, &["id_field", "max_pages"])
    }

    async fn extract(&self, session: &mut FetchSession<'_>) -> Result<Vec<RawItem>, FetchError> {
        let template = session.require("url")?;
        let pointer = session.source.config_value("items_pointer").unwrap_or("");
        let fields = FieldMap::from_config(&session.source.config);
        let max_pages = positive_int(&session.source.config, "max_pages", DEFAULT_MAX_PAGES)
            .map_err(FetchError::parse)?;

        let watermark = session
            .metadata
            .get(META_WATERMARK)
            .and_then(|w| w.parse::<i64>().ok())
            .unwrap_or(0);
        let paged = template.contains("{page}");

        let mut highest = watermark;
        let mut items = Vec::new();
        for page in 1..=max_pages {
            let url = template
                .replace("{since_id}", &watermark.to_string())
                .replace("{page}", &page.to_string());
            let document = http::get_json(session.http, &url).await?;

            let mut fresh = 0;
            for record in records(&document, pointer)? {
                let Some(id) = field_i64(record, &fields.id) else {
                    continue;
                };
                if id <= watermark {
                    continue;
                }
                fresh += 1;
                highest = highest.max(id);
                let mut item = record_to_item(record, &fields);
                item.natural_id = Some(id.to_string());
                items.push(item);
            }

            tracing::debug!(url = %url, fresh, "fetched api page");
            if fresh == 0 || !paged {
                break;
            }
        }

        if highest > watermark {
            session
                .metadata
                .insert(META_WATERMARK.to_string(), highest.to_string());
        }
        Ok(items)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Date window watermark
// ═══════════════════════════════════════════════════════════════════════

pub struct DateWindowAdapter;

/// Inclusive `[from, to]` windows of `window_days` covering `start..=today`,
/// at most [`MAX_WINDOWS`] of them.
pub fn date_windows(start: NaiveDate, today: NaiveDate, window_days: i64) -> Vec<(NaiveDate, NaiveDate)> {
    let mut windows = Vec::new();
    let mut from = start;
    while from <= today && windows.len() < MAX_WINDOWS {
        let to = (from + Duration::days(window_days - 1)).min(today);
        windows.push((from, to));
        from = to + Duration::days(1);
    }
    windows
}

/// Render `date` with a strftime-style `format`. `None` when the format has
/// unknown specifiers or needs fields a plain date lacks (e.g. `%H`).
pub fn format_date(date: NaiveDate, format: &str) -> Option<String> {
    let mut out = String::new();
    write!(out, "{}", date.format(format)).ok()?;
    Some(out)
}

#[async_trait]
impl Adapter for DateWindowAdapter {
    fn type_tag(&self) -> &str {
        "api_date"
    }

    fn description(&self) -> &str {
        "JSON API queried by date window"
    }

    fn update_configuration(&self, config: ConfigMap) -> Result<ConfigMap, ValidationError> {
        let mut config = validate_common(config, &["{from}", "{to}"])?;
        positive_int(&config, "window_days", DEFAULT_WINDOW_DAYS)?;
        let format = config
            .entry("date_format".to_string())
            .or_insert_with(|| WATERMARK_DATE.to_string());
        if format.is_empty() {
            *format = WATERMARK_DATE.to_string();
        }
        if format_date(Utc::now().date_naive(), format).is_none() {
            return Err(ValidationError::new(
                "date_format",
                format!("'{}' is not a valid date format", format),
            ));
        }
        Ok(config)
    }

    fn info(&self, config: &ConfigMap) -> Vec<(String, String)> {
        common_info(config, &["date_format", "window_days"])
    }

    async fn extract(&self, session: &mut FetchSession<'_>) -> Result<Vec<RawItem>, FetchError> {
        let template = session.require("url")?;
        let pointer = session.source.config_value("items_pointer").unwrap_or("");
        let format = session
            .source
            .config_value("date_format")
            .unwrap_or(WATERMARK_DATE);
        let fields = FieldMap::from_config(&session.source.config);
        let window_days = positive_int(&session.source.config, "window_days", DEFAULT_WINDOW_DAYS)
            .map_err(FetchError::parse)?;

        let today = session.now.date_naive();
        let start = match session
            .metadata
            .get(META_WATERMARK)
            .and_then(|w| NaiveDate::parse_from_str(w, WATERMARK_DATE).ok())
        {
            Some(watermark) if watermark >= today => return Ok(Vec::new()),
            Some(watermark) => watermark,
            None => today - Duration::days(window_days),
        };

        let mut items = Vec::new();
        let mut reached = None;
        let render = |date: NaiveDate| {
            format_date(date, format)
                .ok_or_else(|| FetchError::parse(format!("invalid date_format '{}'", format)))
        };
        for (from, to) in date_windows(start, today, window_days) {
            let url = template
                .replace("{from}", &render(from)?)
                .replace("{to}", &render(to)?);
            let document = http::get_json(session.http, &url).await?;
            let batch = records(&document, pointer)?;
            tracing::debug!(url = %url, records = batch.len(), "fetched api window");
            items.extend(batch.iter().map(|r| record_to_item(r, &fields)));
            reached = Some(to);
        }

        if let Some(to) = reached {
            session
                .metadata
                .insert(META_WATERMARK.to_string(), to.format(WATERMARK_DATE).to_string());
        }
        Ok(items)
    }
}
