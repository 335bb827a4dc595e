//! Local file and directory monitoring.
//!
//! # Configuration
//!
//! | Key | Default | Meaning |
//! |-----|---------|---------|
//! | `path` | required | File or directory to watch |
//! | `regex` | – | Split a file into one item per match |
//! | `include` | `**/*` | Comma-separated globs, directories only |
//! | `exclude` | – | Comma-separated globs, directories only |
//!
//! Freshness token: the newest modification time seen, in nanoseconds,
//! stored in the source metadata as `mtime_ns`. Files strictly older than
//! the token are skipped without being read. Files stamped exactly at the
//! token are read again, since filesystem timestamps are coarse enough for
//! a rewrite to land on the same value; change detection drops them when
//! their content is unchanged.
//!
//! A single file without `regex` is a whole-file capture and goes through
//! the near-duplicate check. With `regex`, the named groups `id`, `title`
//! and `content` are used when present; otherwise the whole match is the
//! content and its first line the title.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

use super::{trimmed, Adapter, FetchSession};
use crate::error::{FetchError, ValidationError};
use crate::identity;
use crate::models::{ConfigMap, RawItem};

pub const META_MTIME: &str = "mtime_ns";

const TITLE_CHARS: usize = 80;

pub struct FileAdapter;

#[async_trait]
impl Adapter for FileAdapter {
    fn type_tag(&self) -> &str {
        "file"
    }

    fn description(&self) -> &str {
        "Local file or directory"
    }

    fn update_configuration(&self, config: ConfigMap) -> Result<ConfigMap, ValidationError> {
        let config = trimmed(config);
        let path = config
            .get("path")
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ValidationError::missing("path"))?;
        if !Path::new(path).exists() {
            return Err(ValidationError::new("path", format!("{} does not exist", path)));
        }
        if let Some(pattern) = config.get("regex").filter(|r| !r.is_empty()) {
            Regex::new(pattern).map_err(|e| ValidationError::new("regex", e))?;
        }
        for key in ["include", "exclude"] {
            build_globset(&split_list(config.get(key)))
                .map_err(|e| ValidationError::new(key, e))?;
        }
        Ok(config)
    }

    fn info(&self, config: &ConfigMap) -> Vec<(String, String)> {
        ["path", "regex", "include", "exclude"]
            .iter()
            .filter_map(|key| config.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect()
    }

    fn is_coarse(&self, config: &ConfigMap) -> bool {
        let whole_file = config.get("regex").map_or(true, |r| r.is_empty());
        let is_file = config.get("path").is_some_and(|p| Path::new(p).is_file());
        whole_file && is_file
    }

    async fn extract(&self, session: &mut FetchSession<'_>) -> Result<Vec<RawItem>, FetchError> {
        let settings = FileSettings::from_config(&session.source.config)?;
        let since = session
            .metadata
            .get(META_MTIME)
            .and_then(|v| v.parse::<i64>().ok());

        let scan = tokio::task::spawn_blocking(move || scan(&settings, since))
            .await
            .map_err(|e| FetchError::parse(format!("file scan task failed: {e}")))??;

        if let Some(newest) = scan.newest {
            session
                .metadata
                .insert(META_MTIME.to_string(), newest.to_string());
        }
        tracing::debug!(items = scan.items.len(), "scanned files");
        Ok(scan.items)
    }
}

/// Validated file adapter settings.
#[derive(Debug, Clone)]
pub struct FileSettings {
    pub path: PathBuf,
    pub regex: Option<Regex>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl FileSettings {
    pub fn from_config(config: &ConfigMap) -> Result<Self, FetchError> {
        let path = config
            .get("path")
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| FetchError::MissingConfig("path".into()))?;
        let regex = match config.get("regex").map(|r| r.trim()).filter(|r| !r.is_empty()) {
            Some(pattern) => Some(Regex::new(pattern).map_err(FetchError::parse)?),
            None => None,
        };
        let mut include = split_list(config.get("include"));
        if include.is_empty() {
            include.push("**/*".to_string());
        }
        Ok(Self {
            path: PathBuf::from(path),
            regex,
            include,
            exclude: split_list(config.get("exclude")),
        })
    }
}

/// Result of one scan: items plus the newest mtime (nanoseconds) observed.
#[derive(Debug, Default)]
pub struct Scan {
    pub items: Vec<RawItem>,
    pub newest: Option<i64>,
}

/// Scan `settings.path`, returning items for files modified at or after
/// `since` (unix nanoseconds).
pub fn scan(settings: &FileSettings, since: Option<i64>) -> Result<Scan, FetchError> {
    let root = &settings.path;
    let meta = std::fs::metadata(root).map_err(|e| FetchError::io(root.display().to_string(), e))?;

    if meta.is_file() {
        let mtime = mtime_nanos(&meta);
        if since.is_some_and(|s| mtime < s) {
            return Ok(Scan::default());
        }
        let body = read_lossy(root)?;
        let items = match &settings.regex {
            Some(re) => split_matches(re, &body),
            None => vec![whole_file(root, body, mtime)],
        };
        return Ok(Scan {
            items,
            newest: Some(mtime),
        });
    }

    scan_directory(settings, since)
}

fn scan_directory(settings: &FileSettings, since: Option<i64>) -> Result<Scan, FetchError> {
    let root = &settings.path;
    let include_set = build_globset(&settings.include).map_err(FetchError::parse)?;

    let mut default_excludes = vec!["**/.git/**".to_string(), "**/.*".to_string()];
    default_excludes.extend(settings.exclude.iter().cloned());
    let exclude_set = build_globset(&default_excludes).map_err(FetchError::parse)?;

    let mut candidates = Vec::new();
    let mut newest = since.unwrap_or(i64::MIN);
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| FetchError::parse(format!("walking {}: {e}", root.display())))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let meta = entry
            .metadata()
            .map_err(|e| FetchError::parse(format!("{}: {e}", path.display())))?;
        let mtime = mtime_nanos(&meta);
        newest = newest.max(mtime);
        if since.is_some_and(|s| mtime < s) {
            continue;
        }
        candidates.push((path.to_path_buf(), rel_str, mtime));
    }

    if candidates.is_empty() {
        return Ok(Scan::default());
    }

    // Deterministic ordering
    candidates.sort_by(|a, b| a.1.cmp(&b.1));

    let mut items = Vec::with_capacity(candidates.len());
    for (path, relative, mtime) in candidates {
        let body = read_lossy(&path)?;
        items.push(RawItem {
            natural_id: Some(relative.clone()),
            title: relative,
            link: Some(format!("file://{}", path.display())),
            content: body,
            updated: Some(timestamp(mtime)),
            ..Default::default()
        });
    }

    Ok(Scan {
        items,
        newest: Some(newest),
    })
}

fn whole_file(path: &Path, body: String, mtime: i64) -> RawItem {
    let mut item = RawItem {
        title: file_name(path),
        link: Some(format!("file://{}", path.display())),
        content: body,
        updated: Some(timestamp(mtime)),
        ..Default::default()
    };
    let fingerprint = identity::fingerprint(&item);
    item.natural_id = Some(format!("{}#{}", path.display(), &fingerprint[..16]));
    item
}

/// Matches without an `id` group have no link either, so they are
/// identified by title. Matches carry no timestamp of their own: the file
/// mtime moves for every match whenever any of them changes.
fn split_matches(re: &Regex, body: &str) -> Vec<RawItem> {
    re.captures_iter(body)
        .filter_map(|caps| {
            let whole = caps.get(0)?.as_str();
            let content = caps
                .name("content")
                .map_or(whole, |m| m.as_str())
                .trim()
                .to_string();
            if content.is_empty() {
                return None;
            }
            let title = caps
                .name("title")
                .map(|m| m.as_str().trim().to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| first_line(&content));
            let natural_id = caps
                .name("id")
                .map(|m| m.as_str().trim().to_string())
                .filter(|id| !id.is_empty());
            Some(RawItem {
                natural_id,
                title,
                link: None,
                summary: String::new(),
                content,
                author: None,
                published: None,
                updated: None,
            })
        })
        .collect()
}

fn first_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    line.chars().take(TITLE_CHARS).collect()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn read_lossy(path: &Path) -> Result<String, FetchError> {
    let bytes = std::fs::read(path).map_err(|e| FetchError::io(path.display().to_string(), e))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn mtime_nanos(meta: &std::fs::Metadata) -> i64 {
    let nanos = meta
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    i64::try_from(nanos).unwrap_or(i64::MAX)
}

fn timestamp(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

fn split_list(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(path: &Path, regex: Option<&str>) -> FileSettings {
        let mut config = ConfigMap::new();
        config.insert("path".into(), path.display().to_string());
        if let Some(r) = regex {
            config.insert("regex".into(), r.into());
        }
        FileSettings::from_config(&config).unwrap()
    }

    #[test]
    fn whole_file_is_a_capture_and_mtime_short_circuits() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("notes.txt");
        std::fs::write(&path, "first version").unwrap();

        let s = settings(&path, None);
        let first = scan(&s, None).unwrap();
        assert_eq!(first.items.len(), 1);
        assert_eq!(first.items[0].title, "notes.txt");
        assert!(first.items[0]
            .natural_id
            .as_deref()
            .unwrap()
            .contains("notes.txt#"));

        // Stamped at the token: read again, same identity.
        let again = scan(&s, first.newest).unwrap();
        assert_eq!(again.items.len(), 1);
        assert_eq!(again.items[0].natural_id, first.items[0].natural_id);

        let later = first.newest.map(|n| n + 1);
        let skipped = scan(&s, later).unwrap();
        assert!(skipped.items.is_empty());
        assert_eq!(skipped.newest, None);
    }

    #[test]
    fn rewrite_within_the_same_tick_is_seen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("status.txt");
        std::fs::write(&path, "build passing").unwrap();
        let s = settings(&path, None);
        let first = scan(&s, None).unwrap();

        std::fs::write(&path, "build failing").unwrap();
        // Pin the mtime to the previous token, as a coarse clock would.
        let pinned = SystemTime::UNIX_EPOCH
            + std::time::Duration::from_nanos(first.newest.unwrap() as u64);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(pinned)
            .unwrap();

        let rescan = scan(&s, first.newest).unwrap();
        assert_eq!(rescan.items.len(), 1);
        assert_eq!(rescan.items[0].content, "build failing");
        assert_ne!(rescan.items[0].natural_id, first.items[0].natural_id);
    }

    #[test]
    fn regex_splits_file_into_items() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.md");
        std::fs::write(&path, "## 1 Alpha\nbody a\n## 2 Beta\nbody b\n").unwrap();

        let s = settings(&path, Some(r"(?m)^## (?P<id>\d+) (?P<title>[^\n]+)\n[^#]*"));
        let items = scan(&s, None).unwrap().items;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].natural_id.as_deref(), Some("1"));
        assert_eq!(items[0].title, "Alpha");
        assert!(items[1].content.contains("body b"));
    }

    #[test]
    fn directory_scan_applies_globs() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("a.md"), "A").unwrap();
        std::fs::write(tmp.path().join("sub/b.md"), "B").unwrap();
        std::fs::write(tmp.path().join("c.txt"), "C").unwrap();
        std::fs::write(tmp.path().join(".hidden.md"), "H").unwrap();

        let mut config = ConfigMap::new();
        config.insert("path".into(), tmp.path().display().to_string());
        config.insert("include".into(), "**/*.md".into());
        let s = FileSettings::from_config(&config).unwrap();

        let scan = scan(&s, None).unwrap();
        let ids: Vec<_> = scan
            .items
            .iter()
            .map(|i| i.natural_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["a.md".to_string(), "sub/b.md".to_string()]);
        assert!(scan.newest.is_some());
    }

    #[test]
    fn configuration_rejects_missing_path_and_bad_regex() {
        let adapter = FileAdapter;
        let err = adapter.update_configuration(ConfigMap::new()).unwrap_err();
        assert_eq!(err.field, "path");

        let tmp = TempDir::new().unwrap();
        let mut config = ConfigMap::new();
        config.insert("path".into(), tmp.path().display().to_string());
        config.insert("regex".into(), "(unclosed".into());
        let err = adapter.update_configuration(config).unwrap_err();
        assert_eq!(err.field, "regex");
    }
}
