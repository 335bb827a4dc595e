//! RSS 2.0, RSS 1.0 (RDF) and Atom feeds.
//!
//! Freshness is HTTP-level: the request carries the stored ETag and
//! Last-Modified validators, and a `304` ends the fetch with no items.
//!
//! # Configuration
//!
//! | Key | Required | Meaning |
//! |-----|----------|---------|
//! | `url` | yes | Feed URL (`http` or `https`) |
//! | `similarity_threshold` | no | Unused for feeds |
//!
//! # Field mapping
//!
//! | Item field | RSS | Atom |
//! |------------|-----|------|
//! | natural id | `guid` | `id` |
//! | link | `link` | `link[rel=alternate]@href` |
//! | summary | `description` | `summary` |
//! | content | `content:encoded` | `content` |
//! | author | `author`, `dc:creator` | `author/name` |
//! | published | `pubDate`, `dc:date` | `published`, `issued` |
//! | updated | – | `updated`, `modified` |

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{http, require_url, trimmed, Adapter, FetchSession};
use crate::error::{FetchError, ValidationError};
use crate::models::{ConfigMap, Icon, RawItem};

pub struct FeedAdapter;

#[async_trait]
impl Adapter for FeedAdapter {
    fn type_tag(&self) -> &str {
        "feed"
    }

    fn description(&self) -> &str {
        "RSS/Atom feed"
    }

    fn update_configuration(&self, config: ConfigMap) -> Result<ConfigMap, ValidationError> {
        let config = trimmed(config);
        require_url(&config, "url")?;
        Ok(config)
    }

    fn info(&self, config: &ConfigMap) -> Vec<(String, String)> {
        vec![(
            "url".to_string(),
            config.get("url").cloned().unwrap_or_default(),
        )]
    }

    async fn extract(&self, session: &mut FetchSession<'_>) -> Result<Vec<RawItem>, FetchError> {
        let url = session.require("url")?;
        let Some(body) = http::conditional_get(session.http, url, &mut session.metadata).await?
        else {
            return Ok(Vec::new());
        };

        let mut feed = parse_feed(&body)?;
        if let Ok(base) = url::Url::parse(url) {
            for item in &mut feed.items {
                if let Some(link) = item.link.as_deref() {
                    if let Ok(resolved) = base.join(link) {
                        item.link = Some(resolved.to_string());
                    }
                }
            }
        }

        tracing::debug!(url, title = %feed.title, items = feed.items.len(), "parsed feed");
        Ok(feed.items)
    }

    async fn icon(&self, session: &FetchSession<'_>) -> Option<Icon> {
        let url = session.source.config_value("url")?;
        http::fetch_favicon(session.http, url).await
    }
}

/// A parsed feed document.
#[derive(Debug, Default)]
pub struct ParsedFeed {
    pub title: String,
    pub link: Option<String>,
    pub items: Vec<RawItem>,
}

fn is_field(name: &[u8]) -> bool {
    matches!(
        name,
        b"title"
            | b"link"
            | b"guid"
            | b"id"
            | b"description"
            | b"summary"
            | b"encoded"
            | b"content"
            | b"name"
            | b"author"
            | b"creator"
            | b"pubDate"
            | b"published"
            | b"issued"
            | b"date"
            | b"updated"
            | b"modified"
    )
}

fn is_entry(name: &[u8]) -> bool {
    matches!(name, b"item" | b"entry")
}

/// Parse an RSS, RDF or Atom document.
pub fn parse_feed(xml: &str) -> Result<ParsedFeed, FetchError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut feed = ParsedFeed::default();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut current: Option<RawItem> = None;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name().as_ref().to_vec();
                if stack.is_empty() && !matches!(name.as_slice(), b"rss" | b"RDF" | b"feed") {
                    return Err(FetchError::parse("not an RSS or Atom document"));
                }
                if is_entry(&name) {
                    current = Some(RawItem::default());
                } else if name == b"link" {
                    link_from_attributes(&e, current.as_mut(), &mut feed);
                }
                if is_field(&name) {
                    text.clear();
                }
                stack.push(name);
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"link" {
                    link_from_attributes(&e, current.as_mut(), &mut feed);
                }
            }
            Ok(Event::Text(t)) => {
                let chunk = t.unescape().map_err(FetchError::parse)?;
                text.push_str(&chunk);
            }
            Ok(Event::CData(c)) => {
                text.push_str(&String::from_utf8_lossy(&c.into_inner()));
            }
            Ok(Event::End(e)) => {
                let name = e.local_name().as_ref().to_vec();
                stack.pop();
                let parent = stack.last().map(Vec::as_slice).unwrap_or_default();

                if is_entry(&name) {
                    if let Some(item) = current.take() {
                        feed.items.push(item);
                    }
                } else if let Some(item) = current.as_mut() {
                    assign_item_field(item, &name, parent, text.trim());
                } else if matches!(parent, b"channel" | b"feed") {
                    let value = text.trim();
                    match name.as_slice() {
                        b"title" if feed.title.is_empty() => feed.title = value.to_string(),
                        b"link" if feed.link.is_none() && !value.is_empty() => {
                            feed.link = Some(value.to_string())
                        }
                        _ => {}
                    }
                }

                if is_field(&name) {
                    text.clear();
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(FetchError::parse(e)),
            _ => {}
        }
    }

    Ok(feed)
}

fn assign_item_field(item: &mut RawItem, name: &[u8], parent: &[u8], value: &str) {
    let owned = || Some(value.to_string()).filter(|v| !v.is_empty());
    if name == b"name" {
        if parent == b"author" && item.author.is_none() {
            item.author = owned();
        }
        return;
    }
    if !is_entry(parent) {
        return;
    }
    match name {
        b"title" => item.title = value.to_string(),
        b"link" if item.link.is_none() => item.link = owned(),
        b"guid" | b"id" => item.natural_id = owned(),
        b"description" | b"summary" => item.summary = value.to_string(),
        b"encoded" | b"content" => item.content = value.to_string(),
        b"author" | b"creator" if item.author.is_none() => item.author = owned(),
        b"pubDate" | b"published" | b"issued" | b"date" => item.published = parse_date(value),
        b"updated" | b"modified" => item.updated = parse_date(value),
        _ => {}
    }
}

/// Atom `<link href=".." rel="alternate"/>`; a missing `rel` means alternate.
fn link_from_attributes(e: &BytesStart<'_>, item: Option<&mut RawItem>, feed: &mut ParsedFeed) {
    let mut href = None;
    let mut rel = String::from("alternate");
    for attr in e.attributes().flatten() {
        let Ok(value) = attr.unescape_value() else {
            continue;
        };
        match attr.key.local_name().as_ref() {
            b"href" => href = Some(value.into_owned()),
            b"rel" => rel = value.into_owned(),
            _ => {}
        }
    }
    let Some(href) = href.filter(|h| !h.is_empty()) else {
        return;
    };
    if rel != "alternate" {
        return;
    }
    match item {
        Some(item) if item.link.is_none() => item.link = Some(href),
        Some(_) => {}
        None if feed.link.is_none() => feed.link = Some(href),
        None => {}
    }
}

/// RFC 2822, RFC 3339, or a bare `YYYY-MM-DD` date.
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|d| d.and_utc())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/"
     xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel>
    <title>Example News</title>
    <link>https://example.com/</link>
    <item>
      <title>First &amp; foremost</title>
      <link>https://example.com/1</link>
      <guid isPermaLink="false">post-1</guid>
      <description>Short &lt;b&gt;summary&lt;/b&gt;</description>
      <content:encoded><![CDATA[<p>Full body</p>]]></content:encoded>
      <dc:creator>Ada</dc:creator>
      <pubDate>Tue, 10 Jun 2025 04:00:00 GMT</pubDate>
    </item>
    <item>
      <title>Second</title>
      <link>/2</link>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Log</title>
  <link href="https://atom.example/" />
  <link rel="self" href="https://atom.example/feed.xml" />
  <entry>
    <title>Entry one</title>
    <id>urn:uuid:1</id>
    <link rel="edit" href="https://atom.example/edit/1"/>
    <link href="https://atom.example/1"/>
    <author><name>Grace</name><email>g@example.com</email></author>
    <published>2025-06-01T10:00:00Z</published>
    <updated>2025-06-02T10:00:00+02:00</updated>
    <summary>Sum</summary>
    <content type="xhtml"><div><p>Body text</p></div></content>
  </entry>
</feed>"#;

    #[test]
    fn parses_rss_items() {
        let feed = parse_feed(RSS).unwrap();
        assert_eq!(feed.title, "Example News");
        assert_eq!(feed.link.as_deref(), Some("https://example.com/"));
        assert_eq!(feed.items.len(), 2);

        let first = &feed.items[0];
        assert_eq!(first.title, "First & foremost");
        assert_eq!(first.natural_id.as_deref(), Some("post-1"));
        assert_eq!(first.summary, "Short <b>summary</b>");
        assert_eq!(first.content, "<p>Full body</p>");
        assert_eq!(first.author.as_deref(), Some("Ada"));
        assert_eq!(
            first.published.map(|d| d.to_rfc3339()),
            Some("2025-06-10T04:00:00+00:00".to_string())
        );

        let second = &feed.items[1];
        assert_eq!(second.natural_id, None);
        assert_eq!(second.link.as_deref(), Some("/2"));
        assert!(second.published.is_none());
    }

    #[test]
    fn parses_atom_entries() {
        let feed = parse_feed(ATOM).unwrap();
        assert_eq!(feed.title, "Atom Log");
        assert_eq!(feed.link.as_deref(), Some("https://atom.example/"));

        let entry = &feed.items[0];
        assert_eq!(entry.title, "Entry one");
        assert_eq!(entry.natural_id.as_deref(), Some("urn:uuid:1"));
        assert_eq!(entry.link.as_deref(), Some("https://atom.example/1"));
        assert_eq!(entry.author.as_deref(), Some("Grace"));
        assert_eq!(entry.summary, "Sum");
        assert_eq!(entry.content, "Body text");
        assert_eq!(
            entry.updated.map(|d| d.to_rfc3339()),
            Some("2025-06-02T08:00:00+00:00".to_string())
        );
    }

    #[test]
    fn parses_rdf_items() {
        let rdf = r#"<rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#"
                      xmlns="http://purl.org/rss/1.0/">
            <channel><title>RDF</title></channel>
            <item><title>One</title><link>https://rdf.example/1</link></item>
        </rdf:RDF>"#;
        let feed = parse_feed(rdf).unwrap();
        assert_eq!(feed.title, "RDF");
        assert_eq!(feed.items.len(), 1);
        assert_eq!(feed.items[0].link.as_deref(), Some("https://rdf.example/1"));
    }

    #[test]
    fn rejects_non_feed_documents() {
        assert!(parse_feed("<html><body>hi</body></html>").is_err());
        assert!(parse_feed("<rss><channel><item></rss>").is_err());
    }

    #[test]
    fn date_formats() {
        assert!(parse_date("Mon, 02 Jun 2025 10:00:00 +0000").is_some());
        assert!(parse_date("2025-06-02T10:00:00Z").is_some());
        assert_eq!(
            parse_date("2025-06-02").map(|d| d.timestamp()),
            Some(1_748_822_400)
        );
        assert!(parse_date("yesterday").is_none());
        assert!(parse_date("").is_none());
    }
}
