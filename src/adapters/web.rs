//! Web page monitoring.
//!
//! Three modes:
//!
//! | `mode` | Items | Identity |
//! |--------|-------|----------|
//! | `page` (default) | one capture of the whole `<body>` | URL + content fingerprint |
//! | `onepart` | one capture of the first `selector` match | URL + content fingerprint |
//! | `part` | one item per `selector` match | first link in the match, else title |
//!
//! Captures (`page`, `onepart`) have no natural identity granularity: every
//! distinct content becomes its own article, and near-identical captures are
//! suppressed by the similarity check against the most recent article.
//! Freshness uses the same HTTP validators as feeds.

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};

use super::{http, require_url, trimmed, Adapter, FetchSession};
use crate::error::{FetchError, ValidationError};
use crate::identity;
use crate::models::{ConfigMap, Icon, RawItem};

const SUMMARY_CHARS: usize = 500;
const TITLE_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebMode {
    Page,
    Part,
    OnePart,
}

impl WebMode {
    pub fn parse(value: Option<&str>) -> Result<Self, ValidationError> {
        match value.unwrap_or("page") {
            "page" => Ok(Self::Page),
            "part" => Ok(Self::Part),
            "onepart" => Ok(Self::OnePart),
            other => Err(ValidationError::new(
                "mode",
                format!("expected page, part or onepart, got '{}'", other),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::Part => "part",
            Self::OnePart => "onepart",
        }
    }
}

pub struct WebAdapter;

#[async_trait]
impl Adapter for WebAdapter {
    fn type_tag(&self) -> &str {
        "web"
    }

    fn description(&self) -> &str {
        "Web page or page fragments selected by CSS"
    }

    fn update_configuration(&self, config: ConfigMap) -> Result<ConfigMap, ValidationError> {
        let mut config = trimmed(config);
        require_url(&config, "url")?;
        let mode = WebMode::parse(config.get("mode").map(String::as_str))?;
        config.insert("mode".to_string(), mode.as_str().to_string());

        match config.get("selector").filter(|s| !s.is_empty()) {
            Some(selector) => {
                parse_selector(selector).map_err(|e| ValidationError::new("selector", e))?;
            }
            None if mode != WebMode::Page => return Err(ValidationError::missing("selector")),
            None => {}
        }
        Ok(config)
    }

    fn info(&self, config: &ConfigMap) -> Vec<(String, String)> {
        ["url", "mode", "selector"]
            .iter()
            .filter_map(|key| config.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect()
    }

    fn is_coarse(&self, config: &ConfigMap) -> bool {
        !matches!(
            WebMode::parse(config.get("mode").map(String::as_str)),
            Ok(WebMode::Part)
        )
    }

    async fn extract(&self, session: &mut FetchSession<'_>) -> Result<Vec<RawItem>, FetchError> {
        let url = session.require("url")?;
        let mode = WebMode::parse(session.source.config_value("mode"))
            .map_err(FetchError::parse)?;
        let selector = session.source.config_value("selector");

        let Some(body) = http::conditional_get(session.http, url, &mut session.metadata).await?
        else {
            return Ok(Vec::new());
        };

        let page_url = url::Url::parse(url).map_err(|e| FetchError::parse(format!("{url}: {e}")))?;
        let items = extract_items(&body, &page_url, mode, selector)?;
        tracing::debug!(url, mode = mode.as_str(), items = items.len(), "scraped page");
        Ok(items)
    }

    async fn icon(&self, session: &FetchSession<'_>) -> Option<Icon> {
        let url = session.source.config_value("url")?;
        http::fetch_favicon(session.http, url).await
    }
}

fn parse_selector(s: &str) -> Result<Selector, FetchError> {
    Selector::parse(s).map_err(|e| FetchError::parse(format!("selector '{s}': {e:?}")))
}

/// Turn an HTML document into raw items for `mode`.
pub fn extract_items(
    html: &str,
    page_url: &url::Url,
    mode: WebMode,
    selector: Option<&str>,
) -> Result<Vec<RawItem>, FetchError> {
    let document = Html::parse_document(html);
    let page_title = document_title(&document).unwrap_or_else(|| page_url.to_string());

    match mode {
        WebMode::Page => {
            let body_sel = parse_selector("body")?;
            let content = document
                .select(&body_sel)
                .next()
                .map(|b| b.inner_html())
                .unwrap_or_else(|| html.to_string());
            Ok(vec![capture(page_url, page_title, content)])
        }
        WebMode::OnePart => {
            let sel = parse_selector(selector.ok_or_else(|| FetchError::MissingConfig("selector".into()))?)?;
            Ok(document
                .select(&sel)
                .next()
                .map(|el| capture(page_url, page_title, el.html()))
                .into_iter()
                .collect())
        }
        WebMode::Part => {
            let sel = parse_selector(selector.ok_or_else(|| FetchError::MissingConfig("selector".into()))?)?;
            let heading_sel = parse_selector("h1, h2, h3, h4, h5, h6")?;
            let link_sel = parse_selector("a[href]")?;
            Ok(document
                .select(&sel)
                .filter_map(|el| part_item(&el, page_url, &heading_sel, &link_sel))
                .collect())
        }
    }
}

fn document_title(document: &Html) -> Option<String> {
    let sel = Selector::parse("title").ok()?;
    let title = collapse(&document.select(&sel).next()?.text().collect::<String>());
    Some(title).filter(|t| !t.is_empty())
}

fn capture(page_url: &url::Url, title: String, content: String) -> RawItem {
    let mut item = RawItem {
        title,
        link: Some(page_url.to_string()),
        content,
        ..Default::default()
    };
    let fingerprint = identity::fingerprint(&item);
    item.natural_id = Some(format!("{}#{}", page_url, &fingerprint[..16]));
    item
}

fn part_item(
    el: &ElementRef<'_>,
    page_url: &url::Url,
    heading_sel: &Selector,
    link_sel: &Selector,
) -> Option<RawItem> {
    let text = collapse(&el.text().collect::<String>());
    if text.is_empty() {
        return None;
    }

    let title = el
        .select(heading_sel)
        .next()
        .map(|h| collapse(&h.text().collect::<String>()))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| truncate(&text, TITLE_CHARS));

    let href = el
        .value()
        .attr("href")
        .or_else(|| el.select(link_sel).next().and_then(|a| a.value().attr("href")));
    let link = href
        .and_then(|h| page_url.join(h).ok())
        .map(|u| u.to_string());

    Some(RawItem {
        title,
        link,
        summary: truncate(&text, SUMMARY_CHARS),
        content: el.html(),
        ..Default::default()
    })
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max).collect();
        out.push('…');
        out
    }
}
