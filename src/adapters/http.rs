//! HTTP helpers shared by network adapters.
//!
//! One [`reqwest::Client`] is built at startup from `[fetch]` and shared by
//! every worker. Conditional requests store their validators in the
//! source's runtime metadata under [`META_ETAG`] and [`META_LAST_MODIFIED`].

use anyhow::{Context, Result};
use reqwest::header::{
    HeaderMap, HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use reqwest::StatusCode;
use std::time::Duration;

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::models::{Icon, MetadataMap};

pub const META_ETAG: &str = "etag";
pub const META_LAST_MODIFIED: &str = "last_modified";

/// Icons above this size are ignored.
const MAX_ICON_BYTES: usize = 256 * 1024;

pub fn build_client(config: &FetchConfig) -> Result<reqwest::Client> {
    let timeout = Duration::from_secs(config.timeout_secs);
    reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}

/// GET `url` with `If-None-Match` / `If-Modified-Since` taken from
/// `metadata`. Returns `None` on `304 Not Modified`; otherwise the body,
/// with the new validators written back into `metadata`.
pub async fn conditional_get(
    client: &reqwest::Client,
    url: &str,
    metadata: &mut MetadataMap,
) -> Result<Option<String>, FetchError> {
    let mut request = client.get(url);
    if let Some(etag) = metadata.get(META_ETAG) {
        request = request.header(IF_NONE_MATCH, etag.as_str());
    }
    if let Some(modified) = metadata.get(META_LAST_MODIFIED) {
        request = request.header(IF_MODIFIED_SINCE, modified.as_str());
    }

    let response = request.send().await.map_err(|e| FetchError::http(url, e))?;
    if response.status() == StatusCode::NOT_MODIFIED {
        tracing::debug!(url, "not modified");
        return Ok(None);
    }
    if !response.status().is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    let etag = header_string(response.headers(), ETAG);
    let modified = header_string(response.headers(), LAST_MODIFIED);

    let body = response.text().await.map_err(|e| FetchError::http(url, e))?;

    set_or_clear(metadata, META_ETAG, etag);
    set_or_clear(metadata, META_LAST_MODIFIED, modified);

    Ok(Some(body))
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn set_or_clear(metadata: &mut MetadataMap, key: &str, value: Option<String>) {
    match value {
        Some(v) => {
            metadata.insert(key.to_string(), v);
        }
        None => {
            metadata.remove(key);
        }
    }
}

/// Plain GET returning the body text.
pub async fn get_text(client: &reqwest::Client, url: &str) -> Result<String, FetchError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| FetchError::http(url, e))?;
    if !response.status().is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }
    response.text().await.map_err(|e| FetchError::http(url, e))
}

pub async fn get_json(client: &reqwest::Client, url: &str) -> Result<serde_json::Value, FetchError> {
    let body = get_text(client, url).await?;
    serde_json::from_str(&body).map_err(|e| FetchError::parse(format!("{url}: {e}")))
}

/// `/favicon.ico` on the host of `page_url`. Any failure yields `None`.
pub async fn fetch_favicon(client: &reqwest::Client, page_url: &str) -> Option<Icon> {
    let base = url::Url::parse(page_url).ok()?;
    let icon_url = base.join("/favicon.ico").ok()?;

    let response = client.get(icon_url.as_str()).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    let bytes = response.bytes().await.ok()?;
    if bytes.is_empty() || bytes.len() > MAX_ICON_BYTES {
        return None;
    }
    Some(Icon {
        bytes: bytes.to_vec(),
        name: icon_url.to_string(),
    })
}
