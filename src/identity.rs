//! Identity and change detection for fetched items.
//!
//! Every [`RawItem`] gets a stable `internal_id` (unique per source) and a
//! content fingerprint. Against the prior record with the same identity the
//! detector decides:
//!
//! | Prior record | Fingerprint | `updated` | Decision |
//! |--------------|-------------|-----------|----------|
//! | none | – | – | [`ChangeDecision::Insert`] |
//! | present | same | stored ≥ new | [`ChangeDecision::Skip`] |
//! | present | otherwise | | [`ChangeDecision::Update`] |
//!
//! Coarse captures (whole pages, whole files) additionally go through a
//! similarity check against the most recent stored article.

use sha2::{Digest, Sha256};

use crate::models::{
    Article, Candidate, MetadataMap, RawItem, META_CONTENT_HASH, META_PREVIOUS_HASH,
    META_SIMILARITY, META_UPDATE_COUNT,
};

/// What to do with an item given its prior record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDecision {
    Skip,
    Update(i64),
    Insert,
}

/// Collapse whitespace and decode entities so cosmetic changes do not
/// register as content changes.
pub fn normalize(text: &str) -> String {
    let decoded = html_escape::decode_html_entities(text);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Hash of normalized content, summary, author and title.
pub fn fingerprint(item: &RawItem) -> String {
    let mut hasher = Sha256::new();
    for part in [
        item.content.as_str(),
        item.summary.as_str(),
        item.author.as_deref().unwrap_or(""),
        item.title.as_str(),
    ] {
        hasher.update(normalize(part).as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Stable identity: natural id, else link, else a hash of title, author
/// and source id.
pub fn internal_id(source_id: i64, item: &RawItem) -> String {
    if let Some(id) = item.natural_id.as_deref().map(str::trim) {
        if !id.is_empty() {
            return id.to_string();
        }
    }
    if let Some(link) = item.link.as_deref().map(str::trim) {
        if !link.is_empty() {
            return link.to_string();
        }
    }
    let mut hasher = Sha256::new();
    hasher.update(normalize(&item.title).as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize(item.author.as_deref().unwrap_or("")).as_bytes());
    hasher.update([0u8]);
    hasher.update(source_id.to_le_bytes());
    format!("sha256:{:x}", hasher.finalize())
}

/// `updated` is the item's own timestamp; an undated item is never newer
/// than its stored record.
pub fn decide(prior: Option<&Article>, fingerprint: &str, updated: Option<i64>) -> ChangeDecision {
    match prior {
        None => ChangeDecision::Insert,
        Some(article) => {
            let unchanged = article.content_hash() == Some(fingerprint);
            let newer = updated.is_some_and(|u| u > article.updated);
            if unchanged && !newer {
                ChangeDecision::Skip
            } else {
                ChangeDecision::Update(article.id)
            }
        }
    }
}

/// Bigram similarity of two captures' normalized text, in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    strsim::sorensen_dice(&normalize(a), &normalize(b))
}

/// Text compared by the near-duplicate check.
pub fn comparable_text(content: &str, summary: &str) -> String {
    if content.trim().is_empty() {
        summary.to_string()
    } else {
        content.to_string()
    }
}

/// Build the candidate for an item that is being inserted or updated.
pub fn to_candidate(
    item: RawItem,
    internal_id: String,
    fingerprint: String,
    updated: i64,
    prior: Option<&Article>,
) -> Candidate {
    let mut metadata = MetadataMap::new();
    metadata.insert(META_CONTENT_HASH.to_string(), fingerprint);

    let existing_id = prior.map(|article| {
        let count = article
            .metadata
            .get(META_UPDATE_COUNT)
            .and_then(|c| c.parse::<u64>().ok())
            .unwrap_or(0);
        metadata.insert(META_UPDATE_COUNT.to_string(), (count + 1).to_string());
        if let Some(previous) = article.content_hash() {
            metadata.insert(META_PREVIOUS_HASH.to_string(), previous.to_string());
        }
        article.id
    });

    Candidate {
        internal_id,
        title: item.title,
        link: item.link,
        author: item.author,
        summary: item.summary,
        content: item.content,
        published: item.published.map(|p| p.timestamp()),
        updated,
        score: 0,
        metadata,
        existing_id,
    }
}

/// Record the similarity ratio on a candidate.
pub fn note_similarity(candidate: &mut Candidate, ratio: f64) {
    candidate
        .metadata
        .insert(META_SIMILARITY.to_string(), format!("{:.4}", ratio));
}
