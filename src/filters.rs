//! Scoring filter pipeline.
//!
//! Filters never drop items themselves; each one maps `(candidate, score)`
//! to a new score. After the whole chain has run the score is clamped to
//! `[-100, 100]` and candidates below the effective min score are removed
//! from the accepted set.
//!
//! | Name | Parameters | Effect |
//! |------|------------|--------|
//! | `length` | `min_length`, `score` (default -10) | adds `score` when title + summary + content text is shorter than `min_length` chars |
//! | `keyword` | `keywords` (comma-separated), `score` (default 10) | adds `score` when any keyword occurs, case-insensitively |
//! | `baseline` | `score` | adds `score` to every item, shifting the threshold gate |
//!
//! Global filters (`source_id = None`) run before per-source filters, and
//! only when the source applies globals.

use regex::Regex;
use std::collections::BTreeMap;

use crate::config::Defaults;
use crate::error::{SyncError, ValidationError};
use crate::models::{Candidate, ConfigMap, FilterConfig, Source, SCORE_MAX, SCORE_MIN};
use crate::store::Store;

/// A scoring transform.
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    /// Return the new score for `candidate` given the score so far.
    fn score(&self, candidate: &Candidate, score: i64) -> i64;
}

fn param_int(params: &ConfigMap, key: &str, default: Option<i64>) -> Result<i64, ValidationError> {
    match params.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(v) => v
            .parse::<i64>()
            .map_err(|_| ValidationError::new(key, format!("expected an integer, got '{}'", v))),
        None => default.ok_or_else(|| ValidationError::missing(key)),
    }
}

fn param_score(params: &ConfigMap, default: Option<i64>) -> Result<i64, ValidationError> {
    let score = param_int(params, "score", default)?;
    if !(SCORE_MIN..=SCORE_MAX).contains(&score) {
        return Err(ValidationError::new("score", "must be in [-100, 100]"));
    }
    Ok(score)
}

// ═══════════════════════════════════════════════════════════════════════
// Built-in filters
// ═══════════════════════════════════════════════════════════════════════

pub struct LengthFilter {
    min_length: usize,
    score: i64,
    tags: Regex,
}

impl LengthFilter {
    pub fn from_params(params: &ConfigMap) -> Result<Self, ValidationError> {
        let min_length = param_int(params, "min_length", None)?;
        if min_length < 1 {
            return Err(ValidationError::new("min_length", "must be >= 1"));
        }
        let tags = Regex::new(r"<[^>]*>").map_err(|e| ValidationError::new("min_length", e))?;
        Ok(Self {
            min_length: min_length as usize,
            score: param_score(params, Some(-10))?,
            tags,
        })
    }

    fn text_length(&self, text: &str) -> usize {
        let stripped = self.tags.replace_all(text, " ");
        stripped
            .split_whitespace()
            .map(|w| w.chars().count())
            .sum()
    }
}

impl Filter for LengthFilter {
    fn name(&self) -> &str {
        "length"
    }

    fn score(&self, candidate: &Candidate, score: i64) -> i64 {
        let length = self.text_length(&candidate.title)
            + self.text_length(&candidate.summary)
            + self.text_length(&candidate.content);
        if length < self.min_length {
            score + self.score
        } else {
            score
        }
    }
}

pub struct KeywordFilter {
    keywords: Vec<String>,
    score: i64,
}

impl KeywordFilter {
    pub fn from_params(params: &ConfigMap) -> Result<Self, ValidationError> {
        let keywords: Vec<String> = params
            .get("keywords")
            .map(|v| {
                v.split(',')
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if keywords.is_empty() {
            return Err(ValidationError::missing("keywords"));
        }
        Ok(Self {
            keywords,
            score: param_score(params, Some(10))?,
        })
    }
}

impl Filter for KeywordFilter {
    fn name(&self) -> &str {
        "keyword"
    }

    fn score(&self, candidate: &Candidate, score: i64) -> i64 {
        let haystacks = [
            candidate.title.to_lowercase(),
            candidate.summary.to_lowercase(),
            candidate.content.to_lowercase(),
        ];
        let hit = self
            .keywords
            .iter()
            .any(|k| haystacks.iter().any(|h| h.contains(k.as_str())));
        if hit {
            score + self.score
        } else {
            score
        }
    }
}

pub struct BaselineFilter {
    score: i64,
}

impl BaselineFilter {
    pub fn from_params(params: &ConfigMap) -> Result<Self, ValidationError> {
        Ok(Self {
            score: param_score(params, None)?,
        })
    }
}

impl Filter for BaselineFilter {
    fn name(&self) -> &str {
        "baseline"
    }

    fn score(&self, _candidate: &Candidate, score: i64) -> i64 {
        score + self.score
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry and pipeline
// ═══════════════════════════════════════════════════════════════════════

type Constructor = fn(&ConfigMap) -> Result<Box<dyn Filter>, ValidationError>;

/// Filter names mapped to constructors.
pub struct FilterRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("length", |p| Ok(Box::new(LengthFilter::from_params(p)?)));
        registry.register("keyword", |p| Ok(Box::new(KeywordFilter::from_params(p)?)));
        registry.register("baseline", |p| Ok(Box::new(BaselineFilter::from_params(p)?)));
        registry
    }

    pub fn register(&mut self, name: &str, constructor: Constructor) {
        self.constructors.insert(name.to_string(), constructor);
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Construct one filter; used to validate configurations at add time.
    pub fn build(&self, name: &str, params: &ConfigMap) -> Result<Box<dyn Filter>, SyncError> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| SyncError::UnknownFilter(name.to_string()))?;
        Ok(constructor(params)?)
    }

    /// Build the ordered pipeline for a list of filter configurations.
    pub fn pipeline(&self, configs: &[FilterConfig]) -> Result<FilterPipeline, SyncError> {
        let filters = configs
            .iter()
            .map(|c| self.build(&c.name, &c.params))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FilterPipeline { filters })
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-source override when "use default" is off, else the global default.
pub fn effective_min_score(source: &Source, defaults: &Defaults) -> i64 {
    if source.use_default_min_score {
        defaults.min_score
    } else {
        source.min_score
    }
}

pub struct FilterPipeline {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterPipeline {
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Score every candidate, clamp, and keep those at or above `min_score`.
    /// Returns the accepted candidates and the number rejected.
    pub fn run(&self, candidates: Vec<Candidate>, min_score: i64) -> (Vec<Candidate>, usize) {
        let total = candidates.len();
        let accepted: Vec<Candidate> = candidates
            .into_iter()
            .map(|mut candidate| {
                let score = self
                    .filters
                    .iter()
                    .fold(candidate.score, |score, f| f.score(&candidate, score));
                candidate.score = score.clamp(SCORE_MIN, SCORE_MAX);
                candidate
            })
            .filter(|c| c.score >= min_score)
            .collect();
        let rejected = total - accepted.len();
        (accepted, rejected)
    }
}

/// Validate a filter configuration by constructing it, then persist it.
pub async fn add_filter(
    store: &dyn Store,
    registry: &FilterRegistry,
    name: &str,
    source_id: Option<i64>,
    params: ConfigMap,
) -> Result<FilterConfig, SyncError> {
    registry.build(name, &params)?;
    if let Some(id) = source_id {
        if store.get_source(id).await?.is_none() {
            return Err(ValidationError::new("source", format!("no source with id {}", id)).into());
        }
    }
    let mut filter = FilterConfig {
        id: 0,
        name: name.to_string(),
        source_id,
        enabled: true,
        params,
    };
    filter.id = store.insert_filter(&filter).await?;
    tracing::info!(filter_id = filter.id, filter = %name, ?source_id, "filter added");
    Ok(filter)
}

pub fn print_filters(filters: &[FilterConfig]) {
    if filters.is_empty() {
        println!("No filters configured.");
        return;
    }
    println!("{:<5} {:<10} {:<8} {:<8} PARAMS", "ID", "NAME", "SOURCE", "ENABLED");
    for f in filters {
        let params = f
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{:<5} {:<10} {:<8} {:<8} {}",
            f.id,
            f.name,
            f.source_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "global".to_string()),
            f.enabled,
            params
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetadataMap;

    fn candidate(title: &str, content: &str) -> Candidate {
        Candidate {
            internal_id: title.to_string(),
            title: title.to_string(),
            link: None,
            author: None,
            summary: String::new(),
            content: content.to_string(),
            published: None,
            updated: 0,
            score: 0,
            metadata: MetadataMap::new(),
            existing_id: None,
        }
    }

    fn params(pairs: &[(&str, &str)]) -> ConfigMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn config(name: &str, pairs: &[(&str, &str)]) -> FilterConfig {
        FilterConfig {
            id: 0,
            name: name.to_string(),
            source_id: None,
            enabled: true,
            params: params(pairs),
        }
    }

    #[test]
    fn short_entry_is_penalized_and_excluded() {
        let registry = FilterRegistry::with_builtins();
        let pipeline = registry
            .pipeline(&[config("length", &[("min_length", "50"), ("score", "-99")])])
            .unwrap();

        let (accepted, rejected) = pipeline.run(vec![candidate("", "ten chars!")], 0);
        assert!(accepted.is_empty());
        assert_eq!(rejected, 1);

        let pipeline = registry
            .pipeline(&[config("length", &[("min_length", "50"), ("score", "-99")])])
            .unwrap();
        let (accepted, _) = pipeline.run(vec![candidate("", "ten chars!")], -100);
        assert_eq!(accepted[0].score, -99);
    }

    #[test]
    fn length_ignores_markup() {
        let f = LengthFilter::from_params(&params(&[("min_length", "5")])).unwrap();
        assert_eq!(f.score(&candidate("", "<p><b>abcd</b></p>"), 0), -10);
        assert_eq!(f.score(&candidate("", "<p>abcdef</p>"), 0), 0);
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        let f = KeywordFilter::from_params(&params(&[("keywords", "Rust, tokio"), ("score", "25")]))
            .unwrap();
        assert_eq!(f.score(&candidate("Why RUST wins", ""), 0), 25);
        assert_eq!(f.score(&candidate("Gardening", "tomatoes"), 3), 3);
    }

    #[test]
    fn scores_are_clamped() {
        let registry = FilterRegistry::with_builtins();
        let pipeline = registry
            .pipeline(&[
                config("baseline", &[("score", "80")]),
                config("keyword", &[("keywords", "x"), ("score", "80")]),
            ])
            .unwrap();
        let (accepted, _) = pipeline.run(vec![candidate("x", "")], 0);
        assert_eq!(accepted[0].score, SCORE_MAX);
    }

    #[test]
    fn unknown_and_invalid_filters_are_rejected() {
        let registry = FilterRegistry::with_builtins();
        assert!(matches!(
            registry.pipeline(&[config("bayes", &[])]),
            Err(SyncError::UnknownFilter(name)) if name == "bayes"
        ));
        assert!(matches!(
            registry.build("length", &params(&[("min_length", "abc")])),
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            registry.build("baseline", &params(&[("score", "500")])),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn min_score_resolution() {
        let defaults = Defaults {
            min_score: 5,
            ..Defaults::default()
        };
        let mut source = Source::new("s", "feed");
        assert_eq!(effective_min_score(&source, &defaults), 5);
        source.use_default_min_score = false;
        source.min_score = -20;
        assert_eq!(effective_min_score(&source, &defaults), -20);
    }
}
