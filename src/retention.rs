//! Retention pass.
//!
//! For every source with `delete_old_articles` set, delete articles beyond
//! the newest `num_articles_to_keep` (by `updated`) and/or older than
//! `age_articles_to_keep` days. Starred articles are never deleted. Sources
//! currently held by a worker are skipped and picked up on the next pass.

use anyhow::Result;
use serde::Serialize;

use crate::models::Source;
use crate::store::Store;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Sources whose policy was applied.
    pub sources: usize,
    /// Sources skipped because a worker held them.
    pub skipped: usize,
    pub deleted: u64,
}

/// `(keep, older_than)` for a source, or `None` when it retains everything.
pub fn policy(source: &Source, now: i64) -> Option<(Option<i64>, Option<i64>)> {
    if !source.delete_old_articles {
        return None;
    }
    let keep = (source.num_articles_to_keep > 0).then_some(source.num_articles_to_keep);
    let older_than =
        (source.age_articles_to_keep > 0).then(|| now - source.age_articles_to_keep * 86_400);
    if keep.is_none() && older_than.is_none() {
        return None;
    }
    Some((keep, older_than))
}

pub async fn run_cleanup(store: &dyn Store, now: i64) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();

    for source in store.list_sources().await? {
        let Some((keep, older_than)) = policy(&source, now) else {
            continue;
        };
        if source.processing {
            report.skipped += 1;
            continue;
        }

        let deleted = store.prune_articles(source.id, keep, older_than).await?;
        if deleted > 0 {
            tracing::debug!(source_id = source.id, deleted, "pruned articles");
        }
        report.sources += 1;
        report.deleted += deleted;
    }

    tracing::info!(
        sources = report.sources,
        skipped = report.skipped,
        deleted = report.deleted,
        "cleanup finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_requires_flag_and_a_rule() {
        let now = 10 * 86_400;
        let mut source = Source::new("s", "feed");
        source.num_articles_to_keep = 100;
        assert_eq!(policy(&source, now), None);

        source.delete_old_articles = true;
        assert_eq!(policy(&source, now), Some((Some(100), None)));

        source.age_articles_to_keep = 3;
        assert_eq!(policy(&source, now), Some((Some(100), Some(7 * 86_400))));

        source.num_articles_to_keep = 0;
        source.age_articles_to_keep = 0;
        assert_eq!(policy(&source, now), None);
    }
}
