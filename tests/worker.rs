mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::{dated, item, now, Harness};
use feedloom::filters;
use feedloom::models::{
    Candidate, FilterConfig, MetadataMap, RefreshTarget, META_PREVIOUS_HASH, META_UPDATE_COUNT,
};
use feedloom::notify::Event;
use feedloom::store::{MergeOutcome, Store, SuccessFinish};
use feedloom::worker::{run_job, JobOutcome};

#[tokio::test]
async fn test_success_inserts_and_schedules_next_refresh() {
    let mut h = Harness::new().await;
    h.mock.set_items(vec![
        item("a", "Alpha", "first body"),
        item("b", "Beta", "second body"),
    ]);
    let source = h.add_source("news").await;

    let before = now();
    let outcome = run_job(&h.ctx, source.id).await;
    assert_eq!(
        outcome,
        JobOutcome::Completed {
            new_articles: 2,
            updated_articles: 0,
            rejected: 0
        }
    );

    let stored = h.source(source.id).await;
    assert!(!stored.processing);
    assert!(stored.last_refreshed.is_some());
    assert!(stored.last_error.is_none());
    assert!(stored.next_refresh >= before + stored.interval_secs);
    assert_eq!(h.store.count_articles(source.id).await.unwrap(), 2);

    let events = h.drain_events();
    assert!(events.contains(&Event::SourceUpdated {
        source_id: source.id,
        group_id: None,
        new_articles: 2,
        updated_articles: 0,
    }));
}

#[tokio::test]
async fn test_failure_records_error_and_keeps_interval() {
    let h = Harness::new().await;
    h.mock.fail("feed is not XML");
    let source = h.add_source("broken").await;

    let before = now();
    let outcome = run_job(&h.ctx, source.id).await;
    match outcome {
        JobOutcome::Failed { error } => assert!(error.contains("feed is not XML"), "{}", error),
        other => panic!("expected failure, got {:?}", other),
    }

    let stored = h.source(source.id).await;
    assert!(!stored.processing, "claim must be released on failure");
    assert!(stored.last_error.as_deref().unwrap().contains("feed is not XML"));
    assert!(stored.last_error_date.is_some());
    assert!(stored.last_refreshed.is_none());
    // No backoff: the next attempt is one ordinary interval away.
    assert!(stored.next_refresh >= before + stored.interval_secs);
    assert!(stored.next_refresh <= now() + stored.interval_secs);
    assert_eq!(h.store.count_articles(source.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_success_clears_previous_error() {
    let h = Harness::new().await;
    h.mock.fail("timeout");
    let source = h.add_source("flaky").await;
    run_job(&h.ctx, source.id).await;
    assert!(h.source(source.id).await.last_error.is_some());

    *h.mock.fail_with.lock().unwrap() = None;
    h.store
        .force_refresh(RefreshTarget::Source(source.id), now())
        .await
        .unwrap();
    let outcome = run_job(&h.ctx, source.id).await;
    assert!(matches!(outcome, JobOutcome::Completed { .. }));
    assert!(h.source(source.id).await.last_error.is_none());
}

#[tokio::test]
async fn test_source_not_due_is_not_claimed() {
    let h = Harness::new().await;
    let source = h
        .add_source_with("later", |s| s.next_refresh = now() + 600)
        .await;

    assert_eq!(run_job(&h.ctx, source.id).await, JobOutcome::NotClaimed);
    assert_eq!(h.mock.calls(), 0);
}

#[tokio::test]
async fn test_disabled_source_is_not_claimed() {
    let h = Harness::new().await;
    let source = h.add_source_with("off", |s| s.enabled = false).await;

    assert_eq!(run_job(&h.ctx, source.id).await, JobOutcome::NotClaimed);
    assert_eq!(h.mock.calls(), 0);
}

#[tokio::test]
async fn test_repeated_refresh_is_idempotent() {
    let h = Harness::new().await;
    h.mock.set_items(vec![
        item("a", "Alpha", "first body"),
        item("b", "Beta", "second body"),
    ]);
    let source = h.add_source("stable").await;
    run_job(&h.ctx, source.id).await;

    h.store
        .force_refresh(RefreshTarget::Source(source.id), now())
        .await
        .unwrap();
    let outcome = run_job(&h.ctx, source.id).await;
    assert_eq!(
        outcome,
        JobOutcome::Completed {
            new_articles: 0,
            updated_articles: 0,
            rejected: 0
        }
    );
    assert_eq!(h.store.count_articles(source.id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_changed_item_updates_in_place_and_keeps_user_flags() {
    let h = Harness::new().await;
    h.mock.set_items(vec![item("a", "Alpha", "first draft")]);
    let source = h.add_source("edits").await;
    run_job(&h.ctx, source.id).await;

    let original = h.store.find_article(source.id, "a").await.unwrap().unwrap();
    h.store
        .set_article_flags(original.id, Some(true), Some(true))
        .await
        .unwrap();

    h.mock.set_items(vec![item("a", "Alpha", "second draft")]);
    h.store
        .force_refresh(RefreshTarget::Source(source.id), now())
        .await
        .unwrap();
    let outcome = run_job(&h.ctx, source.id).await;
    assert_eq!(
        outcome,
        JobOutcome::Completed {
            new_articles: 0,
            updated_articles: 1,
            rejected: 0
        }
    );

    let updated = h.store.find_article(source.id, "a").await.unwrap().unwrap();
    assert_eq!(updated.id, original.id);
    assert_eq!(updated.content, "second draft");
    assert!(updated.read && updated.starred);
    assert_eq!(updated.metadata.get(META_UPDATE_COUNT).map(String::as_str), Some("1"));
    assert_eq!(
        updated.metadata.get(META_PREVIOUS_HASH).map(String::as_str),
        original.content_hash()
    );
    assert_eq!(h.store.count_articles(source.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_adapter_is_recorded_on_source() {
    let h = Harness::new().await;
    let mut source = feedloom::models::Source::new("gone", "gopher");
    source.id = h.store.insert_source(&source).await.unwrap();

    match run_job(&h.ctx, source.id).await {
        JobOutcome::Failed { error } => assert!(error.contains("gopher"), "{}", error),
        other => panic!("expected failure, got {:?}", other),
    }
    let stored = h.source(source.id).await;
    assert!(stored.last_error.unwrap().contains("gopher"));
    assert!(!stored.processing);
}

#[tokio::test]
async fn test_filters_gate_candidates_below_min_score() {
    let h = Harness::new().await;
    h.mock.set_items(vec![
        item("short", "Hi", "tiny"),
        item(
            "long",
            "A proper article",
            "with enough words in the body to clear the length threshold easily",
        ),
    ]);
    let source = h.add_source("scored").await;

    let params: BTreeMap<String, String> = [
        ("min_length".to_string(), "20".to_string()),
        ("score".to_string(), "-99".to_string()),
    ]
    .into_iter()
    .collect();
    filters::add_filter(h.store.as_ref(), &h.ctx.filters, "length", None, params)
        .await
        .unwrap();

    let outcome = run_job(&h.ctx, source.id).await;
    assert_eq!(
        outcome,
        JobOutcome::Completed {
            new_articles: 1,
            updated_articles: 0,
            rejected: 1
        }
    );
    assert!(h.store.find_article(source.id, "short").await.unwrap().is_none());
    assert!(h.store.find_article(source.id, "long").await.unwrap().is_some());
}

#[tokio::test]
async fn test_filters_skipped_when_source_opts_out() {
    let h = Harness::new().await;
    h.mock.set_items(vec![item("short", "Hi", "tiny")]);
    let source = h.add_source_with("raw", |s| s.use_filters = false).await;

    let params: BTreeMap<String, String> =
        [("score".to_string(), "-50".to_string())].into_iter().collect();
    filters::add_filter(h.store.as_ref(), &h.ctx.filters, "baseline", None, params)
        .await
        .unwrap();

    let outcome = run_job(&h.ctx, source.id).await;
    assert!(matches!(outcome, JobOutcome::Completed { new_articles: 1, .. }));
}

#[tokio::test]
async fn test_concurrent_jobs_claim_once() {
    let h = Harness::new().await;
    h.mock.set_items(vec![item("a", "Alpha", "body")]);
    h.mock.set_delay(Duration::from_millis(100));
    let source = h.add_source("contended").await;

    let (first, second) = tokio::join!(run_job(&h.ctx, source.id), run_job(&h.ctx, source.id));
    let completed = [&first, &second]
        .iter()
        .filter(|o| matches!(o, JobOutcome::Completed { .. }))
        .count();
    assert_eq!(completed, 1, "first={:?} second={:?}", first, second);
    assert!(first == JobOutcome::NotClaimed || second == JobOutcome::NotClaimed);
    assert_eq!(h.mock.calls(), 1);
}

#[tokio::test]
async fn test_released_claim_discards_results() {
    let h = Harness::new().await;
    h.mock.set_items(vec![item("a", "Alpha", "body")]);
    h.mock.set_delay(Duration::from_millis(200));
    let source = h.add_source("reset").await;

    let ctx = h.ctx.clone();
    let job = tokio::spawn(async move { run_job(&ctx, source.id).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.store.reset_stale_claims().await.unwrap();

    assert_eq!(job.await.unwrap(), JobOutcome::Aborted);
    assert_eq!(h.store.count_articles(source.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_group_event_follows_source_event() {
    let mut h = Harness::new().await;
    h.mock.set_items(vec![item("a", "Alpha", "body")]);
    let source = h.add_source_with("grouped", |s| s.group_id = Some(4)).await;

    run_job(&h.ctx, source.id).await;
    let events = h.drain_events();
    let updated = events
        .iter()
        .position(|e| matches!(e, Event::SourceUpdated { .. }))
        .unwrap();
    let group = events
        .iter()
        .position(|e| *e == Event::GroupUpdated { group_id: 4 })
        .unwrap();
    assert!(updated < group);
}

#[tokio::test]
async fn test_count_limit_keeps_most_recent_items() {
    let h = Harness::new().await;
    h.mock.set_items(vec![
        dated("h3", 3 * 3600),
        dated("h1", 3600),
        dated("h4", 4 * 3600),
        dated("h2", 2 * 3600),
    ]);
    let source = h
        .add_source_with("capped", |s| s.max_articles_to_load = 2)
        .await;

    let outcome = run_job(&h.ctx, source.id).await;
    assert!(matches!(outcome, JobOutcome::Completed { new_articles: 2, .. }));
    let mut ids: Vec<_> = h
        .store
        .list_articles(source.id, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.internal_id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["h1".to_string(), "h2".to_string()]);
}

#[tokio::test]
async fn test_age_window_drops_old_dated_items() {
    let h = Harness::new().await;
    h.mock.set_items(vec![
        dated("old", 10 * 86_400),
        dated("fresh", 86_400),
        item("undated", "Undated", "no timestamp at all"),
    ]);
    let source = h.add_source_with("recent", |s| s.max_age_to_load = 3).await;

    let outcome = run_job(&h.ctx, source.id).await;
    assert!(matches!(outcome, JobOutcome::Completed { new_articles: 2, .. }));
    assert!(h.store.find_article(source.id, "old").await.unwrap().is_none());
    assert!(h.store.find_article(source.id, "fresh").await.unwrap().is_some());
    assert!(h.store.find_article(source.id, "undated").await.unwrap().is_some());
}

#[tokio::test]
async fn test_unknown_filter_is_recorded_on_source() {
    let h = Harness::new().await;
    h.mock.set_items(vec![item("a", "Alpha", "body")]);
    let source = h.add_source("filtered").await;
    h.store
        .insert_filter(&FilterConfig {
            id: 0,
            name: "bayes".to_string(),
            source_id: None,
            enabled: true,
            params: BTreeMap::new(),
        })
        .await
        .unwrap();

    match run_job(&h.ctx, source.id).await {
        JobOutcome::Failed { error } => assert_eq!(error, "unknown filter 'bayes'"),
        other => panic!("expected failure, got {:?}", other),
    }
    let stored = h.source(source.id).await;
    assert_eq!(stored.last_error.as_deref(), Some("unknown filter 'bayes'"));
    assert!(stored.last_error_date.is_some());
    assert!(!stored.processing);
    assert_eq!(h.store.count_articles(source.id).await.unwrap(), 0);
}

fn candidate(id: &str) -> Candidate {
    Candidate {
        internal_id: id.to_string(),
        title: id.to_string(),
        link: None,
        author: None,
        summary: String::new(),
        content: format!("body of {}", id),
        published: None,
        updated: now(),
        score: 0,
        metadata: MetadataMap::new(),
        existing_id: None,
    }
}

#[tokio::test]
async fn test_finalize_after_lost_claim_writes_nothing() {
    let h = Harness::new().await;
    let source = h.add_source("lost").await;
    let finish = SuccessFinish {
        now: now(),
        next_refresh: now() + 3600,
        metadata: MetadataMap::new(),
        icon: None,
    };

    assert!(h.store.claim_source(source.id, now()).await.unwrap());
    h.store.reset_stale_claims().await.unwrap();
    let written = h
        .store
        .finish_success(source.id, &[candidate("a")], &finish)
        .await
        .unwrap();
    assert!(written.is_none());
    assert_eq!(h.store.count_articles(source.id).await.unwrap(), 0);
    assert!(h.source(source.id).await.last_refreshed.is_none());

    assert!(h.store.claim_source(source.id, now()).await.unwrap());
    let written = h
        .store
        .finish_success(source.id, &[candidate("a")], &finish)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(written.as_slice(), [MergeOutcome::Inserted(_)]));
    let stored = h.source(source.id).await;
    assert!(!stored.processing);
    assert_eq!(stored.next_refresh, finish.next_refresh);
    assert_eq!(h.store.count_articles(source.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_refresh_times_use_cycle_start() {
    let h = Harness::new().await;
    h.mock.set_items(vec![item("a", "Alpha", "body")]);
    h.mock.set_delay(Duration::from_millis(1500));
    let source = h.add_source("slow").await;

    let before = now();
    run_job(&h.ctx, source.id).await;

    let stored = h.source(source.id).await;
    let refreshed = stored.last_refreshed.unwrap();
    assert!(refreshed >= before && refreshed <= before + 1, "{} vs {}", refreshed, before);
    assert_eq!(stored.next_refresh, refreshed + stored.interval_secs);
}

#[tokio::test]
async fn test_corrupt_metadata_fails_without_dropping_it() {
    let h = Harness::new().await;
    let source = h.add_source("corrupt").await;
    sqlx::query("UPDATE sources SET metadata_json = '{not json' WHERE id = ?")
        .bind(source.id)
        .execute(h.store.pool())
        .await
        .unwrap();

    match run_job(&h.ctx, source.id).await {
        JobOutcome::Failed { error } => {
            assert!(error.contains("corrupt metadata_json"), "{}", error)
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(h.mock.calls(), 0);
    assert_eq!(h.store.is_claimed(source.id).await.unwrap(), Some(false));
    assert!(h.store.get_source(source.id).await.is_err());

    let (raw, last_error): (String, Option<String>) =
        sqlx::query_as("SELECT metadata_json, last_error FROM sources WHERE id = ?")
            .bind(source.id)
            .fetch_one(h.store.pool())
            .await
            .unwrap();
    assert_eq!(raw, "{not json");
    assert!(last_error.unwrap().contains("corrupt metadata_json"));
}
