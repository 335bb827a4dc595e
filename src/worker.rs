//! One source's refresh cycle.
//!
//! ```text
//! Idle → Due → Claimed → Processing → Completed ─┐
//!                                   └→ Failed ────┴→ Idle
//! ```
//!
//! 1. **Claim**: [`Store::claim_source`] commits `processing = true` before
//!    any network or file I/O, so a double dispatch loses the race.
//! 2. **Fetch**: resolve the adapter by tag and run the shared fetch contract.
//! 3. **Filter**: score and gate candidates when the source uses filters.
//! 4. **Re-check**: if the row vanished or the claim was released
//!    externally, abort without applying anything.
//! 5. **Persist + finalize**: in one transaction, verify the claim is
//!    still held, merge-or-insert keyed by `(source_id, internal_id)`, set
//!    `next_refresh = t + interval` and release the claim. Failures get the
//!    same `next_refresh` (no backoff). Then notify.
//!
//! `t` is the cycle start, taken just before the claim. It is stored as
//! `last_refreshed` (or `last_error_date`) and is the lower bound of the
//! next cycle's age window, so items published while this fetch ran are
//! still accepted next time.
//!
//! Every error stops at this boundary and is recorded on the source. A
//! panicking job is recorded by the pool through [`record_panic`].

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

use crate::adapters::{self, AdapterRegistry, FetchLimits, FetchSession};
use crate::config::Defaults;
use crate::error::{SyncError, SyncResult};
use crate::filters::{effective_min_score, FilterRegistry};
use crate::models::{Candidate, Icon, MetadataMap, Source};
use crate::notify::{Event, NotificationSink};
use crate::store::{Store, SuccessFinish};

/// Retry delay used when the source row itself could not be read.
const FALLBACK_INTERVAL_SECS: i64 = 3600;

/// Shared, read-only state every worker task needs.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn Store>,
    pub adapters: Arc<AdapterRegistry>,
    pub filters: Arc<FilterRegistry>,
    pub http: reqwest::Client,
    pub defaults: Defaults,
    pub sink: Arc<dyn NotificationSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Due,
    Claimed,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Idle => "idle",
            JobState::Due => "due",
            JobState::Claimed => "claimed",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Another worker holds the source, it is not due, or it is disabled.
    NotClaimed,
    Completed {
        new_articles: usize,
        updated_articles: usize,
        rejected: usize,
    },
    Failed {
        error: String,
    },
    /// The row vanished or the claim was released while fetching.
    Aborted,
}

fn transition(source_id: i64, state: JobState) {
    tracing::debug!(source_id, %state, "job state");
}

/// Output of the fetch and filter steps, not yet persisted.
struct Processed {
    accepted: Vec<Candidate>,
    rejected: usize,
    metadata: MetadataMap,
    icon: Option<Icon>,
}

/// Run one full refresh cycle for `source_id`. See the module docs for
/// the meaning of the cycle timestamp.
pub async fn run_job(ctx: &WorkerContext, source_id: i64) -> JobOutcome {
    let now = Utc::now();
    transition(source_id, JobState::Due);

    match ctx.store.claim_source(source_id, now.timestamp()).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(source_id, "claim not won");
            transition(source_id, JobState::Idle);
            return JobOutcome::NotClaimed;
        }
        Err(e) => {
            tracing::warn!(source_id, error = %format!("{e:#}"), "claim failed");
            return JobOutcome::NotClaimed;
        }
    }
    transition(source_id, JobState::Claimed);

    let source = match ctx.store.get_source(source_id).await {
        Ok(Some(source)) => source,
        Ok(None) => {
            tracing::info!(source_id, "source vanished after claim");
            return JobOutcome::Aborted;
        }
        Err(e) => {
            return fail(ctx, source_id, now, FALLBACK_INTERVAL_SECS, &SyncError::Store(e)).await;
        }
    };
    transition(source_id, JobState::Processing);

    let processed = match process(ctx, &source, now).await {
        Ok(processed) => processed,
        Err(e) => return fail(ctx, source_id, now, source.interval_secs, &e).await,
    };

    match ctx.store.is_claimed(source_id).await {
        Ok(Some(true)) => {}
        Ok(_) => {
            tracing::info!(source_id, "claim released during fetch, discarding results");
            transition(source_id, JobState::Idle);
            return JobOutcome::Aborted;
        }
        Err(e) => {
            return fail(ctx, source_id, now, source.interval_secs, &SyncError::Store(e)).await;
        }
    }

    complete(ctx, &source, now, processed).await
}

/// Steps 2–3: adapter fetch, filtering, opportunistic icon.
async fn process(
    ctx: &WorkerContext,
    source: &Source,
    now: DateTime<Utc>,
) -> SyncResult<Processed> {
    let adapter = ctx.adapters.resolve(&source.adapter)?;
    let limits = FetchLimits::resolve(source, &ctx.defaults);
    let mut session = FetchSession::new(&ctx.http, ctx.store.as_ref(), source, now);

    let candidates = adapters::fetch(adapter.as_ref(), &mut session, &limits).await?;
    let fetched = candidates.len();

    let (accepted, rejected) = if source.use_filters && !candidates.is_empty() {
        let configs = ctx.store.filters_for_source(source).await?;
        let pipeline = ctx.filters.pipeline(&configs)?;
        pipeline.run(candidates, effective_min_score(source, &ctx.defaults))
    } else {
        (candidates, 0)
    };

    let icon = if source.has_icon {
        None
    } else {
        adapter.icon(&session).await
    };

    tracing::debug!(
        source_id = source.id,
        adapter = %source.adapter,
        fetched,
        accepted = accepted.len(),
        rejected,
        "fetched"
    );

    Ok(Processed {
        accepted,
        rejected,
        metadata: session.metadata,
        icon,
    })
}

/// Step 5 on the success path.
async fn complete(
    ctx: &WorkerContext,
    source: &Source,
    now: DateTime<Utc>,
    processed: Processed,
) -> JobOutcome {
    let source_id = source.id;
    let finish = SuccessFinish {
        now: now.timestamp(),
        next_refresh: now.timestamp() + source.interval_secs,
        metadata: processed.metadata,
        icon: processed.icon,
    };
    let outcomes = match ctx
        .store
        .finish_success(source_id, &processed.accepted, &finish)
        .await
    {
        Ok(Some(outcomes)) => outcomes,
        Ok(None) => {
            tracing::info!(source_id, "claim lost before finalize, nothing written");
            transition(source_id, JobState::Idle);
            return JobOutcome::Aborted;
        }
        Err(e) => return fail(ctx, source_id, now, source.interval_secs, &SyncError::Store(e)).await,
    };
    let new_articles = outcomes.iter().filter(|o| o.is_insert()).count();
    let updated_articles = outcomes.len() - new_articles;
    transition(source_id, JobState::Completed);

    tracing::info!(
        source_id,
        name = %source.name,
        new = new_articles,
        updated = updated_articles,
        rejected = processed.rejected,
        "refreshed"
    );
    ctx.sink.notify(Event::SourceUpdated {
        source_id,
        group_id: source.group_id,
        new_articles,
        updated_articles,
    });
    if let Some(group_id) = source.group_id {
        ctx.sink.notify(Event::GroupUpdated { group_id });
    }

    transition(source_id, JobState::Idle);
    JobOutcome::Completed {
        new_articles,
        updated_articles,
        rejected: processed.rejected,
    }
}

/// Failure finalize: record the error, advance by the usual interval.
async fn fail(
    ctx: &WorkerContext,
    source_id: i64,
    now: DateTime<Utc>,
    interval_secs: i64,
    error: &SyncError,
) -> JobOutcome {
    let message = error.to_string();
    tracing::warn!(source_id, error = %message, "refresh failed");

    let now_ts = now.timestamp();
    match ctx
        .store
        .finish_failure(source_id, now_ts, now_ts + interval_secs, &message)
        .await
    {
        Ok(true) => {}
        Ok(false) => tracing::info!(source_id, "claim lost before failure finalize"),
        Err(e) => tracing::error!(source_id, error = %format!("{e:#}"), "failed to record error"),
    }
    transition(source_id, JobState::Failed);
    transition(source_id, JobState::Idle);

    JobOutcome::Failed { error: message }
}

/// Failure finalize for a job whose task panicked. The claim is still
/// held, so without this the source would never be due again.
pub async fn record_panic(ctx: &WorkerContext, source_id: i64, message: &str) -> JobOutcome {
    let interval = match ctx.store.get_source(source_id).await {
        Ok(Some(source)) => source.interval_secs,
        Ok(None) => return JobOutcome::Aborted,
        Err(_) => FALLBACK_INTERVAL_SECS,
    };
    let error = SyncError::Panicked(message.to_string());
    fail(ctx, source_id, Utc::now(), interval, &error).await
}
