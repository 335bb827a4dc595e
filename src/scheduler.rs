//! Dispatcher loop.
//!
//! Each tick asks the store for due sources (enabled, unclaimed,
//! `next_refresh <= now`, oldest first) and submits as many as the pool has
//! free slots. The loop then sleeps `short_sleep` if anything is running or
//! was dispatched, `long_sleep` otherwise; [`Scheduler::force_refresh`] and
//! [`Scheduler::pause`] wake it early.
//!
//! The scheduler never touches a source row itself apart from
//! `force_refresh` and the crash-recovery reset in [`Scheduler::start`].
//!
//! A scheduler runs once: `start` on a running scheduler is a no-op, and
//! after [`Scheduler::stop`] its pool is closed, so build a new one.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;
use crate::models::RefreshTarget;
use crate::notify::{Event, NotificationSink};
use crate::pool::WorkerPool;
use crate::retention;
use crate::store::Store;
use crate::worker::WorkerContext;

/// Upper bound on sources submitted per pass of [`Scheduler::run_until_idle`].
const ONE_SHOT_BATCH: usize = 10_000;

pub struct Scheduler {
    store: Arc<dyn Store>,
    pool: WorkerPool,
    config: SchedulerConfig,
    sink: Arc<dyn NotificationSink>,
    paused: AtomicBool,
    stopping: AtomicBool,
    wake: Notify,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Build the scheduler and its worker pool. Must be called inside a
    /// tokio runtime.
    pub fn new(ctx: WorkerContext, config: SchedulerConfig) -> Arc<Self> {
        let store = Arc::clone(&ctx.store);
        let sink = Arc::clone(&ctx.sink);
        let pool = WorkerPool::new(config.workers, ctx);
        Arc::new(Self {
            store,
            pool,
            config,
            sink,
            paused: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            wake: Notify::new(),
            handle: Mutex::new(None),
        })
    }

    /// Release stale claims left by a crashed process, then start the loop.
    ///
    /// The handle lock is held across the reset, and a running scheduler
    /// returns before it, so the reset can never release a claim held by
    /// one of this scheduler's own jobs.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut handle = self.lock_handle().await;
        if handle.is_some() {
            return Ok(());
        }
        if self.pool.is_closed() {
            bail!("scheduler was stopped; create a new one to run again");
        }

        // One-shot jobs already dispatched through `tick` hold live claims.
        if !self.pool.is_busy() {
            let reset = self
                .store
                .reset_stale_claims()
                .await
                .context("Failed to reset stale claims")?;
            if reset > 0 {
                tracing::warn!(reset, "released claims left by a previous run");
            }
        }

        self.stopping.store(false, Ordering::SeqCst);
        let this = Arc::clone(self);
        *handle = Some(tokio::spawn(async move { this.run_loop().await }));
        drop(handle);

        self.sink.notify(Event::announce(format!(
            "scheduler started with {} workers",
            self.pool.size()
        )));
        Ok(())
    }

    /// Stop dispatching, cancel queued jobs, wait for running jobs, and run
    /// the shutdown cleanup when configured.
    pub async fn stop(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        self.wake.notify_one();

        let handle = self.lock_handle().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "scheduler loop ended abnormally");
            }
        }
        self.pool.shutdown().await;

        if self.config.cleanup_on_shutdown {
            self.cleanup().await?;
        }
        self.sink.notify(Event::announce("scheduler stopped"));
        Ok(())
    }

    /// One dispatch pass. Returns how many sources were submitted.
    pub async fn tick(&self) -> Result<usize> {
        if self.is_paused() || self.stopping.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let slots = self.pool.available_slots();
        if slots == 0 {
            return Ok(0);
        }
        self.dispatch(slots, &HashSet::new()).await.map(|ids| ids.len())
    }

    async fn dispatch(&self, limit: usize, skip: &HashSet<i64>) -> Result<Vec<i64>> {
        let now = Utc::now().timestamp();
        let due = self
            .store
            .due_sources(now, limit + skip.len())
            .await
            .context("Failed to query due sources")?;

        let mut submitted = Vec::new();
        for source in due {
            if submitted.len() >= limit {
                break;
            }
            if skip.contains(&source.id) {
                continue;
            }
            if self.pool.submit(source.id) {
                tracing::debug!(source_id = source.id, name = %source.name, "dispatched");
                submitted.push(source.id);
            }
        }
        Ok(submitted)
    }

    /// Dispatch everything currently due and wait until the pool is idle.
    /// Each source runs at most once per call. Used by one-shot refreshes.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut seen = HashSet::new();
        loop {
            if self.is_paused() {
                break;
            }
            let submitted = self.dispatch(ONE_SHOT_BATCH, &seen).await?;
            if submitted.is_empty() && !self.pool.is_busy() {
                break;
            }
            seen.extend(submitted);
            self.pool.wait_idle().await;
        }
        Ok(seen.len())
    }

    /// Make the targeted sources due now and wake the loop.
    pub async fn force_refresh(&self, target: RefreshTarget) -> Result<u64> {
        let touched = self
            .store
            .force_refresh(target, Utc::now().timestamp())
            .await
            .context("Failed to force refresh")?;
        tracing::info!(?target, touched, "forced refresh");
        self.wake.notify_one();
        Ok(touched)
    }

    /// Stop or resume dispatching. Running jobs are not affected.
    pub fn pause(&self, paused: bool) {
        let was = self.paused.swap(paused, Ordering::SeqCst);
        if was == paused {
            return;
        }
        self.sink.notify(Event::announce(if paused {
            "scheduler paused"
        } else {
            "scheduler resumed"
        }));
        if !paused {
            self.wake.notify_one();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Cancel queued jobs that have not started yet.
    pub fn drain_pending(&self) -> usize {
        self.pool.drain_pending()
    }

    pub fn is_updating(&self) -> bool {
        self.pool.is_busy()
    }

    pub async fn cleanup(&self) -> Result<retention::CleanupReport> {
        let report = retention::run_cleanup(self.store.as_ref(), Utc::now().timestamp()).await?;
        if report.deleted > 0 {
            self.sink.notify(Event::announce(format!(
                "cleanup removed {} articles from {} sources",
                report.deleted, report.sources
            )));
        }
        Ok(report)
    }

    async fn lock_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().await
    }

    async fn run_loop(self: Arc<Self>) {
        let cleanup_every = (self.config.cleanup_interval_secs > 0)
            .then(|| std::time::Duration::from_secs(self.config.cleanup_interval_secs));
        let mut last_cleanup = Instant::now();

        while !self.stopping.load(Ordering::SeqCst) {
            let worked = match self.tick().await {
                Ok(dispatched) => dispatched > 0 || self.pool.is_busy(),
                Err(e) => {
                    tracing::warn!(error = %format!("{e:#}"), "dispatch tick failed");
                    false
                }
            };

            if let Some(every) = cleanup_every {
                if last_cleanup.elapsed() >= every {
                    if let Err(e) = self.cleanup().await {
                        tracing::warn!(error = %format!("{e:#}"), "periodic cleanup failed");
                    }
                    last_cleanup = Instant::now();
                }
            }

            let sleep = if worked {
                self.config.short_sleep()
            } else {
                self.config.long_sleep()
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = self.wake.notified() => {}
            }
        }
        tracing::debug!("scheduler loop exited");
    }
}
