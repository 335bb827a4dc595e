//! Fixed-size worker pool.
//!
//! `size` long-lived tasks pull source ids from a shared FIFO
//! ([`async_channel`]), so one slow fetch only ever occupies one slot. The
//! pool tracks which ids are queued and which are running to refuse
//! duplicate submissions, and derives the `update-status` events from the
//! idle/busy transitions:
//!
//! | Transition | Event |
//! |------------|-------|
//! | idle → busy (first submit) | `started` |
//! | job finished | `progress {done, total}` |
//! | busy → idle | `finished` |

use async_channel as chan;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::notify::{Event, NotificationSink, UpdateStatus};
use crate::worker::{record_panic, run_job, JobOutcome, WorkerContext};

#[derive(Default)]
struct Inner {
    queued: HashSet<i64>,
    running: HashSet<i64>,
    done: usize,
    total: usize,
    closed: bool,
}

impl Inner {
    fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.running.is_empty()
    }
}

struct Shared {
    inner: Mutex<Inner>,
    idle: Notify,
    sink: Arc<dyn NotificationSink>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves only counters behind.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take `id` off the queue for execution. `false` if it was drained.
    fn start(&self, id: i64) -> bool {
        let mut inner = self.lock();
        if !inner.queued.remove(&id) {
            return false;
        }
        inner.running.insert(id);
        true
    }

    fn finish(&self, id: i64) {
        let (progress, became_idle) = {
            let mut inner = self.lock();
            inner.running.remove(&id);
            inner.done += 1;
            let progress = UpdateStatus::Progress {
                done: inner.done,
                total: inner.total,
            };
            let idle = inner.is_idle();
            if idle {
                inner.done = 0;
                inner.total = 0;
            }
            (progress, idle)
        };

        self.sink.notify(Event::UpdateStatus { status: progress });
        if became_idle {
            self.sink.notify(Event::UpdateStatus {
                status: UpdateStatus::Finished,
            });
            self.idle.notify_waiters();
        }
    }
}

pub struct WorkerPool {
    size: usize,
    tx: chan::Sender<i64>,
    rx: chan::Receiver<i64>,
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `size` workers on the current tokio runtime.
    pub fn new(size: usize, ctx: WorkerContext) -> Self {
        let size = size.max(1);
        let (tx, rx) = chan::unbounded::<i64>();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::default()),
            idle: Notify::new(),
            sink: Arc::clone(&ctx.sink),
        });

        let handles = (0..size)
            .map(|worker_id| {
                let rx = rx.clone();
                let shared = Arc::clone(&shared);
                let ctx = ctx.clone();
                tokio::spawn(
                    worker_loop(rx, shared, ctx)
                        .instrument(tracing::debug_span!("worker", worker_id)),
                )
            })
            .collect();

        Self {
            size,
            tx,
            rx,
            shared,
            handles: Mutex::new(handles),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a source. Returns `false` if it is already queued or running,
    /// or if the pool is shut down.
    pub fn submit(&self, source_id: i64) -> bool {
        // The queued set and the channel change together under the lock,
        // so a concurrent drain sees both or neither.
        let started = {
            let mut inner = self.shared.lock();
            if inner.closed
                || inner.queued.contains(&source_id)
                || inner.running.contains(&source_id)
            {
                return false;
            }
            if self.tx.try_send(source_id).is_err() {
                return false;
            }
            let started = inner.is_idle();
            inner.queued.insert(source_id);
            inner.total += 1;
            started
        };

        if started {
            self.shared.sink.notify(Event::UpdateStatus {
                status: UpdateStatus::Started,
            });
        }
        true
    }

    /// Free slots: workers not running and not already promised a queued job.
    pub fn available_slots(&self) -> usize {
        let inner = self.shared.lock();
        self.size
            .saturating_sub(inner.running.len() + inner.queued.len())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn is_busy(&self) -> bool {
        !self.shared.lock().is_idle()
    }

    pub fn running(&self) -> usize {
        self.shared.lock().running.len()
    }

    /// Cancel queued jobs that have not started. Running jobs are untouched.
    /// Returns how many were cancelled.
    pub fn drain_pending(&self) -> usize {
        let (drained, became_idle) = {
            let mut inner = self.shared.lock();
            while self.rx.try_recv().is_ok() {}
            let drained = inner.queued.len();
            inner.queued.clear();
            inner.total = inner.total.saturating_sub(drained);
            let idle = drained > 0 && inner.is_idle();
            if idle {
                inner.done = 0;
                inner.total = 0;
            }
            (drained, idle)
        };

        if became_idle {
            self.shared.sink.notify(Event::UpdateStatus {
                status: UpdateStatus::Finished,
            });
            self.shared.idle.notify_waiters();
        }
        if drained > 0 {
            tracing::info!(drained, "cancelled pending jobs");
        }
        drained
    }

    /// Resolve once no job is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if !self.is_busy() {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work, cancel queued jobs, and join every worker after
    /// its in-flight job completes.
    pub async fn shutdown(&self) {
        self.shared.lock().closed = true;
        self.drain_pending();
        self.tx.close();

        let handles = std::mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "worker task ended abnormally");
            }
        }
    }
}

async fn worker_loop(rx: chan::Receiver<i64>, shared: Arc<Shared>, ctx: WorkerContext) {
    tracing::trace!("worker started");
    while let Ok(source_id) = rx.recv().await {
        if !shared.start(source_id) {
            continue;
        }

        let job_ctx = ctx.clone();
        let job = tokio::spawn(
            async move { run_job(&job_ctx, source_id).await }
                .instrument(tracing::info_span!("job", source_id)),
        );
        match job.await {
            Ok(JobOutcome::Failed { error }) => {
                tracing::debug!(source_id, %error, "job failed");
            }
            Ok(outcome) => tracing::trace!(source_id, ?outcome, "job done"),
            Err(e) => {
                let message = panic_message(e);
                tracing::error!(source_id, error = %message, "job panicked");
                record_panic(&ctx, source_id, &message).await;
            }
        }

        shared.finish(source_id);
    }
    tracing::trace!("worker stopped");
}

fn panic_message(e: tokio::task::JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }
    let payload = e.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
