//! Notification events emitted by workers, the pool, and the scheduler.
//!
//! Events are fire-and-forget: a sink must never block or fail the
//! caller. The CLI picks a sink with `--events`:
//!
//! | Mode | Sink | Output |
//! |------|------|--------|
//! | `log` (default) | [`LogSink`] | `tracing` info lines |
//! | `json` | [`JsonSink`] | one JSON object per line on **stderr** |
//! | `off` | [`NoSink`] | nothing |
//!
//! Library users and tests can subscribe with [`ChannelSink`].

use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Pool activity reported through [`Event::UpdateStatus`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum UpdateStatus {
    /// The pool went from idle to busy.
    Started,
    /// A job finished; `done` of `total` jobs since `Started`.
    Progress { done: usize, total: usize },
    /// The pool returned to idle.
    Finished,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    SourceUpdated {
        source_id: i64,
        group_id: Option<i64>,
        new_articles: usize,
        updated_articles: usize,
    },
    GroupUpdated {
        group_id: i64,
    },
    UpdateStatus {
        status: UpdateStatus,
    },
    Announce {
        message: String,
    },
}

impl Event {
    pub fn announce(message: impl Into<String>) -> Self {
        Event::Announce {
            message: message.into(),
        }
    }
}

/// Receives notification events.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: Event);
}

/// Events as `tracing` info lines.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, event: Event) {
        match event {
            Event::SourceUpdated {
                source_id,
                group_id,
                new_articles,
                updated_articles,
            } => tracing::info!(
                source_id,
                group_id,
                new = %format_number(new_articles as u64),
                updated = %format_number(updated_articles as u64),
                "source updated"
            ),
            Event::GroupUpdated { group_id } => tracing::info!(group_id, "group updated"),
            Event::UpdateStatus { status } => match status {
                UpdateStatus::Started => tracing::info!("update started"),
                UpdateStatus::Progress { done, total } => {
                    tracing::info!(
                        "update  {} / {} sources",
                        format_number(done as u64),
                        format_number(total as u64)
                    )
                }
                UpdateStatus::Finished => tracing::info!("update finished"),
            },
            Event::Announce { message } => tracing::info!("{}", message),
        }
    }
}

/// Machine-readable events: one JSON object per line on stderr.
pub struct JsonSink;

impl NotificationSink for JsonSink {
    fn notify(&self, event: Event) {
        if let Ok(line) = serde_json::to_string(&event) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op sink when notifications are disabled.
pub struct NoSink;

impl NotificationSink for NoSink {
    fn notify(&self, _event: Event) {}
}

/// Forwards events into an unbounded channel. Events sent after the
/// receiver is dropped are discarded.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Event mode for the CLI: tracing lines, JSON on stderr, or off.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum EventMode {
    Log,
    Json,
    Off,
}

impl EventMode {
    pub fn sink(&self) -> Arc<dyn NotificationSink> {
        match self {
            EventMode::Log => Arc::new(LogSink),
            EventMode::Json => Arc::new(JsonSink),
            EventMode::Off => Arc::new(NoSink),
        }
    }
}
