//! Shared fixtures: a temporary SQLite store and a scriptable in-process
//! adapter registered under the `mock` tag.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::TimeZone;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

use feedloom::adapters::{Adapter, AdapterRegistry, FetchSession};
use feedloom::config::{Defaults, SchedulerConfig};
use feedloom::error::{FetchError, ValidationError};
use feedloom::filters::FilterRegistry;
use feedloom::models::{ConfigMap, RawItem, Source};
use feedloom::notify::{ChannelSink, Event};
use feedloom::store::{SqliteStore, Store};
use feedloom::worker::WorkerContext;

/// What the mock adapter returns, and how it behaved.
#[derive(Default)]
pub struct MockState {
    pub items: Mutex<Vec<RawItem>>,
    pub fail_with: Mutex<Option<String>>,
    pub panic_with: Mutex<Option<String>>,
    pub delay: Mutex<Duration>,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MockState {
    pub fn set_items(&self, items: Vec<RawItem>) {
        *self.items.lock().unwrap() = items;
    }

    pub fn fail(&self, message: &str) {
        *self.fail_with.lock().unwrap() = Some(message.to_string());
    }

    pub fn panic(&self, message: &str) {
        *self.panic_with.lock().unwrap() = Some(message.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub struct MockAdapter {
    pub state: Arc<MockState>,
}

#[async_trait]
impl Adapter for MockAdapter {
    fn type_tag(&self) -> &str {
        "mock"
    }

    fn description(&self) -> &str {
        "Scripted test adapter"
    }

    fn update_configuration(&self, config: ConfigMap) -> Result<ConfigMap, ValidationError> {
        Ok(config)
    }

    fn info(&self, _config: &ConfigMap) -> Vec<(String, String)> {
        Vec::new()
    }

    async fn extract(&self, _session: &mut FetchSession<'_>) -> Result<Vec<RawItem>, FetchError> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = *self.state.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);

        let panic_with = self.state.panic_with.lock().unwrap().clone();
        if let Some(message) = panic_with {
            panic!("{}", message);
        }
        if let Some(message) = self.state.fail_with.lock().unwrap().clone() {
            return Err(FetchError::Parse(message));
        }
        Ok(self.state.items.lock().unwrap().clone())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<SqliteStore>,
    pub mock: Arc<MockState>,
    pub events: UnboundedReceiver<Event>,
    pub ctx: WorkerContext,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            SqliteStore::open(&dir.path().join("loom.sqlite"))
                .await
                .unwrap(),
        );
        let mock = Arc::new(MockState::default());

        let mut adapters = AdapterRegistry::with_builtins();
        adapters.register(Arc::new(MockAdapter {
            state: Arc::clone(&mock),
        }));

        let (sink, events) = ChannelSink::new();
        let ctx = WorkerContext {
            store: store.clone(),
            adapters: Arc::new(adapters),
            filters: Arc::new(FilterRegistry::with_builtins()),
            http: reqwest::Client::new(),
            defaults: Defaults::default(),
            sink: Arc::new(sink),
        };

        Self {
            dir,
            store,
            mock,
            events,
            ctx,
        }
    }

    /// Insert an enabled mock source that is due immediately.
    pub async fn add_source(&self, name: &str) -> Source {
        self.add_source_with(name, |_| {}).await
    }

    pub async fn add_source_with(&self, name: &str, edit: impl FnOnce(&mut Source)) -> Source {
        let mut source = Source::new(name, "mock");
        edit(&mut source);
        source.id = self.store.insert_source(&source).await.unwrap();
        source
    }

    pub async fn source(&self, id: i64) -> Source {
        self.store.get_source(id).await.unwrap().unwrap()
    }

    /// Every event received so far.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub fn scheduler_config(workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        workers,
        short_sleep_secs: 1,
        long_sleep_secs: 30,
        cleanup_interval_secs: 0,
        cleanup_on_shutdown: false,
    }
}

/// An undated item with a natural id.
pub fn item(id: &str, title: &str, content: &str) -> RawItem {
    RawItem {
        natural_id: Some(id.to_string()),
        title: title.to_string(),
        content: content.to_string(),
        ..Default::default()
    }
}

/// An item published `secs_ago` seconds before now.
pub fn dated(id: &str, secs_ago: i64) -> RawItem {
    RawItem {
        published: chrono::Utc.timestamp_opt(now() - secs_ago, 0).single(),
        ..item(id, id, &format!("body of {}", id))
    }
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
