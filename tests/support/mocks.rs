#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex};
use syntised::domain::Row;
use syntised::replay::source::{MemoryRowSource, SourceItem};
use syntised::replay::{ReplayClock, RowSource};
use syntised::transport::{Publisher, TransportError, TELEMETRY_TOPIC};
use tokio::sync::watch;
use tokio::time::Instant;

/// Recording publisher used by scheduler tests to assert publish order and timing.
#[derive(Clone)]
pub struct MockPublisher {
    inner: Arc<Mutex<PublisherState>>,
    failure: Arc<watch::Sender<Option<TransportError>>>,
}

#[derive(Default, Debug)]
struct PublisherState {
    messages: Vec<PublishedMessage>,
    ready_error: Option<TransportError>,
    fail_publish_after: Option<usize>,
    closed: bool,
}

#[derive(Clone, Debug)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: JsonValue,
    pub at: Instant,
}

impl Default for MockPublisher {
    fn default() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Mutex::new(PublisherState::default())),
            failure: Arc::new(tx),
        }
    }
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing(err: TransportError) -> Self {
        let publisher = Self::default();
        publisher.state().ready_error = Some(err);
        publisher
    }

    /// Accepts `count` publishes, then fails every later one.
    pub fn failing_after(count: usize) -> Self {
        let publisher = Self::default();
        publisher.state().fail_publish_after = Some(count);
        publisher
    }

    /// Simulates the connection dropping while idle.
    pub fn drop_connection(&self, err: TransportError) {
        self.failure.send_replace(Some(err));
    }

    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.state().messages.clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.state()
            .messages
            .iter()
            .map(|message| message.topic.clone())
            .collect()
    }

    pub fn on_topic(&self, topic: &str) -> Vec<PublishedMessage> {
        self.state()
            .messages
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    pub fn telemetry(&self) -> Vec<JsonValue> {
        self.on_topic(TELEMETRY_TOPIC)
            .into_iter()
            .map(|message| message.payload)
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PublisherState> {
        self.inner.lock().expect("mock publisher state")
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn ready(&self) -> Result<(), TransportError> {
        match self.state().ready_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn publish(&self, topic: &str, payload: &JsonValue) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if let Some(limit) = state.fail_publish_after {
            if state.messages.len() >= limit {
                return Err(TransportError::Publish {
                    topic: topic.to_string(),
                    reason: "broker rejected publish".to_string(),
                });
            }
        }
        state.messages.push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.clone(),
            at: Instant::now(),
        });
        Ok(())
    }

    async fn failed(&self) -> TransportError {
        let mut rx = self.failure.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(err) = current {
                return err;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state().closed = true;
        Ok(())
    }
}

/// Wall clock that starts at `base` and advances with tokio's (pausable) clock.
#[derive(Clone, Debug)]
pub struct TestClock {
    base: NaiveDateTime,
    started: Instant,
}

impl TestClock {
    pub fn at(base: NaiveDateTime) -> Self {
        Self {
            base,
            started: Instant::now(),
        }
    }

    pub fn at_time(hms_milli: (u32, u32, u32, u32)) -> Self {
        let (hour, minute, second, milli) = hms_milli;
        let base = NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|date| date.and_hms_milli_opt(hour, minute, second, milli))
            .expect("valid test time");
        Self::at(base)
    }

    pub fn started(&self) -> Instant {
        self.started
    }
}

impl ReplayClock for TestClock {
    fn now(&self) -> NaiveDateTime {
        let elapsed = chrono::Duration::from_std(self.started.elapsed()).expect("elapsed fits");
        self.base + elapsed
    }
}

/// Row source that records when each row was pulled.
pub struct TrackingSource {
    inner: MemoryRowSource,
    pulls: Arc<Mutex<Vec<Instant>>>,
}

impl TrackingSource {
    pub fn new(items: impl IntoIterator<Item = SourceItem>) -> (Self, Arc<Mutex<Vec<Instant>>>) {
        let pulls = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                inner: MemoryRowSource::from_items(items),
                pulls: Arc::clone(&pulls),
            },
            pulls,
        )
    }
}

#[async_trait]
impl RowSource for TrackingSource {
    async fn next_row(&mut self) -> Option<SourceItem> {
        self.pulls.lock().expect("pull log").push(Instant::now());
        self.inner.next_row().await
    }
}

pub fn row(line: u64, pairs: &[(&str, &str)]) -> Row {
    Row::from_pairs(line, pairs.iter().copied())
}
