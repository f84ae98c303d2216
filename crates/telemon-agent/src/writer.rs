//! Ships everything monitors emit to the ingest backend.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use telemon_common::types::{format_dimensions, Datapoint, DimensionUpdate, Event};
use telemon_monitor::output::OutputMessage;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Dimension carrying the reporting agent's hostname.
pub const AGENT_DIMENSION: &str = "agent";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WriterConfig {
    /// Batches are POSTed here as JSON. Without it they are only logged.
    #[serde(default)]
    pub ingest_url: Option<String>,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_buffer_max_size")]
    pub buffer_max_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

fn default_flush_interval_secs() -> u64 {
    5
}

fn default_buffer_max_size() -> usize {
    10_000
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_max_backoff_secs() -> u64 {
    300
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            ingest_url: None,
            flush_interval_secs: default_flush_interval_secs(),
            buffer_max_size: default_buffer_max_size(),
            timeout_secs: default_timeout_secs(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

struct MetricBuffer {
    buffer: VecDeque<OutputMessage>,
    max_size: usize,
    dropped: u64,
}

impl MetricBuffer {
    fn new(max_size: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(max_size.min(1024)),
            max_size: max_size.max(1),
            dropped: 0,
        }
    }

    fn push(&mut self, message: OutputMessage) {
        if self.buffer.len() >= self.max_size {
            self.buffer.pop_front();
            self.dropped += 1;
        }
        self.buffer.push_back(message);
    }

    fn push_batch(&mut self, messages: Vec<OutputMessage>) {
        for message in messages {
            self.push(message);
        }
    }

    fn drain_all(&mut self) -> Vec<OutputMessage> {
        self.buffer.drain(..).collect()
    }

    fn len(&self) -> usize {
        self.buffer.len()
    }

    fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Wire format of one flush.
#[derive(Debug, Serialize)]
struct Batch<'a> {
    agent: &'a str,
    timestamp: DateTime<Utc>,
    datapoints: Vec<&'a Datapoint>,
    events: Vec<&'a Event>,
    dimension_updates: Vec<&'a DimensionUpdate>,
}

impl<'a> Batch<'a> {
    fn new(agent: &'a str, messages: &'a [OutputMessage]) -> Self {
        let mut batch = Self {
            agent,
            timestamp: Utc::now(),
            datapoints: Vec::new(),
            events: Vec::new(),
            dimension_updates: Vec::new(),
        };
        for message in messages {
            match message {
                OutputMessage::Datapoint(dp) => batch.datapoints.push(dp),
                OutputMessage::Event(event) => batch.events.push(event),
                OutputMessage::DimensionUpdate(update) => batch.dimension_updates.push(update),
            }
        }
        batch
    }
}

pub struct BackendWriter {
    config: WriterConfig,
    agent: String,
    client: reqwest::Client,
    buffer: MetricBuffer,
    failures: u32,
    retry_at: Option<Instant>,
}

impl BackendWriter {
    pub fn new(config: WriterConfig, agent: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            buffer: MetricBuffer::new(config.buffer_max_size),
            config,
            agent: agent.into(),
            client,
            failures: 0,
            retry_at: None,
        })
    }

    /// Buffers a message, stamping datapoints and events with the agent
    /// dimension unless the monitor already set one.
    fn accept(&mut self, mut message: OutputMessage) {
        match &mut message {
            OutputMessage::Datapoint(dp) => {
                dp.dimensions
                    .entry(AGENT_DIMENSION.to_string())
                    .or_insert_with(|| self.agent.clone());
            }
            OutputMessage::Event(event) => {
                event
                    .dimensions
                    .entry(AGENT_DIMENSION.to_string())
                    .or_insert_with(|| self.agent.clone());
            }
            OutputMessage::DimensionUpdate(_) => {}
        }
        self.buffer.push(message);
    }

    /// Delay before the next attempt after `failures` consecutive failed
    /// flushes: the flush interval, doubled per failure, capped.
    fn backoff_delay(&self) -> Duration {
        let base = Duration::from_secs(self.config.flush_interval_secs.max(1));
        let exponent = self.failures.saturating_sub(1).min(16);
        base.saturating_mul(1u32 << exponent)
            .min(Duration::from_secs(self.config.max_backoff_secs.max(1)))
    }

    fn due(&self) -> bool {
        self.retry_at.map_or(true, |at| Instant::now() >= at)
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if self.buffer.dropped > 0 {
            tracing::warn!(dropped = self.buffer.dropped, "Buffer full, oldest messages dropped");
            self.buffer.dropped = 0;
        }
        let messages = self.buffer.drain_all();

        let Some(url) = self.config.ingest_url.clone() else {
            log_batch(&messages);
            return;
        };

        match self.send(&url, &messages).await {
            Ok(()) => {
                tracing::debug!(count = messages.len(), "Batch delivered");
                self.failures = 0;
                self.retry_at = None;
            }
            Err(e) => {
                self.failures = self.failures.saturating_add(1);
                let delay = self.backoff_delay();
                self.retry_at = Some(Instant::now() + delay);
                tracing::warn!(
                    error = %e,
                    count = messages.len(),
                    failures = self.failures,
                    retry_in_secs = delay.as_secs(),
                    "Failed to deliver batch, buffering"
                );
                self.buffer.push_batch(messages);
            }
        }
    }

    async fn send(&self, url: &str, messages: &[OutputMessage]) -> reqwest::Result<()> {
        self.client
            .post(url)
            .json(&Batch::new(&self.agent, messages))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Drains `messages` until it closes or `cancel` fires, then makes one
    /// last delivery attempt for whatever is buffered.
    pub async fn run(mut self, mut messages: mpsc::UnboundedReceiver<OutputMessage>, cancel: CancellationToken) {
        let mut tick = interval(Duration::from_secs(self.config.flush_interval_secs.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            ingest_url = self.config.ingest_url.as_deref().unwrap_or("<none>"),
            flush_interval_secs = self.config.flush_interval_secs,
            buffer_max = self.config.buffer_max_size,
            "Backend writer started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if self.due() {
                        self.flush().await;
                    }
                }
                message = messages.recv() => match message {
                    Some(message) => self.accept(message),
                    None => break,
                },
            }
        }

        while let Ok(message) = messages.try_recv() {
            self.accept(message);
        }
        self.flush().await;
        if !self.buffer.is_empty() {
            tracing::warn!(lost = self.buffer.len(), "Backend writer stopped with undelivered messages");
        }
    }
}

fn log_batch(messages: &[OutputMessage]) {
    tracing::debug!(count = messages.len(), "No ingest_url configured, discarding batch");
    for message in messages {
        match message {
            OutputMessage::Datapoint(dp) => tracing::trace!(
                metric = %dp.metric_name,
                value = dp.value,
                dimensions = %format_dimensions(&dp.dimensions),
                "datapoint"
            ),
            OutputMessage::Event(event) => tracing::trace!(
                event_type = %event.event_type,
                dimensions = %format_dimensions(&event.dimensions),
                "event"
            ),
            OutputMessage::DimensionUpdate(update) => tracing::trace!(
                name = %update.name,
                value = %update.value,
                "dimension update"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;

    fn datapoint(name: &str) -> OutputMessage {
        OutputMessage::Datapoint(Datapoint::gauge(name, 1.0))
    }

    /// Starts a backend that records every accepted payload on `/ok` and
    /// rejects everything on `/fail`.
    async fn backend() -> (String, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Router::new()
            .route(
                "/ok",
                post(move |Json(body): Json<Value>| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(body);
                        StatusCode::NO_CONTENT
                    }
                }),
            )
            .route("/fail", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}"), rx)
    }

    fn writer(ingest_url: Option<String>) -> BackendWriter {
        let config = WriterConfig {
            ingest_url,
            flush_interval_secs: 2,
            max_backoff_secs: 10,
            ..WriterConfig::default()
        };
        BackendWriter::new(config, "test-host").unwrap()
    }

    #[test]
    fn buffer_drops_oldest_when_full() {
        let mut buffer = MetricBuffer::new(2);
        buffer.push_batch(vec![datapoint("a"), datapoint("b"), datapoint("c")]);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.dropped, 1);

        let names: Vec<_> = buffer
            .drain_all()
            .into_iter()
            .map(|m| match m {
                OutputMessage::Datapoint(dp) => dp.metric_name,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(names, vec!["b", "c"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn agent_dimension_does_not_override_monitor() {
        let mut writer = writer(None);
        writer.accept(datapoint("cpu.utilization"));
        writer.accept(OutputMessage::Datapoint(
            Datapoint::gauge("relayed", 1.0).with_dimension(AGENT_DIMENSION, "other"),
        ));

        let messages = writer.buffer.drain_all();
        let agents: Vec<_> = messages
            .iter()
            .map(|m| match m {
                OutputMessage::Datapoint(dp) => dp.dimensions[AGENT_DIMENSION].clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(agents, vec!["test-host", "other"]);
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut writer = writer(None);
        let delays: Vec<_> = (1..=5)
            .map(|failures| {
                writer.failures = failures;
                writer.backoff_delay().as_secs()
            })
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 10, 10]);
    }

    #[tokio::test]
    async fn flush_without_url_discards() {
        let mut writer = writer(None);
        writer.accept(datapoint("memory.used"));
        writer.flush().await;
        assert!(writer.buffer.is_empty());
        assert!(writer.due());
    }

    #[tokio::test]
    async fn delivers_batch_as_json() {
        let (base, mut received) = backend().await;
        let mut writer = writer(Some(format!("{base}/ok")));
        writer.accept(datapoint("cpu.utilization"));
        writer.accept(OutputMessage::Event(Event::new("tcp.state_change")));
        writer.flush().await;

        let body = received.recv().await.unwrap();
        assert_eq!(body["agent"], "test-host");
        assert_eq!(body["datapoints"][0]["metric_name"], "cpu.utilization");
        assert_eq!(body["datapoints"][0]["dimensions"][AGENT_DIMENSION], "test-host");
        assert_eq!(body["events"][0]["event_type"], "tcp.state_change");
        assert_eq!(body["dimension_updates"].as_array().unwrap().len(), 0);
        assert!(writer.buffer.is_empty());
        assert_eq!(writer.failures, 0);
    }

    #[tokio::test]
    async fn rejected_batch_is_rebuffered_with_backoff() {
        let (base, _received) = backend().await;
        let mut writer = writer(Some(format!("{base}/fail")));
        writer.accept(datapoint("disk.used"));
        writer.accept(datapoint("disk.free"));
        writer.flush().await;

        assert_eq!(writer.buffer.len(), 2);
        assert_eq!(writer.failures, 1);
        assert!(!writer.due());
    }

    #[tokio::test]
    async fn run_flushes_pending_messages_on_cancel() {
        let (base, mut received) = backend().await;
        let writer = writer(Some(format!("{base}/ok")));
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tx.send(datapoint("load.1m")).unwrap();
        cancel.cancel();
        writer.run(rx, cancel).await;

        let body = received.recv().await.unwrap();
        assert_eq!(body["datapoints"][0]["metric_name"], "load.1m");
    }
}
