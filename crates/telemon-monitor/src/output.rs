use crate::config::EffectiveConfig;
use std::collections::HashMap;
use std::sync::Arc;
use telemon_common::pattern::glob_matches;
use telemon_common::types::{Datapoint, DimensionUpdate, Event, MonitorId};
use tokio::sync::mpsc;

/// Everything a monitor instance can send to the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputMessage {
    Datapoint(Datapoint),
    Event(Event),
    DimensionUpdate(DimensionUpdate),
}

/// The backend side of every [`Output`]: an unbounded hand-off to the
/// writer, which does its own buffering. Sending never waits.
#[derive(Clone, Debug)]
pub struct OutputSink {
    tx: mpsc::UnboundedSender<OutputMessage>,
}

impl OutputSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutputMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, message: OutputMessage) {
        if self.tx.send(message).is_err() {
            tracing::debug!("Output sink closed, dropping message");
        }
    }
}

/// The only way a monitor instance talks to the outside world.
///
/// Cloned freely into the instance's tasks. Datapoints and events are
/// stamped with the instance's dimensions (`monitor_type`, `monitor_id`,
/// the bound endpoint's `host`/`port`/`name` and any `extra_dimensions`).
/// Dimensions the monitor set itself are kept.
#[derive(Clone, Debug)]
pub struct Output {
    sink: OutputSink,
    monitor_id: MonitorId,
    dimensions: Arc<HashMap<String, String>>,
    include: Option<Arc<Vec<String>>>,
}

impl Output {
    /// Builds the output for one instance. `filter_metrics` applies the
    /// instance's `metrics_to_include` here; monitor types that filter at
    /// the source pass `false`.
    pub fn for_instance(sink: OutputSink, config: &EffectiveConfig, filter_metrics: bool) -> Self {
        let mut dimensions = HashMap::new();
        dimensions.insert("monitor_type".to_string(), config.monitor_type().to_string());
        dimensions.insert("monitor_id".to_string(), config.monitor_id.to_string());
        if let Some(endpoint) = &config.endpoint {
            dimensions.insert("host".to_string(), endpoint.host.clone());
            if let Some(port) = endpoint.port {
                dimensions.insert("port".to_string(), port.to_string());
            }
            dimensions.insert("name".to_string(), endpoint.name.clone());
        }
        for (key, value) in &config.common.extra_dimensions {
            dimensions.insert(key.clone(), value.clone());
        }

        let include = if filter_metrics {
            config.common.metrics_to_include.clone().map(Arc::new)
        } else {
            None
        };

        Self {
            sink,
            monitor_id: config.monitor_id.clone(),
            dimensions: Arc::new(dimensions),
            include,
        }
    }

    pub fn monitor_id(&self) -> &MonitorId {
        &self.monitor_id
    }

    pub fn dimensions(&self) -> &HashMap<String, String> {
        &self.dimensions
    }

    fn included(&self, metric_name: &str) -> bool {
        match &self.include {
            None => true,
            Some(patterns) => patterns.iter().any(|p| glob_matches(p, metric_name)),
        }
    }

    fn stamp(&self, target: &mut HashMap<String, String>) {
        for (key, value) in self.dimensions.iter() {
            target.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    pub fn emit(&self, message: OutputMessage) {
        let message = match message {
            OutputMessage::Datapoint(mut dp) => {
                if !self.included(&dp.metric_name) {
                    return;
                }
                self.stamp(&mut dp.dimensions);
                OutputMessage::Datapoint(dp)
            }
            OutputMessage::Event(mut event) => {
                self.stamp(&mut event.dimensions);
                OutputMessage::Event(event)
            }
            update @ OutputMessage::DimensionUpdate(_) => update,
        };
        self.sink.send(message);
    }

    pub fn send_datapoint(&self, datapoint: Datapoint) {
        self.emit(OutputMessage::Datapoint(datapoint));
    }

    pub fn send_datapoints(&self, datapoints: impl IntoIterator<Item = Datapoint>) {
        for dp in datapoints {
            self.send_datapoint(dp);
        }
    }

    pub fn send_event(&self, event: Event) {
        self.emit(OutputMessage::Event(event));
    }

    pub fn send_dimension_update(&self, update: DimensionUpdate) {
        self.emit(OutputMessage::DimensionUpdate(update));
    }
}
