use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use telemon_common::types::{Datapoint, Event};
use telemon_monitor::config::EffectiveConfig;
use telemon_monitor::output::Output;
use telemon_monitor::registry::{MonitorContext, MonitorPlugin};
use telemon_monitor::Monitor;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Deserialize)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    2000
}

/// Checks that a TCP port accepts connections.
///
/// Emits `tcp.up` (1 or 0) and, when reachable, `tcp.connect_time_ms` every
/// interval, plus a `tcp.state_change` event whenever reachability flips.
pub struct TcpPlugin;

impl MonitorPlugin for TcpPlugin {
    fn monitor_type(&self) -> &str {
        "tcp"
    }

    fn accepts_endpoints(&self) -> bool {
        true
    }

    fn config_prototype(&self) -> Map<String, Value> {
        let mut prototype = Map::new();
        prototype.insert("timeout_ms".into(), Value::from(default_timeout_ms()));
        prototype
    }

    fn validate_config(&self, config: &EffectiveConfig) -> anyhow::Result<()> {
        let tcp: TcpConfig = config.typed()?;
        anyhow::ensure!(!tcp.host.is_empty(), "host must not be empty");
        anyhow::ensure!(tcp.timeout_ms > 0, "timeout_ms must be > 0");
        Ok(())
    }

    fn create_monitor(&self, context: MonitorContext) -> Box<dyn Monitor> {
        Box::new(TcpMonitor {
            output: context.output,
            cancel: CancellationToken::new(),
        })
    }
}

pub struct TcpMonitor {
    output: Output,
    cancel: CancellationToken,
}

#[async_trait]
impl Monitor for TcpMonitor {
    async fn configure(&mut self, config: &EffectiveConfig) -> anyhow::Result<()> {
        let tcp: TcpConfig = config.typed()?;
        tokio::spawn(run_check(
            tcp,
            self.output.clone(),
            config.interval,
            self.cancel.clone(),
        ));
        Ok(())
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
    }
}

/// Connect time in milliseconds, or `None` if the port did not accept a
/// connection within the timeout.
async fn measure_connect(config: &TcpConfig) -> Option<f64> {
    let started = Instant::now();
    let connect = TcpStream::connect((config.host.as_str(), config.port));
    match tokio::time::timeout(Duration::from_millis(config.timeout_ms), connect).await {
        Ok(Ok(_stream)) => Some(started.elapsed().as_secs_f64() * 1000.0),
        Ok(Err(e)) => {
            tracing::debug!(host = %config.host, port = config.port, error = %e, "TCP connect failed");
            None
        }
        Err(_) => None,
    }
}

async fn run_check(config: TcpConfig, output: Output, interval: Duration, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_up: Option<bool> = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = measure_connect(&config) => result,
        };

        let up = result.is_some();
        output.send_datapoint(Datapoint::gauge("tcp.up", if up { 1.0 } else { 0.0 }));
        if let Some(ms) = result {
            output.send_datapoint(Datapoint::gauge("tcp.connect_time_ms", ms));
        }

        if last_up.is_some_and(|prev| prev != up) {
            let mut event = Event::new("tcp.state_change");
            event
                .properties
                .insert("state".into(), if up { "up" } else { "down" }.into());
            output.send_event(event);
        }
        last_up = Some(up);
    }
}
