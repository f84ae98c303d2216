use crate::HostCollector;
use async_trait::async_trait;
use std::marker::PhantomData;
use std::time::Duration;
use telemon_monitor::config::EffectiveConfig;
use telemon_monitor::output::Output;
use telemon_monitor::registry::{MonitorContext, MonitorPlugin};
use telemon_monitor::Monitor;
use tokio_util::sync::CancellationToken;

/// Registers a [`HostCollector`] as a monitor type that never binds to an
/// endpoint.
pub struct HostPlugin<C>(PhantomData<fn() -> C>);

impl<C: HostCollector> HostPlugin<C> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<C: HostCollector> Default for HostPlugin<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: HostCollector> MonitorPlugin for HostPlugin<C> {
    fn monitor_type(&self) -> &str {
        C::MONITOR_TYPE
    }

    fn validate_config(&self, config: &EffectiveConfig) -> anyhow::Result<()> {
        config.typed::<C::Config>()?;
        Ok(())
    }

    fn create_monitor(&self, context: MonitorContext) -> Box<dyn Monitor> {
        Box::new(IntervalMonitor::<C>::new(context.output))
    }
}

/// Runs a collector on the instance's interval until shut down.
pub struct IntervalMonitor<C> {
    output: Output,
    cancel: CancellationToken,
    _collector: PhantomData<fn() -> C>,
}

impl<C: HostCollector> IntervalMonitor<C> {
    pub fn new(output: Output) -> Self {
        Self {
            output,
            cancel: CancellationToken::new(),
            _collector: PhantomData,
        }
    }
}

#[async_trait]
impl<C: HostCollector> Monitor for IntervalMonitor<C> {
    async fn configure(&mut self, config: &EffectiveConfig) -> anyhow::Result<()> {
        let collector = C::new(config.typed::<C::Config>()?);
        tokio::spawn(run_collector(
            collector,
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

async fn run_collector<C: HostCollector>(
    mut collector: C,
    output: Output,
    interval: Duration,
    cancel: CancellationToken,
) {
    // The first tick completes immediately.
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tick.tick() => match collector.collect() {
                Ok(points) => {
                    tracing::debug!(collector = collector.name(), count = points.len(), "Collected metrics");
                    output.send_datapoints(points);
                }
                Err(e) => tracing::warn!(collector = collector.name(), error = %e, "Collection failed"),
            },
        }
    }
    tracing::debug!(collector = collector.name(), monitor_id = %output.monitor_id(), "Collector stopped");
}
