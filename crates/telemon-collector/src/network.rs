use crate::{Collector, HostCollector};
use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use sysinfo::Networks;
use telemon_common::pattern::glob_matches;
use telemon_common::types::{Datapoint, MetricKind};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Glob patterns of interface names to report.
    #[serde(default = "default_interfaces")]
    pub interfaces: Vec<String>,
}

fn default_interfaces() -> Vec<String> {
    vec!["*".to_string()]
}

/// Cumulative counters of one interface at the previous collection.
#[derive(Debug, Clone, Copy, Default)]
struct Totals {
    received: u64,
    transmitted: u64,
    packets_received: u64,
    packets_transmitted: u64,
}

pub struct NetworkCollector {
    networks: Networks,
    interfaces: Vec<String>,
    previous: HashMap<String, Totals>,
}

impl Collector for NetworkCollector {
    fn name(&self) -> &str {
        "network"
    }

    fn collect(&mut self) -> Result<Vec<Datapoint>> {
        self.networks.refresh();
        let mut points = Vec::new();

        for (name, data) in self.networks.iter() {
            if !self.interfaces.iter().any(|p| glob_matches(p, name)) {
                continue;
            }
            let now = Totals {
                received: data.total_received(),
                transmitted: data.total_transmitted(),
                packets_received: data.total_packets_received(),
                packets_transmitted: data.total_packets_transmitted(),
            };
            // The first sample of an interface reports zero deltas.
            let prev = self.previous.insert(name.clone(), now).unwrap_or(now);

            for (metric, value) in [
                ("network.bytes_recv", now.received.saturating_sub(prev.received)),
                ("network.bytes_sent", now.transmitted.saturating_sub(prev.transmitted)),
                ("network.packets_recv", now.packets_received.saturating_sub(prev.packets_received)),
                ("network.packets_sent", now.packets_transmitted.saturating_sub(prev.packets_transmitted)),
            ] {
                let mut dp = Datapoint::gauge(metric, value as f64).with_dimension("interface", name.clone());
                dp.kind = MetricKind::Counter;
                points.push(dp);
            }
        }

        Ok(points)
    }
}

impl HostCollector for NetworkCollector {
    const MONITOR_TYPE: &'static str = "network";
    type Config = NetworkConfig;

    fn new(config: NetworkConfig) -> Self {
        Self {
            networks: Networks::new_with_refreshed_list(),
            interfaces: config.interfaces,
            previous: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_reports_zero_deltas() {
        let mut collector = NetworkCollector::new(NetworkConfig {
            interfaces: default_interfaces(),
        });
        let points = collector.collect().unwrap();
        assert!(points.iter().all(|p| p.value == 0.0));
        assert!(points.iter().all(|p| p.kind == MetricKind::Counter));
    }

    #[test]
    fn interface_filter_applies() {
        let mut collector = NetworkCollector::new(NetworkConfig {
            interfaces: vec!["no-such-if*".into()],
        });
        assert!(collector.collect().unwrap().is_empty());
    }
}
