use crate::{Collector, HostCollector};
use anyhow::Result;
use serde::Deserialize;
use sysinfo::System;
use telemon_common::types::Datapoint;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {}

pub struct MemoryCollector {
    system: System,
}

fn percent(part: u64, total: u64) -> f64 {
    if total > 0 {
        (part as f64 / total as f64) * 100.0
    } else {
        0.0
    }
}

impl Collector for MemoryCollector {
    fn name(&self) -> &str {
        "memory"
    }

    fn collect(&mut self) -> Result<Vec<Datapoint>> {
        self.system.refresh_memory();

        let total = self.system.total_memory();
        let used = self.system.used_memory();
        let swap_total = self.system.total_swap();
        let swap_used = self.system.used_swap();

        Ok(vec![
            Datapoint::gauge("memory.total", total as f64),
            Datapoint::gauge("memory.used", used as f64),
            Datapoint::gauge("memory.available", self.system.available_memory() as f64),
            Datapoint::gauge("memory.used_percent", percent(used, total)),
            Datapoint::gauge("memory.swap_total", swap_total as f64),
            Datapoint::gauge("memory.swap_used", swap_used as f64),
            Datapoint::gauge("memory.swap_percent", percent(swap_used, swap_total)),
        ])
    }
}

impl HostCollector for MemoryCollector {
    const MONITOR_TYPE: &'static str = "memory";
    type Config = MemoryConfig;

    fn new(_config: MemoryConfig) -> Self {
        Self {
            system: System::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_empty_totals() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
    }

    #[test]
    fn reports_memory_and_swap() {
        let points = MemoryCollector::new(MemoryConfig::default()).collect().unwrap();
        let names: Vec<&str> = points.iter().map(|p| p.metric_name.as_str()).collect();
        assert!(names.contains(&"memory.used_percent"));
        assert!(names.contains(&"memory.swap_percent"));
        assert_eq!(points.len(), 7);
    }
}
