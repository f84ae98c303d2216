use crate::{Collector, HostCollector};
use anyhow::Result;
use serde::Deserialize;
use sysinfo::System;
use telemon_common::types::Datapoint;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CpuConfig {
    #[serde(default = "default_report_per_core")]
    pub report_per_core: bool,
}

fn default_report_per_core() -> bool {
    true
}

pub struct CpuCollector {
    system: System,
    report_per_core: bool,
}

impl Collector for CpuCollector {
    fn name(&self) -> &str {
        "cpu"
    }

    fn collect(&mut self) -> Result<Vec<Datapoint>> {
        self.system.refresh_cpu_all();
        let mut points = vec![Datapoint::gauge(
            "cpu.usage",
            self.system.global_cpu_usage() as f64,
        )];

        if self.report_per_core {
            for (i, cpu) in self.system.cpus().iter().enumerate() {
                points.push(
                    Datapoint::gauge("cpu.core_usage", cpu.cpu_usage() as f64)
                        .with_dimension("core", i.to_string()),
                );
            }
        }

        Ok(points)
    }
}

impl HostCollector for CpuCollector {
    const MONITOR_TYPE: &'static str = "cpu";
    type Config = CpuConfig;

    fn new(config: CpuConfig) -> Self {
        let mut system = System::new();
        // Usage is a delta between refreshes; prime the first sample.
        system.refresh_cpu_all();
        Self {
            system,
            report_per_core: config.report_per_core,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_core_points_follow_config() {
        let mut all = CpuCollector::new(CpuConfig { report_per_core: true });
        let points = all.collect().unwrap();
        assert_eq!(points[0].metric_name, "cpu.usage");
        assert!(points[1..]
            .iter()
            .all(|p| p.metric_name == "cpu.core_usage" && p.dimensions.contains_key("core")));

        let mut global = CpuCollector::new(CpuConfig { report_per_core: false });
        assert_eq!(global.collect().unwrap().len(), 1);
    }
}
