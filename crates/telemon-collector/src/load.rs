use crate::{Collector, HostCollector};
use anyhow::Result;
use serde::Deserialize;
use sysinfo::System;
use telemon_common::types::Datapoint;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadConfig {}

pub struct LoadCollector;

impl Collector for LoadCollector {
    fn name(&self) -> &str {
        "load"
    }

    fn collect(&mut self) -> Result<Vec<Datapoint>> {
        let load_avg = System::load_average();
        Ok(vec![
            Datapoint::gauge("system.load_1", load_avg.one),
            Datapoint::gauge("system.load_5", load_avg.five),
            Datapoint::gauge("system.load_15", load_avg.fifteen),
            Datapoint::gauge("system.uptime", System::uptime() as f64),
        ])
    }
}

impl HostCollector for LoadCollector {
    const MONITOR_TYPE: &'static str = "load";
    type Config = LoadConfig;

    fn new(_config: LoadConfig) -> Self {
        Self
    }
}
