use crate::{Collector, HostCollector};
use anyhow::Result;
use serde::Deserialize;
use sysinfo::Disks;
use telemon_common::pattern::glob_matches;
use telemon_common::types::Datapoint;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskConfig {
    /// Glob patterns of mount points to report.
    #[serde(default = "default_mount_points")]
    pub mount_points: Vec<String>,
}

fn default_mount_points() -> Vec<String> {
    vec!["*".to_string()]
}

pub struct DiskCollector {
    disks: Disks,
    mount_points: Vec<String>,
}

impl Collector for DiskCollector {
    fn name(&self) -> &str {
        "disk"
    }

    fn collect(&mut self) -> Result<Vec<Datapoint>> {
        self.disks.refresh();
        let mut points = Vec::new();

        for disk in self.disks.iter() {
            let mount = disk.mount_point().to_string_lossy().to_string();
            if !self.mount_points.iter().any(|p| glob_matches(p, &mount)) {
                continue;
            }
            let total = disk.total_space();
            let available = disk.available_space();
            let used = total.saturating_sub(available);
            let usage_pct = if total > 0 {
                (used as f64 / total as f64) * 100.0
            } else {
                0.0
            };

            for (name, value) in [
                ("disk.total", total as f64),
                ("disk.used", used as f64),
                ("disk.available", available as f64),
                ("disk.used_percent", usage_pct),
            ] {
                points.push(Datapoint::gauge(name, value).with_dimension("mount", mount.clone()));
            }
        }

        Ok(points)
    }
}

impl HostCollector for DiskCollector {
    const MONITOR_TYPE: &'static str = "disk";
    type Config = DiskConfig;

    fn new(config: DiskConfig) -> Self {
        Self {
            disks: Disks::new_with_refreshed_list(),
            mount_points: config.mount_points,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmatched_mount_points_are_skipped() {
        let mut collector = DiskCollector::new(DiskConfig {
            mount_points: vec!["/definitely/not/mounted".into()],
        });
        assert!(collector.collect().unwrap().is_empty());
    }

    #[test]
    fn every_point_carries_its_mount() {
        let mut collector = DiskCollector::new(DiskConfig {
            mount_points: default_mount_points(),
        });
        let points = collector.collect().unwrap();
        assert_eq!(points.len() % 4, 0);
        assert!(points.iter().all(|p| p.dimensions.contains_key("mount")));
    }
}
