use anyhow::Context;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use telemon_collectd::CollectdSettings;
use telemon_monitor::config::MonitorConfig;
use telemon_observer::ObserverConfig;

use crate::logging::LogConfig;
use crate::writer::WriterConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Default interval for monitors that do not set `interval_secs`.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Overrides the hostname reported with every datapoint.
    #[serde(default)]
    pub hostname: Option<String>,
    /// How often the config file's mtime is checked; 0 disables polling and
    /// leaves SIGHUP as the only reload trigger.
    #[serde(default = "default_reload_poll_secs")]
    pub reload_poll_secs: u64,
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    /// Present when collectd-backed monitors should be managed.
    #[serde(default)]
    pub collectd: Option<CollectdSettings>,
    #[serde(default)]
    pub observers: Vec<ObserverConfig>,
    /// Monitor entries, kept raw so one malformed entry does not reject the
    /// whole file.
    #[serde(default)]
    pub monitors: Vec<serde_json::Value>,
}

fn default_interval_secs() -> u64 {
    10
}

fn default_reload_poll_secs() -> u64 {
    5
}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        anyhow::ensure!(config.interval_secs > 0, "interval_secs must be > 0");
        Ok(config)
    }

    pub fn default_interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Parses the monitor entries, dropping the ones that are malformed.
    pub fn monitor_configs(&self) -> Vec<MonitorConfig> {
        self.monitors
            .iter()
            .enumerate()
            .filter_map(|(index, raw)| match MonitorConfig::from_value(raw.clone()) {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::error!(index, error = %e, "Ignoring invalid monitor entry");
                    None
                }
            })
            .collect()
    }

    /// Hostname from the config, falling back to the OS hostname.
    pub fn resolved_hostname(&self) -> String {
        self.hostname
            .clone()
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Sections that are only read at startup and differ from `other`.
    pub fn restart_only_changes(&self, other: &AgentConfig) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.observers != other.observers {
            changed.push("observers");
        }
        if self.collectd != other.collectd {
            changed.push("collectd");
        }
        if self.writer != other.writer {
            changed.push("writer");
        }
        if self.logging != other.logging {
            changed.push("logging");
        }
        if self.hostname != other.hostname {
            changed.push("hostname");
        }
        changed
    }
}
