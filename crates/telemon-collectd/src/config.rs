use crate::rules::{quote, FilterChain, DISPATCH_CHAIN};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::path::PathBuf;
use telemon_common::types::MonitorId;

/// Process-wide collectd settings from the agent's `[collectd]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectdSettings {
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Missed intervals before collectd considers a value list stale.
    #[serde(default = "default_timeout")]
    pub timeout: u32,
    #[serde(default = "default_read_threads")]
    pub read_threads: u32,
    #[serde(default = "default_write_queue_limit_high")]
    pub write_queue_limit_high: u32,
    #[serde(default = "default_write_queue_limit_low")]
    pub write_queue_limit_low: u32,
    #[serde(default)]
    pub plugin_dir: Option<PathBuf>,
    #[serde(default)]
    pub hostname: Option<String>,
    /// Address of the agent's ingest listener that `write_http` posts to.
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Shell command run after every changed config write, e.g.
    /// `systemctl restart collectd`.
    #[serde(default)]
    pub reload_command: Option<String>,
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/var/run/telemon/collectd.conf")
}

fn default_interval_secs() -> u64 {
    10
}

fn default_timeout() -> u32 {
    2
}

fn default_read_threads() -> u32 {
    5
}

fn default_write_queue_limit_high() -> u32 {
    500_000
}

fn default_write_queue_limit_low() -> u32 {
    400_000
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8095
}

impl Default for CollectdSettings {
    fn default() -> Self {
        Self {
            config_path: default_config_path(),
            interval_secs: default_interval_secs(),
            timeout: default_timeout(),
            read_threads: default_read_threads(),
            write_queue_limit_high: default_write_queue_limit_high(),
            write_queue_limit_low: default_write_queue_limit_low(),
            plugin_dir: None,
            hostname: None,
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            reload_command: None,
        }
    }
}

impl CollectdSettings {
    pub fn ingest_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.listen_host,
            self.listen_port,
            crate::ingest::INGEST_PATH
        )
    }
}

/// What one collectd-backed monitor instance contributes to the config.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedInstance {
    pub filter: FilterChain,
    /// The instance's block inside its plugin's `<Plugin>` section. It must
    /// make collectd report the monitor ID as the plugin instance, e.g.
    /// `<Node "<id>"> ... </Node>` for the redis plugin.
    pub plugin_block: String,
}

impl ManagedInstance {
    pub fn monitor_id(&self) -> &MonitorId {
        &self.filter.monitor_id
    }

    pub fn plugin(&self) -> &str {
        &self.filter.plugin
    }
}

/// Renders the complete collectd configuration.
///
/// Instances are visited in monitor ID order and plugins in name order, so
/// the same inputs always produce byte-identical text.
pub fn render_config(
    settings: &CollectdSettings,
    instances: &BTreeMap<MonitorId, ManagedInstance>,
) -> String {
    let mut out = String::new();
    out.push_str("# Generated by telemon; manual edits are overwritten.\n\n");

    if let Some(hostname) = &settings.hostname {
        let _ = writeln!(out, "Hostname {}", quote(hostname));
    }
    out.push_str("FQDNLookup false\n");
    let _ = writeln!(out, "Interval {}", settings.interval_secs);
    let _ = writeln!(out, "Timeout {}", settings.timeout);
    let _ = writeln!(out, "ReadThreads {}", settings.read_threads);
    let _ = writeln!(out, "WriteQueueLimitHigh {}", settings.write_queue_limit_high);
    let _ = writeln!(out, "WriteQueueLimitLow {}", settings.write_queue_limit_low);
    if let Some(dir) = &settings.plugin_dir {
        let _ = writeln!(out, "PluginDir {}", quote(&dir.display().to_string()));
    }
    out.push('\n');

    let mut by_plugin: BTreeMap<&str, Vec<&ManagedInstance>> = BTreeMap::new();
    for instance in instances.values() {
        by_plugin.entry(instance.plugin()).or_default().push(instance);
    }

    let mut plugins: BTreeSet<&str> = ["match_regex", "target_set", "write_http"].into();
    plugins.extend(by_plugin.keys().copied());
    for plugin in &plugins {
        let _ = writeln!(out, "LoadPlugin {}", quote(plugin));
    }
    out.push('\n');

    out.push_str("<Plugin \"write_http\">\n");
    out.push_str("  <Node \"telemon\">\n");
    let _ = writeln!(out, "    URL {}", quote(&settings.ingest_url()));
    out.push_str("    Format \"JSON\"\n");
    out.push_str("    StoreRates false\n");
    out.push_str("  </Node>\n");
    out.push_str("</Plugin>\n\n");

    for (plugin, members) in &by_plugin {
        let _ = writeln!(out, "<Plugin {}>", quote(plugin));
        for instance in members {
            for line in instance.plugin_block.lines() {
                if line.is_empty() {
                    out.push('\n');
                } else {
                    let _ = writeln!(out, "  {line}");
                }
            }
        }
        out.push_str("</Plugin>\n\n");
    }

    let _ = writeln!(out, "PostCacheChain {}", quote(DISPATCH_CHAIN));
    let _ = writeln!(out, "<Chain {}>", quote(DISPATCH_CHAIN));
    for instance in instances.values() {
        out.push_str(&instance.filter.render_dispatch_rule());
    }
    out.push_str("  Target \"write\"\n");
    out.push_str("</Chain>\n");

    for instance in instances.values() {
        out.push('\n');
        out.push_str(&instance.filter.render_chain());
    }

    out
}
