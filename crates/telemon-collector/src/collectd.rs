//! Monitors that run inside the shared collectd process.
//!
//! Each instance renders its block of the plugin's `<Plugin>` section, named
//! after its monitor ID so collectd reports the ID as the plugin instance,
//! and registers it with the [`CollectdHandle`] together with its
//! `metrics_to_include` filter chain. Data comes back through the ingest
//! listener and is forwarded to the instance's output.

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use telemon_collectd::rules::{parse_allow_list, quote, FilterChain};
use telemon_collectd::{CollectdHandle, DatapointRoute, ManagedInstance};
use telemon_common::types::MonitorId;
use telemon_monitor::config::EffectiveConfig;
use telemon_monitor::output::Output;
use telemon_monitor::registry::{MonitorContext, MonitorPlugin};
use telemon_monitor::Monitor;

type RenderFn = fn(&MonitorId, &EffectiveConfig) -> anyhow::Result<String>;

#[derive(Clone, Copy)]
pub struct CollectdPlugin {
    monitor_type: &'static str,
    plugin: &'static str,
    default_port: u16,
    render: RenderFn,
}

impl CollectdPlugin {
    pub fn redis() -> Self {
        Self {
            monitor_type: "collectd/redis",
            plugin: "redis",
            default_port: 6379,
            render: render_redis,
        }
    }

    pub fn memcached() -> Self {
        Self {
            monitor_type: "collectd/memcached",
            plugin: "memcached",
            default_port: 11211,
            render: render_memcached,
        }
    }

    pub fn apache() -> Self {
        Self {
            monitor_type: "collectd/apache",
            plugin: "apache",
            default_port: 80,
            render: render_apache,
        }
    }

    fn managed_instance(&self, config: &EffectiveConfig) -> anyhow::Result<ManagedInstance> {
        let allow = config
            .common
            .metrics_to_include
            .as_deref()
            .map(parse_allow_list)
            .transpose()
            .context("invalid metrics_to_include")?;
        Ok(ManagedInstance {
            filter: FilterChain {
                monitor_id: config.monitor_id.clone(),
                plugin: self.plugin.to_string(),
                allow,
            },
            plugin_block: (self.render)(&config.monitor_id, config)?,
        })
    }
}

impl MonitorPlugin for CollectdPlugin {
    fn monitor_type(&self) -> &str {
        self.monitor_type
    }

    fn accepts_endpoints(&self) -> bool {
        true
    }

    fn config_prototype(&self) -> Map<String, Value> {
        let mut prototype = Map::new();
        prototype.insert("port".into(), Value::from(self.default_port));
        prototype
    }

    fn filters_metrics(&self) -> bool {
        true
    }

    fn validate_config(&self, config: &EffectiveConfig) -> anyhow::Result<()> {
        self.managed_instance(config).map(drop)
    }

    fn create_monitor(&self, context: MonitorContext) -> Box<dyn Monitor> {
        Box::new(CollectdMonitor {
            plugin: *self,
            output: context.output,
            collectd: context.collectd,
            registered: None,
        })
    }
}

pub struct CollectdMonitor {
    plugin: CollectdPlugin,
    output: Output,
    collectd: Option<CollectdHandle>,
    registered: Option<(CollectdHandle, MonitorId)>,
}

#[async_trait]
impl Monitor for CollectdMonitor {
    async fn configure(&mut self, config: &EffectiveConfig) -> anyhow::Result<()> {
        let handle = self
            .collectd
            .clone()
            .context("collectd is not enabled in the agent config")?;
        let instance = self.plugin.managed_instance(config)?;

        let output = self.output.clone();
        let route: DatapointRoute = Arc::new(move |points| output.send_datapoints(points));
        handle
            .register(instance, route)
            .await
            .with_context(|| format!("registering {} with collectd", config.monitor_id))?;

        self.registered = Some((handle, config.monitor_id.clone()));
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some((handle, monitor_id)) = self.registered.take() {
            handle.unregister(&monitor_id);
        }
    }
}

#[derive(Debug, Deserialize)]
struct RedisConfig {
    host: String,
    port: u16,
    #[serde(default)]
    auth: Option<String>,
    #[serde(default = "default_redis_timeout_ms")]
    timeout_ms: u64,
}

fn default_redis_timeout_ms() -> u64 {
    2000
}

fn render_redis(monitor_id: &MonitorId, config: &EffectiveConfig) -> anyhow::Result<String> {
    let redis: RedisConfig = config.typed()?;
    let mut lines = vec![
        format!("<Node {}>", quote(monitor_id.as_str())),
        format!("  Host {}", quote(&redis.host)),
        format!("  Port {}", quote(&redis.port.to_string())),
        format!("  Timeout {}", redis.timeout_ms),
    ];
    if let Some(auth) = &redis.auth {
        lines.push(format!("  Password {}", quote(auth)));
    }
    lines.push("</Node>".to_string());
    Ok(lines.join("\n"))
}

#[derive(Debug, Deserialize)]
struct MemcachedConfig {
    host: String,
    port: u16,
}

fn render_memcached(monitor_id: &MonitorId, config: &EffectiveConfig) -> anyhow::Result<String> {
    let memcached: MemcachedConfig = config.typed()?;
    Ok([
        format!("<Instance {}>", quote(monitor_id.as_str())),
        format!("  Host {}", quote(&memcached.host)),
        format!("  Port {}", quote(&memcached.port.to_string())),
        "</Instance>".to_string(),
    ]
    .join("\n"))
}

#[derive(Debug, Deserialize)]
struct ApacheConfig {
    host: String,
    port: u16,
    #[serde(default = "default_status_path")]
    status_path: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

fn default_status_path() -> String {
    "/server-status?auto".to_string()
}

fn render_apache(monitor_id: &MonitorId, config: &EffectiveConfig) -> anyhow::Result<String> {
    let apache: ApacheConfig = config.typed()?;
    anyhow::ensure!(
        apache.status_path.starts_with('/'),
        "status_path must start with '/'"
    );
    let url = format!("http://{}:{}{}", apache.host, apache.port, apache.status_path);
    let mut lines = vec![
        format!("<Instance {}>", quote(monitor_id.as_str())),
        format!("  URL {}", quote(&url)),
    ];
    if let Some(username) = &apache.username {
        lines.push(format!("  User {}", quote(username)));
    }
    if let Some(password) = &apache.password {
        lines.push(format!("  Password {}", quote(password)));
    }
    lines.push("</Instance>".to_string());
    Ok(lines.join("\n"))
}
