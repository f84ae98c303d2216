use crate::config::{EffectiveConfig, MonitorConfig};
use crate::error::RegistryError;
use crate::output::Output;
use crate::Monitor;
use serde_json::{Map, Value};
use std::collections::HashMap;
use telemon_collectd::CollectdHandle;

/// Capabilities handed to a monitor factory.
#[derive(Clone)]
pub struct MonitorContext {
    pub output: Output,
    /// Present when the agent manages a collectd subprocess.
    pub collectd: Option<CollectdHandle>,
}

/// Factory and metadata for one monitor type.
///
/// Each type registers itself in the [`MonitorRegistry`] under
/// `monitor_type()`. The reconciler looks the type up for every desired
/// instance, validates the merged config and creates an instance through
/// `create_monitor`.
pub trait MonitorPlugin: Send + Sync {
    /// Returns the type name used in config (e.g. `"cpu"`, `"collectd/redis"`).
    fn monitor_type(&self) -> &str;

    /// Whether instances of this type bind to discovered endpoints.
    fn accepts_endpoints(&self) -> bool {
        false
    }

    /// Default values for the type-specific fields. They form the lowest
    /// layer of every merged config.
    fn config_prototype(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Types that apply `metrics_to_include` themselves (collectd filter
    /// chains) return true so the output does not filter a second time.
    fn filters_metrics(&self) -> bool {
        false
    }

    /// Rejects a merged config before an instance is created.
    fn validate_config(&self, _config: &EffectiveConfig) -> anyhow::Result<()> {
        Ok(())
    }

    /// Creates an unconfigured instance.
    fn create_monitor(&self, context: MonitorContext) -> Box<dyn Monitor>;
}

/// Registry of available [`MonitorPlugin`]s.
///
/// Built once at startup and shared by reference; there is no global
/// instance.
///
/// # Examples
///
/// ```
/// use telemon_monitor::error::RegistryError;
/// use telemon_monitor::registry::MonitorRegistry;
///
/// let registry = MonitorRegistry::new();
/// assert!(!registry.has_type("cpu"));
/// assert_eq!(
///     registry.lookup("cpu").err(),
///     Some(RegistryError::NotFound("cpu".to_string()))
/// );
/// ```
#[derive(Default)]
pub struct MonitorRegistry {
    plugins: HashMap<String, Box<dyn MonitorPlugin>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a monitor type. A second registration under the same name is
    /// refused.
    pub fn register(&mut self, plugin: Box<dyn MonitorPlugin>) -> Result<(), RegistryError> {
        let name = plugin.monitor_type().to_string();
        if self.plugins.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.plugins.insert(name, plugin);
        Ok(())
    }

    pub fn lookup(&self, monitor_type: &str) -> Result<&dyn MonitorPlugin, RegistryError> {
        self.plugins
            .get(monitor_type)
            .map(|p| p.as_ref())
            .ok_or_else(|| RegistryError::NotFound(monitor_type.to_string()))
    }

    pub fn has_type(&self, monitor_type: &str) -> bool {
        self.plugins.contains_key(monitor_type)
    }

    /// Registered type names, sorted.
    pub fn monitor_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plugins.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Drops entries whose type is unknown, logging each one. The rest are
    /// returned in their original order.
    pub fn retain_known(&self, configs: Vec<MonitorConfig>) -> Vec<MonitorConfig> {
        configs
            .into_iter()
            .filter(|config| match self.lookup(config.monitor_type()) {
                Ok(plugin) => {
                    if !plugin.accepts_endpoints() && !config.common.discovery_rule.is_empty() {
                        tracing::warn!(
                            monitor_type = %config.monitor_type(),
                            "Monitor type does not accept endpoints, ignoring discovery_rule"
                        );
                    }
                    true
                }
                Err(e) => {
                    tracing::error!(monitor_type = %config.monitor_type(), error = %e, "Skipping monitor");
                    false
                }
            })
            .collect()
    }
}
