//! Combines a monitor entry with a discovered endpoint.
//!
//! Layers, lowest first: the type's prototype defaults, endpoint attributes,
//! the monitor's own fields. `host` and `name` always come from a bound
//! endpoint, and `port` does too when the endpoint has one, so discovery
//! controls where to connect while the user controls everything else.

use crate::config::{EffectiveConfig, MonitorConfig};
use crate::error::{MonitorError, Result};
use crate::registry::MonitorPlugin;
use serde_json::{Map, Value};
use std::time::Duration;
use telemon_common::types::Endpoint;

/// Fields that an endpoint always overrides.
pub const CANONICAL_FIELDS: [&str; 3] = ["host", "port", "name"];

/// Merges field maps without consulting any monitor type.
///
/// # Examples
///
/// ```
/// use serde_json::{json, Map};
/// use telemon_common::types::Endpoint;
/// use telemon_monitor::merge::merge_fields;
///
/// let mut fields = Map::new();
/// fields.insert("port".into(), json!(9999));
/// fields.insert("path".into(), json!("/health"));
/// let endpoint = Endpoint::new("e1", "10.0.0.1", Some(80), "svc");
///
/// let merged = merge_fields(&Map::new(), &fields, Some(&endpoint));
/// assert_eq!(merged["port"], json!(80));
/// assert_eq!(merged["host"], json!("10.0.0.1"));
/// assert_eq!(merged["path"], json!("/health"));
/// ```
pub fn merge_fields(
    prototype: &Map<String, Value>,
    fields: &Map<String, Value>,
    endpoint: Option<&Endpoint>,
) -> Map<String, Value> {
    let mut merged = prototype.clone();

    if let Some(endpoint) = endpoint {
        for (key, value) in &endpoint.attributes {
            merged.insert(key.clone(), Value::String(value.clone()));
        }
    }

    for (key, value) in fields {
        merged.insert(key.clone(), value.clone());
    }

    if let Some(endpoint) = endpoint {
        merged.insert("host".into(), Value::String(endpoint.host.clone()));
        if let Some(port) = endpoint.port {
            merged.insert("port".into(), Value::from(port));
        }
        merged.insert("name".into(), Value::String(endpoint.name.clone()));
    }

    merged
}

/// Produces the validated effective config for one instance.
///
/// The endpoint is ignored when `plugin` does not accept endpoints.
pub fn merge(
    plugin: &dyn MonitorPlugin,
    config: &MonitorConfig,
    endpoint: Option<&Endpoint>,
    default_interval: Duration,
) -> Result<EffectiveConfig> {
    let endpoint = endpoint.filter(|_| plugin.accepts_endpoints());
    let fields = merge_fields(&plugin.config_prototype(), &config.fields, endpoint);
    let effective = EffectiveConfig::new(
        config.common.clone(),
        config.interval(default_interval),
        fields,
        endpoint.cloned(),
    );

    plugin
        .validate_config(&effective)
        .map_err(|e| MonitorError::Validation {
            monitor_type: config.monitor_type().to_string(),
            message: format!("{e:#}"),
        })?;

    Ok(effective)
}
