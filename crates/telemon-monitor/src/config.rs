use crate::error::ConfigError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use telemon_common::pattern::glob_matches;
use telemon_common::types::{Endpoint, MonitorId};

/// Settings every monitor entry understands, regardless of its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonConfig {
    #[serde(rename = "type")]
    pub monitor_type: String,
    /// Overrides the agent-wide interval.
    #[serde(default)]
    pub interval_secs: Option<u64>,
    /// Endpoint attribute -> glob. An endpoint matches when every pattern
    /// matches the attribute of the same name.
    #[serde(default)]
    pub discovery_rule: BTreeMap<String, String>,
    #[serde(default)]
    pub extra_dimensions: BTreeMap<String, String>,
    /// Allow-list of metric names. `None` keeps everything.
    #[serde(default)]
    pub metrics_to_include: Option<Vec<String>>,
    #[serde(default)]
    pub disabled: bool,
}

impl CommonConfig {
    pub const KEYS: [&'static str; 6] = [
        "type",
        "interval_secs",
        "discovery_rule",
        "extra_dimensions",
        "metrics_to_include",
        "disabled",
    ];

    pub fn new(monitor_type: impl Into<String>) -> Self {
        Self {
            monitor_type: monitor_type.into(),
            interval_secs: None,
            discovery_rule: BTreeMap::new(),
            extra_dimensions: BTreeMap::new(),
            metrics_to_include: None,
            disabled: false,
        }
    }

    /// Returns true when every discovery rule pattern matches the endpoint.
    /// A missing attribute never matches.
    pub fn matches(&self, endpoint: &Endpoint) -> bool {
        self.discovery_rule.iter().all(|(key, pattern)| {
            endpoint
                .attribute(key)
                .is_some_and(|value| glob_matches(pattern, &value))
        })
    }
}

/// A user-authored monitor entry: the common settings plus whatever fields
/// the monitor type defines.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub common: CommonConfig,
    pub fields: Map<String, Value>,
}

impl MonitorConfig {
    pub fn new(monitor_type: impl Into<String>) -> Self {
        Self {
            common: CommonConfig::new(monitor_type),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn monitor_type(&self) -> &str {
        &self.common.monitor_type
    }

    /// Splits a raw table into common keys and type-specific fields.
    ///
    /// # Examples
    ///
    /// ```
    /// use telemon_monitor::config::MonitorConfig;
    ///
    /// let raw = serde_json::json!({
    ///     "type": "collectd/redis",
    ///     "interval_secs": 30,
    ///     "discovery_rule": { "name": "redis*" },
    ///     "auth": "secret",
    /// });
    /// let config = MonitorConfig::from_value(raw).unwrap();
    /// assert_eq!(config.monitor_type(), "collectd/redis");
    /// assert_eq!(config.common.interval_secs, Some(30));
    /// assert_eq!(config.fields.len(), 1);
    /// assert!(config.fields.contains_key("auth"));
    /// ```
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let Value::Object(mut table) = value else {
            return Err(ConfigError::NotATable);
        };
        if !matches!(table.get("type"), Some(Value::String(t)) if !t.is_empty()) {
            return Err(ConfigError::MissingType);
        }

        let mut common = Map::new();
        for key in CommonConfig::KEYS {
            if let Some(v) = table.remove(key) {
                common.insert(key.to_string(), v);
            }
        }
        let common: CommonConfig = serde_json::from_value(Value::Object(common))?;
        if common.interval_secs == Some(0) {
            return Err(ConfigError::Invalid("interval_secs must be > 0".into()));
        }

        Ok(Self {
            common,
            fields: table,
        })
    }

    pub fn interval(&self, default: Duration) -> Duration {
        self.common
            .interval_secs
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}

/// Content hash of an effective configuration. Equal identities are the
/// same desired instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigIdentity(String);

impl ConfigIdentity {
    /// Hashes `(monitor type, interval, dimensions, allow-list, fields)`.
    /// `serde_json` maps are ordered, so equal inputs serialise to equal
    /// bytes.
    fn compute(common: &CommonConfig, interval: Duration, fields: &Map<String, Value>) -> Self {
        let canonical = serde_json::json!({
            "type": common.monitor_type,
            "interval_ms": interval.as_millis() as u64,
            "extra_dimensions": common.extra_dimensions,
            "metrics_to_include": common.metrics_to_include,
            "fields": fields,
        });
        Self(format!("{:x}", Sha256::digest(canonical.to_string().as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form used as the instance's monitor ID.
    pub fn monitor_id(&self) -> MonitorId {
        MonitorId(self.0[..16].to_string())
    }
}

impl fmt::Display for ConfigIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..16])
    }
}

/// The merged configuration bound to exactly one monitor instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub common: CommonConfig,
    pub interval: Duration,
    pub fields: Map<String, Value>,
    /// The endpoint merged in, if the monitor type accepts endpoints.
    pub endpoint: Option<Endpoint>,
    pub identity: ConfigIdentity,
    pub monitor_id: MonitorId,
}

impl EffectiveConfig {
    pub fn new(
        common: CommonConfig,
        interval: Duration,
        fields: Map<String, Value>,
        endpoint: Option<Endpoint>,
    ) -> Self {
        let identity = ConfigIdentity::compute(&common, interval, &fields);
        let monitor_id = identity.monitor_id();
        Self {
            common,
            interval,
            fields,
            endpoint,
            identity,
            monitor_id,
        }
    }

    pub fn monitor_type(&self) -> &str {
        &self.common.monitor_type
    }

    /// Deserialises the merged fields into a monitor's typed config.
    pub fn typed<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}
