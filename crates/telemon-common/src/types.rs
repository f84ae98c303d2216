use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// How the backend should interpret a datapoint's value.
///
/// # Examples
///
/// ```
/// use telemon_common::types::MetricKind;
///
/// let kind: MetricKind = "cumulative".parse().unwrap();
/// assert_eq!(kind, MetricKind::Cumulative);
/// assert_eq!(kind.to_string(), "cumulative");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    #[default]
    Gauge,
    Counter,
    Cumulative,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Cumulative => write!(f, "cumulative"),
        }
    }
}

impl std::str::FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" | "derive" => Ok(MetricKind::Counter),
            "cumulative" | "absolute" => Ok(MetricKind::Cumulative),
            _ => Err(format!("unknown metric kind: {s}")),
        }
    }
}

/// A single measurement produced by a monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    pub value: f64,
    #[serde(default)]
    pub kind: MetricKind,
    #[serde(default)]
    pub dimensions: HashMap<String, String>,
}

impl Datapoint {
    /// A gauge stamped with the current time and no dimensions.
    pub fn gauge(metric_name: impl Into<String>, value: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            metric_name: metric_name.into(),
            value,
            kind: MetricKind::Gauge,
            dimensions: HashMap::new(),
        }
    }

    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }
}

/// A discrete occurrence reported by a monitor (e.g. a failed health check).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    #[serde(default)]
    pub dimensions: HashMap<String, String>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.into(),
            dimensions: HashMap::new(),
            properties: HashMap::new(),
        }
    }
}

/// Metadata attached to a dimension value rather than to a datapoint,
/// e.g. properties describing the host `hostname=web-01`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionUpdate {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Opaque endpoint identity assigned by the observer that discovered it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub String);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of one running monitor instance. Derived from the instance's
/// config identity, so the same desired instance always gets the same ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonitorId(pub String);

impl MonitorId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MonitorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A discovered service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub host: String,
    pub port: Option<u16>,
    pub name: String,
    /// Type of the observer that produced this endpoint (e.g. `"static"`).
    #[serde(default)]
    pub observer: String,
    /// Backend-specific key/values such as container labels.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: Option<u16>, name: impl Into<String>) -> Self {
        Self {
            id: EndpointId(id.into()),
            host: host.into(),
            port,
            name: name.into(),
            observer: String::new(),
            attributes: BTreeMap::new(),
        }
    }

    /// Looks up an attribute by key. The canonical fields are addressable
    /// as `host`, `port`, `name`, `observer` and `id`.
    pub fn attribute(&self, key: &str) -> Option<String> {
        match key {
            "host" => Some(self.host.clone()),
            "port" => self.port.map(|p| p.to_string()),
            "name" => Some(self.name.clone()),
            "observer" => Some(self.observer.clone()),
            "id" => Some(self.id.0.clone()),
            _ => self.attributes.get(key).cloned(),
        }
    }
}

/// Format a dimension map into a stable, human-readable string.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use telemon_common::types::format_dimensions;
///
/// let mut dims = HashMap::new();
/// dims.insert("plugin".to_string(), "redis".to_string());
/// dims.insert("host".to_string(), "web-01".to_string());
/// assert_eq!(format_dimensions(&dims), "host=web-01, plugin=redis");
/// ```
pub fn format_dimensions(dimensions: &HashMap<String, String>) -> String {
    if dimensions.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<String> = dimensions.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    pairs.join(", ")
}
