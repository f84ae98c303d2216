//! Receives collectd `write_http` posts (`Format "JSON"`) and hands the
//! decoded datapoints to the monitor instance that owns them.

use crate::manager::CollectdHandle;
use crate::rules::MONITOR_ID_META;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use telemon_common::types::{Datapoint, MetricKind, MonitorId};
use tokio_util::sync::CancellationToken;

/// Path collectd's `write_http` node posts to.
pub const INGEST_PATH: &str = "/v1/collectd";

/// One collectd value list as serialised by `write_http`.
#[derive(Debug, Clone, Deserialize)]
pub struct ValueList {
    pub values: Vec<Option<f64>>,
    #[serde(default)]
    pub dstypes: Vec<String>,
    #[serde(default)]
    pub dsnames: Vec<String>,
    /// Seconds since the epoch, fractional.
    pub time: f64,
    #[serde(default)]
    pub interval: f64,
    #[serde(default)]
    pub host: String,
    pub plugin: String,
    #[serde(default)]
    pub plugin_instance: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub type_instance: String,
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
}

impl ValueList {
    /// The owning monitor, as tagged by the instance's dispatch rule.
    pub fn monitor_id(&self) -> Option<MonitorId> {
        match self.meta.get(MONITOR_ID_META)? {
            serde_json::Value::String(id) if !id.is_empty() => Some(MonitorId(id.clone())),
            _ => None,
        }
    }

    fn timestamp(&self) -> DateTime<Utc> {
        let secs = self.time.trunc() as i64;
        let nanos = (self.time.fract() * 1e9) as u32;
        Utc.timestamp_opt(secs, nanos).single().unwrap_or_else(Utc::now)
    }

    /// Converts every non-null value into a datapoint named
    /// `type[.type_instance][.dsname]`; the dsname is left out for
    /// single-value types whose data source is called `value`.
    pub fn to_datapoints(&self) -> Vec<Datapoint> {
        let timestamp = self.timestamp();
        let monitor_id = self.monitor_id();

        let mut base = self.type_name.clone();
        if !self.type_instance.is_empty() {
            base.push('.');
            base.push_str(&self.type_instance);
        }

        let mut dimensions = HashMap::new();
        dimensions.insert("plugin".to_string(), self.plugin.clone());
        if !self.plugin_instance.is_empty()
            && monitor_id.as_ref().map(MonitorId::as_str) != Some(self.plugin_instance.as_str())
        {
            dimensions.insert("plugin_instance".to_string(), self.plugin_instance.clone());
        }

        self.values
            .iter()
            .enumerate()
            .filter_map(|(i, value)| {
                let value = (*value)?;
                let dsname = self.dsnames.get(i).map(String::as_str).unwrap_or("value");
                let metric_name = if dsname == "value" || dsname.is_empty() {
                    base.clone()
                } else {
                    format!("{base}.{dsname}")
                };
                let kind = self
                    .dstypes
                    .get(i)
                    .and_then(|t| t.parse::<MetricKind>().ok())
                    .unwrap_or_default();
                Some(Datapoint {
                    timestamp,
                    metric_name,
                    value,
                    kind,
                    dimensions: dimensions.clone(),
                })
            })
            .collect()
    }
}

/// Routes a batch of value lists to their owners. Returns how many value
/// lists had no registered owner.
pub fn dispatch(handle: &CollectdHandle, batch: Vec<ValueList>) -> usize {
    let mut by_owner: HashMap<MonitorId, Vec<Datapoint>> = HashMap::new();
    let mut orphaned = 0;
    for list in batch {
        match list.monitor_id() {
            Some(id) if handle.route(&id).is_some() => {
                by_owner.entry(id).or_default().extend(list.to_datapoints());
            }
            other => {
                orphaned += 1;
                tracing::debug!(
                    plugin = %list.plugin,
                    plugin_instance = %list.plugin_instance,
                    monitor_id = ?other,
                    "Dropping collectd value list without a known owner"
                );
            }
        }
    }
    for (id, points) in by_owner {
        // The owner may have stopped since the lookup above.
        if let Some(route) = handle.route(&id) {
            route(points);
        }
    }
    orphaned
}

async fn ingest(
    State(handle): State<CollectdHandle>,
    Json(batch): Json<Vec<ValueList>>,
) -> StatusCode {
    dispatch(&handle, batch);
    StatusCode::NO_CONTENT
}

pub fn router(handle: CollectdHandle) -> Router {
    Router::new()
        .route(INGEST_PATH, post(ingest))
        .with_state(handle)
}

/// Binds the ingest listener and serves until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    handle: CollectdHandle,
    cancel: CancellationToken,
) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, path = INGEST_PATH, "collectd ingest listener started");
    axum::serve(listener, router(handle))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CollectdSettings, ManagedInstance};
    use crate::manager::{CollectdManager, DatapointRoute};
    use crate::reload::NoopReload;
    use crate::rules::FilterChain;
    use std::sync::{Arc, Mutex};

    const BATCH: &str = r#"[
        {"values":[197141504,175136768],"dstypes":["derive","derive"],"dsnames":["rx","tx"],
         "time":1251533299.265,"interval":10.0,"host":"web-01","plugin":"redis",
         "plugin_instance":"m1","type":"if_octets","type_instance":"",
         "meta":{"monitorID":"m1"}},
        {"values":[1024],"dstypes":["gauge"],"dsnames":["value"],
         "time":1251533299.0,"interval":10.0,"host":"web-01","plugin":"redis",
         "plugin_instance":"m1","type":"memory","type_instance":"used","meta":{"monitorID":"m1"}},
        {"values":[null],"dstypes":["gauge"],"dsnames":["value"],
         "time":1251533299.0,"interval":10.0,"host":"web-01","plugin":"redis",
         "plugin_instance":"m1","type":"memory","type_instance":"peak","meta":{"monitorID":"m1"}},
        {"values":[3],"dstypes":["gauge"],"dsnames":["value"],
         "time":1251533299.0,"interval":10.0,"host":"web-01","plugin":"cpu",
         "plugin_instance":"0","type":"percent","type_instance":"idle"}
    ]"#;

    #[test]
    fn value_lists_decode_into_named_datapoints() {
        let batch: Vec<ValueList> = serde_json::from_str(BATCH).unwrap();
        let octets = batch[0].to_datapoints();
        assert_eq!(octets.len(), 2);
        assert_eq!(octets[0].metric_name, "if_octets.rx");
        assert_eq!(octets[1].metric_name, "if_octets.tx");
        assert_eq!(octets[0].kind, MetricKind::Counter);
        assert_eq!(octets[0].dimensions.get("plugin").map(String::as_str), Some("redis"));
        // The plugin instance is the monitor ID and is not repeated.
        assert!(!octets[0].dimensions.contains_key("plugin_instance"));
        assert_eq!(octets[0].timestamp.timestamp(), 1251533299);

        let memory = batch[1].to_datapoints();
        assert_eq!(memory[0].metric_name, "memory.used");
        assert_eq!(memory[0].value, 1024.0);

        assert!(batch[2].to_datapoints().is_empty());

        assert_eq!(batch[3].monitor_id(), None);
        assert_eq!(
            batch[3].to_datapoints()[0].dimensions.get("plugin_instance").map(String::as_str),
            Some("0")
        );
    }

    #[tokio::test]
    async fn dispatch_routes_by_monitor_id_and_drops_orphans() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let settings = CollectdSettings {
            config_path: dir.path().join("collectd.conf"),
            ..CollectdSettings::default()
        };
        let (handle, _task) =
            CollectdHandle::spawn(CollectdManager::new(settings, Box::new(NoopReload)));

        let received: Arc<Mutex<Vec<Datapoint>>> = Arc::default();
        let sink = received.clone();
        let route: DatapointRoute = Arc::new(move |points| sink.lock().unwrap().extend(points));
        handle
            .register(
                ManagedInstance {
                    filter: FilterChain {
                        monitor_id: MonitorId::from("m1"),
                        plugin: "redis".into(),
                        allow: None,
                    },
                    plugin_block: "<Node \"m1\">\n</Node>".into(),
                },
                route,
            )
            .await?;

        let batch: Vec<ValueList> = serde_json::from_str(BATCH)?;
        let orphaned = dispatch(&handle, batch);
        assert_eq!(orphaned, 1);
        assert_eq!(received.lock().unwrap().len(), 3);

        handle.unregister(&MonitorId::from("m1"));
        let batch: Vec<ValueList> = serde_json::from_str(BATCH)?;
        assert_eq!(dispatch(&handle, batch), 4);
        Ok(())
    }
}
