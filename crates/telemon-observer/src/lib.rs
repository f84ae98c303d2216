//! Endpoint discovery.
//!
//! An [`Observer`] is polled for its current view of the world; the
//! [`feed::EndpointFeed`] turns successive snapshots into an ordered stream
//! of [`EndpointEvent`]s, retrying failing observers with backoff so a
//! discovery outage never reaches the reconciler as an error.

pub mod error;
pub mod feed;
pub mod file;
pub mod static_list;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use telemon_common::types::{Endpoint, EndpointId};

/// A change in the set of discovered endpoints.
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEvent {
    /// A new endpoint, or a known endpoint whose attributes changed.
    Appeared(Endpoint),
    Vanished(EndpointId),
}

/// A discovery backend.
///
/// Implementations return a full snapshot on every call; diffing against the
/// previous snapshot is the feed's job. Endpoint IDs must be stable across
/// calls for the same underlying service.
#[async_trait]
pub trait Observer: Send + Sync {
    /// Returns the observer type (e.g., `"static"`, `"file"`), copied into
    /// every endpoint's `observer` field.
    fn observer_type(&self) -> &str;

    /// How long to wait between successful discovery rounds.
    fn poll_interval(&self) -> Duration;

    /// Returns every endpoint currently visible to this observer.
    ///
    /// # Errors
    ///
    /// Returns an error if the discovery source is unreachable or returns
    /// undecodable data. The feed keeps the previous snapshot in that case.
    async fn discover(&mut self) -> error::Result<Vec<Endpoint>>;
}

/// A statically configured endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Explicit endpoint ID; defaults to `host:port`.
    #[serde(default)]
    pub id: Option<String>,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub attributes: std::collections::BTreeMap<String, String>,
}

impl EndpointSpec {
    pub(crate) fn into_endpoint(self, observer_type: &str) -> error::Result<Endpoint> {
        if self.host.trim().is_empty() {
            return Err(error::ObserverError::InvalidConfig(
                "endpoint without host".to_string(),
            ));
        }
        let raw_id = match (&self.id, self.port) {
            (Some(id), _) => id.clone(),
            (None, Some(port)) => format!("{}:{port}", self.host),
            (None, None) => self.host.clone(),
        };
        let name = self.name.unwrap_or_else(|| raw_id.clone());
        let mut endpoint = Endpoint::new(
            format!("{observer_type}:{raw_id}"),
            self.host,
            self.port,
            name,
        );
        endpoint.observer = observer_type.to_string();
        endpoint.attributes = self.attributes;
        Ok(endpoint)
    }
}

/// Observer configuration as written in the agent config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ObserverConfig {
    /// Endpoints listed inline in the config file.
    Static {
        #[serde(default)]
        endpoints: Vec<EndpointSpec>,
    },
    /// Endpoints listed in a separate JSON or TOML file that is re-read on
    /// every poll, so external tooling can drive discovery.
    File {
        path: PathBuf,
        #[serde(default = "default_poll_interval_secs")]
        poll_interval_secs: u64,
    },
}

fn default_poll_interval_secs() -> u64 {
    10
}

/// Builds an [`Observer`] from its configuration.
///
/// # Errors
///
/// Returns [`error::ObserverError::InvalidConfig`] if a static endpoint is
/// malformed or the file observer's poll interval is zero.
pub fn build_observer(config: &ObserverConfig) -> error::Result<Box<dyn Observer>> {
    match config {
        ObserverConfig::Static { endpoints } => Ok(Box::new(static_list::StaticObserver::new(
            endpoints.clone(),
        )?)),
        ObserverConfig::File {
            path,
            poll_interval_secs,
        } => {
            if *poll_interval_secs == 0 {
                return Err(error::ObserverError::InvalidConfig(
                    "file observer poll_interval_secs must be positive".to_string(),
                ));
            }
            Ok(Box::new(file::FileObserver::new(
                path.clone(),
                Duration::from_secs(*poll_interval_secs),
            )))
        }
    }
}
