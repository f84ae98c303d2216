use crate::error::Result;
use crate::{EndpointSpec, Observer};
use async_trait::async_trait;
use std::time::Duration;
use telemon_common::types::Endpoint;

/// Serves a fixed list of endpoints from the agent config.
///
/// The list only changes on a config reload, which rebuilds the observer,
/// so one discovery round is enough and later polls are cheap clones.
pub struct StaticObserver {
    endpoints: Vec<Endpoint>,
}

impl StaticObserver {
    pub fn new(specs: Vec<EndpointSpec>) -> Result<Self> {
        let endpoints = specs
            .into_iter()
            .map(|spec| spec.into_endpoint("static"))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { endpoints })
    }
}

#[async_trait]
impl Observer for StaticObserver {
    fn observer_type(&self) -> &str {
        "static"
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn discover(&mut self) -> Result<Vec<Endpoint>> {
        Ok(self.endpoints.clone())
    }
}
