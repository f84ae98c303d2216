use crate::error::{ObserverError, Result};
use crate::{EndpointSpec, Observer};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use telemon_common::types::Endpoint;

#[derive(Debug, Deserialize)]
struct EndpointFile {
    #[serde(default)]
    endpoints: Vec<EndpointSpec>,
}

/// Re-reads an endpoint list from disk on every poll.
///
/// Files ending in `.toml` are parsed as TOML, anything else as JSON. Both
/// hold a top-level `endpoints` array of [`EndpointSpec`]s.
pub struct FileObserver {
    path: PathBuf,
    poll_interval: Duration,
}

impl FileObserver {
    pub fn new(path: PathBuf, poll_interval: Duration) -> Self {
        Self {
            path,
            poll_interval,
        }
    }

    fn parse(&self, content: &str) -> Result<EndpointFile> {
        let source_name = self.path.display().to_string();
        let is_toml = self
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            toml::from_str(content).map_err(|e| ObserverError::Parse {
                source_name,
                message: e.to_string(),
            })
        } else {
            serde_json::from_str(content).map_err(|e| ObserverError::Parse {
                source_name,
                message: e.to_string(),
            })
        }
    }
}

#[async_trait]
impl Observer for FileObserver {
    fn observer_type(&self) -> &str {
        "file"
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn discover(&mut self) -> Result<Vec<Endpoint>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let file = self.parse(&content)?;
        file.endpoints
            .into_iter()
            .map(|spec| spec.into_endpoint("file"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn reads_json_endpoint_list() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("endpoints.json");
        std::fs::write(
            &path,
            r#"{"endpoints":[{"host":"10.0.0.5","port":11211,"name":"cache","attributes":{"role":"memcached"}}]}"#,
        )?;

        let mut observer = FileObserver::new(path, Duration::from_secs(1));
        let endpoints = observer.discover().await?;
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].id.0, "file:10.0.0.5:11211");
        assert_eq!(endpoints[0].observer, "file");
        assert_eq!(endpoints[0].attribute("role").as_deref(), Some("memcached"));
        Ok(())
    }

    #[tokio::test]
    async fn reads_toml_endpoint_list() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("endpoints.toml");
        std::fs::write(
            &path,
            "[[endpoints]]\nid = \"web\"\nhost = \"web.local\"\nport = 80\n",
        )?;

        let mut observer = FileObserver::new(path, Duration::from_secs(1));
        let endpoints = observer.discover().await?;
        assert_eq!(endpoints[0].id.0, "file:web");
        assert_eq!(endpoints[0].port, Some(80));
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let mut observer =
            FileObserver::new(PathBuf::from("/nonexistent/endpoints.json"), Duration::from_secs(1));
        assert!(matches!(observer.discover().await, Err(ObserverError::Io(_))));
    }

    #[tokio::test]
    async fn malformed_json_reports_parse_error() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("endpoints.json");
        std::fs::write(&path, "{not json")?;

        let mut observer = FileObserver::new(path, Duration::from_secs(1));
        assert!(matches!(
            observer.discover().await,
            Err(ObserverError::Parse { .. })
        ));
        Ok(())
    }
}
