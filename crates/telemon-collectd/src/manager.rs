use crate::config::{render_config, CollectdSettings, ManagedInstance};
use crate::error::{CollectdError, Result};
use crate::reload::ReloadHook;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use telemon_common::types::{Datapoint, MonitorId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Receives the datapoints collectd reported for one monitor instance.
pub type DatapointRoute = Arc<dyn Fn(Vec<Datapoint>) + Send + Sync>;

/// Owns the set of collectd-backed instances and the generated file.
pub struct CollectdManager {
    settings: CollectdSettings,
    instances: BTreeMap<MonitorId, ManagedInstance>,
    reload: Box<dyn ReloadHook>,
}

impl CollectdManager {
    pub fn new(settings: CollectdSettings, reload: Box<dyn ReloadHook>) -> Self {
        Self {
            settings,
            instances: BTreeMap::new(),
            reload,
        }
    }

    pub fn render(&self) -> String {
        render_config(&self.settings, &self.instances)
    }

    pub fn config_path(&self) -> &Path {
        &self.settings.config_path
    }

    pub async fn upsert(&mut self, instance: ManagedInstance) -> Result<bool> {
        self.instances
            .insert(instance.monitor_id().clone(), instance);
        self.sync().await
    }

    pub async fn remove(&mut self, monitor_id: &MonitorId) -> Result<bool> {
        if self.instances.remove(monitor_id).is_none() {
            return Ok(false);
        }
        self.sync().await
    }

    /// Writes the rendered config if it differs from the file on disk and
    /// runs the reload hook. Returns whether anything was written.
    pub async fn sync(&mut self) -> Result<bool> {
        let rendered = self.render();
        let path = self.settings.config_path.clone();

        match tokio::fs::read_to_string(&path).await {
            Ok(current) if current == rendered => return Ok(false),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        write_atomic(path.clone(), rendered).await?;
        tracing::info!(
            path = %path.display(),
            instances = self.instances.len(),
            "collectd config written"
        );
        self.reload.reload(&path).await?;
        Ok(true)
    }
}

/// Replaces `path` with `content` so readers only ever see the old or the
/// new file: the data goes to a temporary file in the same directory,
/// which is then renamed over the target.
pub async fn write_atomic(path: PathBuf, content: String) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)?;
        Ok(())
    })
    .await
    .map_err(|e| CollectdError::Io(std::io::Error::other(e)))?
}

enum Command {
    Upsert(ManagedInstance, oneshot::Sender<Result<bool>>),
    Remove(MonitorId),
    Render(oneshot::Sender<String>),
}

/// Cloneable access to the collectd manager and the ingest routing table.
///
/// Config changes are applied by one background task in the order they
/// were requested, so a removal queued by an instance's shutdown always
/// lands before a later registration of the same monitor ID.
#[derive(Clone)]
pub struct CollectdHandle {
    commands: mpsc::UnboundedSender<Command>,
    routes: Arc<RwLock<HashMap<MonitorId, DatapointRoute>>>,
}

impl CollectdHandle {
    /// Starts the manager task. It runs until every handle is dropped.
    pub fn spawn(manager: CollectdManager) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_manager(manager, rx));
        (
            Self {
                commands: tx,
                routes: Arc::new(RwLock::new(HashMap::new())),
            },
            task,
        )
    }

    /// Adds (or replaces) an instance's config and routes its data to
    /// `route`. Resolves once the config file is written and reloaded.
    pub async fn register(&self, instance: ManagedInstance, route: DatapointRoute) -> Result<()> {
        let monitor_id = instance.monitor_id().clone();
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(monitor_id.clone(), route);

        let (reply_tx, reply_rx) = oneshot::channel();
        let result = match self.commands.send(Command::Upsert(instance, reply_tx)) {
            Ok(()) => reply_rx.await.unwrap_or(Err(CollectdError::ManagerStopped)),
            Err(_) => Err(CollectdError::ManagerStopped),
        };
        if let Err(e) = result {
            self.unregister(&monitor_id);
            return Err(e);
        }
        Ok(())
    }

    /// Stops routing data to the instance and queues removal of its config.
    /// Never blocks.
    pub fn unregister(&self, monitor_id: &MonitorId) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(monitor_id);
        if self.commands.send(Command::Remove(monitor_id.clone())).is_err() {
            tracing::warn!(monitor_id = %monitor_id, "collectd manager stopped, config not updated");
        }
    }

    pub fn route(&self, monitor_id: &MonitorId) -> Option<DatapointRoute> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(monitor_id)
            .cloned()
    }

    /// Returns the config text the manager would currently write.
    pub async fn rendered(&self) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Render(tx))
            .map_err(|_| CollectdError::ManagerStopped)?;
        rx.await.map_err(|_| CollectdError::ManagerStopped)
    }
}

async fn run_manager(mut manager: CollectdManager, mut rx: mpsc::UnboundedReceiver<Command>) {
    tracing::info!(path = %manager.config_path().display(), "collectd config manager started");
    while let Some(command) = rx.recv().await {
        match command {
            Command::Upsert(instance, reply) => {
                let monitor_id = instance.monitor_id().clone();
                let result = manager.upsert(instance).await;
                if let Err(e) = &result {
                    tracing::error!(monitor_id = %monitor_id, error = %e, "Failed to apply collectd config");
                }
                let _ = reply.send(result);
            }
            Command::Remove(monitor_id) => {
                if let Err(e) = manager.remove(&monitor_id).await {
                    tracing::error!(monitor_id = %monitor_id, error = %e, "Failed to remove collectd config");
                }
            }
            Command::Render(reply) => {
                let _ = reply.send(manager.render());
            }
        }
    }
    tracing::info!("collectd config manager stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reload::NoopReload;
    use crate::rules::FilterChain;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingReload(Arc<AtomicUsize>);

    #[async_trait]
    impl ReloadHook for CountingReload {
        async fn reload(&self, _config_path: &Path) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn instance(id: &str) -> ManagedInstance {
        ManagedInstance {
            filter: FilterChain {
                monitor_id: MonitorId::from(id),
                plugin: "memcached".into(),
                allow: None,
            },
            plugin_block: format!("<Instance \"{id}\">\n  Host \"127.0.0.1\"\n</Instance>"),
        }
    }

    fn settings(dir: &TempDir) -> CollectdSettings {
        CollectdSettings {
            config_path: dir.path().join("collectd").join("collectd.conf"),
            ..CollectdSettings::default()
        }
    }

    #[tokio::test]
    async fn unchanged_config_is_not_rewritten_or_reloaded() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let reloads = Arc::new(AtomicUsize::new(0));
        let mut manager =
            CollectdManager::new(settings(&dir), Box::new(CountingReload(reloads.clone())));

        assert!(manager.upsert(instance("m1")).await?);
        assert!(!manager.upsert(instance("m1")).await?);
        assert_eq!(reloads.load(Ordering::SeqCst), 1);

        let on_disk = std::fs::read_to_string(manager.config_path())?;
        assert_eq!(on_disk, manager.render());

        assert!(manager.remove(&MonitorId::from("m1")).await?);
        assert!(!manager.remove(&MonitorId::from("m1")).await?);
        assert_eq!(reloads.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("out.conf");
        write_atomic(path.clone(), "one\n".into()).await?;
        write_atomic(path.clone(), "two\n".into()).await?;
        assert_eq!(std::fs::read_to_string(&path)?, "two\n");
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn handle_applies_commands_in_order() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let manager = CollectdManager::new(settings(&dir), Box::new(NoopReload));
        let (handle, _task) = CollectdHandle::spawn(manager);

        let route: DatapointRoute = Arc::new(|_points| {});
        handle.register(instance("m1"), route.clone()).await?;
        assert!(handle.route(&MonitorId::from("m1")).is_some());

        // Stop then immediately start the same ID: the removal is queued
        // first, so the instance ends up present.
        handle.unregister(&MonitorId::from("m1"));
        assert!(handle.route(&MonitorId::from("m1")).is_none());
        handle.register(instance("m1"), route).await?;

        let rendered = handle.rendered().await?;
        assert!(rendered.contains("dispatch_m1"));
        let on_disk = std::fs::read_to_string(dir.path().join("collectd").join("collectd.conf"))?;
        assert_eq!(on_disk, rendered);
        Ok(())
    }
}
