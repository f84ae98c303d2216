use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use telemon_monitor::reconciler::ReconcilerEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;

/// Re-reads the agent config file and turns it into a new monitor set.
pub struct ConfigWatcher {
    path: PathBuf,
    current: AgentConfig,
    modified: Option<SystemTime>,
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>, current: AgentConfig) -> Self {
        let path = path.into();
        Self {
            modified: modified_at(&path),
            path,
            current,
        }
    }

    /// Reloads only if the file's modification time moved.
    pub fn poll(&mut self) -> Option<ReconcilerEvent> {
        let modified = modified_at(&self.path);
        if modified == self.modified {
            return None;
        }
        self.modified = modified;
        tracing::info!(path = %self.path.display(), "Config file changed");
        self.reload()
    }

    /// Loads the file; on failure the previous config stays active.
    pub fn reload(&mut self) -> Option<ReconcilerEvent> {
        let config = match AgentConfig::load(&self.path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "Config reload failed, keeping previous config");
                return None;
            }
        };
        let ignored = self.current.restart_only_changes(&config);
        if !ignored.is_empty() {
            tracing::warn!(sections = ?ignored, "Changed sections take effect after a restart");
        }
        let event = ReconcilerEvent::Config {
            monitors: config.monitor_configs(),
            default_interval: config.default_interval(),
        };
        tracing::info!(monitors = config.monitors.len(), "Config reloaded");
        self.current = config;
        Some(event)
    }
}

/// Sends a new monitor set whenever SIGHUP arrives or, when `poll_every` is
/// non-zero, the config file's mtime changes.
pub async fn watch(
    mut watcher: ConfigWatcher,
    poll_every: Duration,
    events: mpsc::Sender<ReconcilerEvent>,
    cancel: CancellationToken,
) {
    #[cfg(unix)]
    let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(signal) => Some(signal),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to register SIGHUP handler");
            None
        }
    };
    let mut poll = (!poll_every.is_zero()).then(|| {
        let mut tick = tokio::time::interval(poll_every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick
    });

    loop {
        let sighup = async {
            #[cfg(unix)]
            if let Some(signal) = hangup.as_mut() {
                signal.recv().await;
                return;
            }
            std::future::pending::<()>().await
        };
        let poll_tick = async {
            match poll.as_mut() {
                Some(tick) => {
                    tick.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sighup => {
                tracing::info!("SIGHUP received, reloading config");
                watcher.reload()
            }
            _ = poll_tick => watcher.poll(),
        };
        if let Some(event) = event {
            if events.send(event).await.is_err() {
                break;
            }
        }
    }
}
