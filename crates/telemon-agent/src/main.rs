mod config;
mod logging;
mod reload;
mod writer;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use telemon_collectd::reload::build_reload_hook;
use telemon_collectd::{ingest, CollectdHandle, CollectdManager, CollectdSettings};
use telemon_monitor::output::OutputSink;
use telemon_monitor::reconciler::{Reconciler, ReconcilerEvent, Services};
use telemon_monitor::registry::MonitorRegistry;
use telemon_observer::build_observer;
use telemon_observer::feed::EndpointFeed;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_QUEUE: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

struct Collectd {
    handle: CollectdHandle,
    manager_task: JoinHandle<()>,
    ingest_task: JoinHandle<()>,
}

/// Writes the initial collectd config and starts the manager and the
/// `write_http` ingest listener.
async fn start_collectd(mut settings: CollectdSettings, hostname: &str, cancel: CancellationToken) -> Result<Collectd> {
    settings.hostname.get_or_insert_with(|| hostname.to_string());
    let addr = tokio::net::lookup_host((settings.listen_host.as_str(), settings.listen_port))
        .await
        .with_context(|| format!("resolving collectd listen address {}", settings.listen_host))?
        .next()
        .with_context(|| format!("no address for {}", settings.listen_host))?;

    let reload = build_reload_hook(settings.reload_command.as_deref());
    let mut manager = CollectdManager::new(settings, reload);
    manager.sync().await.context("writing initial collectd config")?;
    tracing::info!(path = %manager.config_path().display(), "collectd config initialised");

    let (handle, manager_task) = CollectdHandle::spawn(manager);
    let ingest_handle = handle.clone();
    let ingest_task = tokio::spawn(async move {
        if let Err(e) = ingest::serve(addr, ingest_handle, cancel).await {
            tracing::error!(error = %e, "collectd ingest listener failed");
        }
    });

    Ok(Collectd {
        handle,
        manager_task,
        ingest_task,
    })
}

async fn shutdown_signal() {
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to register SIGTERM handler");
                std::future::pending::<()>().await
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("SIGINT received, shutting down"),
        _ = terminate => tracing::info!("SIGTERM received, shutting down"),
    }
}

async fn join(name: &str, task: JoinHandle<()>) {
    match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
        Ok(Ok(())) => tracing::debug!(task = name, "Task stopped"),
        Ok(Err(e)) => tracing::error!(task = name, error = %e, "Task failed"),
        Err(_) => tracing::warn!(task = name, "Task did not stop in time"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/agent.toml".to_string());

    let config = config::AgentConfig::load(&config_path)?;
    logging::init(&config.logging)?;

    let hostname = config.resolved_hostname();
    tracing::info!(%hostname, config = %config_path, "telemon-agent starting");

    let mut registry = MonitorRegistry::new();
    telemon_collector::register_builtin(&mut registry).context("registering built-in monitor types")?;
    tracing::info!(types = ?registry.monitor_types(), "Monitor types registered");

    let observers = config
        .observers
        .iter()
        .map(build_observer)
        .collect::<Result<Vec<_>, _>>()
        .context("building observers")?;

    let cancel = CancellationToken::new();
    // Stopped last so output from monitors shutting down still gets flushed.
    let writer_cancel = CancellationToken::new();

    let (sink, output_rx) = OutputSink::channel();
    let writer = writer::BackendWriter::new(config.writer.clone(), hostname.clone())?;
    let writer_task = tokio::spawn(writer.run(output_rx, writer_cancel.clone()));

    let collectd = match config.collectd.clone() {
        Some(settings) => Some(start_collectd(settings, &hostname, cancel.clone()).await?),
        None => None,
    };

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    events_tx
        .send(ReconcilerEvent::Config {
            monitors: config.monitor_configs(),
            default_interval: config.default_interval(),
        })
        .await
        .context("queueing initial monitor set")?;

    let services = Services {
        sink,
        collectd: collectd.as_ref().map(|c| c.handle.clone()),
    };
    let reconciler = Reconciler::new(Arc::new(registry), services);
    let reconciler_task = tokio::spawn(reconciler.run(events_rx, cancel.clone()));

    tracing::info!(observers = observers.len(), "Starting endpoint feed");
    let mut feed = EndpointFeed::new(observers).subscribe(cancel.clone());
    let feed_tx = events_tx.clone();
    let feed_task = tokio::spawn(async move {
        while let Some(event) = feed.next().await {
            if feed_tx.send(ReconcilerEvent::Endpoint(event)).await.is_err() {
                break;
            }
        }
    });

    let watcher = reload::ConfigWatcher::new(&config_path, config.clone());
    let reload_task = tokio::spawn(reload::watch(
        watcher,
        Duration::from_secs(config.reload_poll_secs),
        events_tx,
        cancel.clone(),
    ));

    shutdown_signal().await;
    cancel.cancel();

    join("reconciler", reconciler_task).await;
    join("endpoint feed", feed_task).await;
    join("config watcher", reload_task).await;
    if let Some(Collectd {
        handle,
        manager_task,
        ingest_task,
    }) = collectd
    {
        join("collectd ingest", ingest_task).await;
        // The manager exits once its last handle is gone.
        drop(handle);
        join("collectd manager", manager_task).await;
    }

    writer_cancel.cancel();
    join("backend writer", writer_task).await;

    tracing::info!("telemon-agent stopped");
    Ok(())
}
