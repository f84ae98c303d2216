//! Converges running monitor instances to the desired set.
//!
//! The desired set is derived from the monitor entries and the currently
//! known endpoints. Every desired instance is keyed by its
//! [`ConfigIdentity`]; a key moves `Absent -> Starting -> Running` and back
//! to `Absent` when it stops being desired. A changed config or endpoint
//! yields a different identity, which is a stop of the old key plus a start
//! of the new one.
//!
//! `configure` calls run in a [`JoinSet`] so slow starts never hold up other
//! keys. Stopping is synchronous (`shutdown` must not block), so a key is
//! fully gone before it can be started again.

use crate::config::{ConfigIdentity, EffectiveConfig, MonitorConfig};
use crate::error::MonitorError;
use crate::merge::merge;
use crate::output::{Output, OutputSink};
use crate::registry::{MonitorContext, MonitorRegistry};
use crate::Monitor;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use telemon_collectd::CollectdHandle;
use telemon_common::types::{Endpoint, EndpointId};
use telemon_observer::EndpointEvent;
use tokio::sync::mpsc;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Input to a running [`Reconciler`].
#[derive(Debug, Clone)]
pub enum ReconcilerEvent {
    Endpoint(EndpointEvent),
    /// A full set of monitor entries, replacing the previous one.
    Config {
        monitors: Vec<MonitorConfig>,
        default_interval: Duration,
    },
}

/// Transitions issued by one reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub started: usize,
    pub stopped: usize,
}

/// Services injected into every instance the reconciler creates.
#[derive(Clone)]
pub struct Services {
    pub sink: OutputSink,
    pub collectd: Option<CollectdHandle>,
}

enum Slot {
    Starting {
        generation: u64,
        /// Cleared when the key stops being desired mid-start; the instance
        /// is shut down as soon as its `configure` returns.
        wanted: bool,
        config: Arc<EffectiveConfig>,
    },
    Running {
        monitor: Box<dyn Monitor>,
        config: Arc<EffectiveConfig>,
    },
}

/// Which monitor entry and endpoint produced a desired instance.
type BindingKey = (usize, Option<EndpointId>);

enum Binding {
    Desired(Arc<EffectiveConfig>),
    /// Merge or validation failed; already reported.
    Rejected,
}

type StartResult = (ConfigIdentity, u64, anyhow::Result<Box<dyn Monitor>>);

pub struct Reconciler {
    registry: Arc<MonitorRegistry>,
    services: Services,
    monitors: Vec<MonitorConfig>,
    default_interval: Duration,
    endpoints: BTreeMap<EndpointId, Endpoint>,
    bindings: BTreeMap<BindingKey, Binding>,
    slots: HashMap<ConfigIdentity, Slot>,
    /// Keys whose last start failed. They are not retried until the entry or
    /// endpoint that produced them is seen again.
    failed: HashSet<ConfigIdentity>,
    starts: JoinSet<StartResult>,
    start_tasks: HashMap<Id, (ConfigIdentity, u64)>,
    next_generation: u64,
}

impl Reconciler {
    pub fn new(registry: Arc<MonitorRegistry>, services: Services) -> Self {
        Self {
            registry,
            services,
            monitors: Vec::new(),
            default_interval: Duration::from_secs(10),
            endpoints: BTreeMap::new(),
            bindings: BTreeMap::new(),
            slots: HashMap::new(),
            failed: HashSet::new(),
            starts: JoinSet::new(),
            start_tasks: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Replaces the monitor entries and reconciles. Instances whose identity
    /// survives the change keep running untouched.
    pub fn apply_config(
        &mut self,
        monitors: Vec<MonitorConfig>,
        default_interval: Duration,
    ) -> ReconcileStats {
        self.monitors = self.registry.retain_known(monitors);
        self.default_interval = default_interval;
        self.bindings.clear();
        self.failed.clear();
        let endpoints: Vec<Endpoint> = self.endpoints.values().cloned().collect();
        for index in 0..self.monitors.len() {
            self.bind_unbound(index);
            for endpoint in &endpoints {
                self.bind_endpoint(index, endpoint);
            }
        }
        tracing::info!(monitors = self.monitors.len(), "Monitor config applied");
        self.reconcile()
    }

    pub fn apply_endpoint_event(&mut self, event: EndpointEvent) -> ReconcileStats {
        match event {
            EndpointEvent::Appeared(endpoint) => {
                tracing::debug!(endpoint_id = %endpoint.id, host = %endpoint.host, "Endpoint appeared");
                self.forget_endpoint(&endpoint.id);
                for index in 0..self.monitors.len() {
                    self.bind_endpoint(index, &endpoint);
                }
                self.endpoints.insert(endpoint.id.clone(), endpoint);
            }
            EndpointEvent::Vanished(id) => {
                tracing::debug!(endpoint_id = %id, "Endpoint vanished");
                self.forget_endpoint(&id);
                self.endpoints.remove(&id);
            }
        }
        self.reconcile()
    }

    pub fn handle_event(&mut self, event: ReconcilerEvent) -> ReconcileStats {
        match event {
            ReconcilerEvent::Endpoint(event) => self.apply_endpoint_event(event),
            ReconcilerEvent::Config {
                monitors,
                default_interval,
            } => self.apply_config(monitors, default_interval),
        }
    }

    fn forget_endpoint(&mut self, id: &EndpointId) {
        self.bindings
            .retain(|(_, endpoint_id), _| endpoint_id.as_ref() != Some(id));
    }

    /// Binds a monitor entry that runs without an endpoint: types that do
    /// not accept endpoints, and endpoint types configured with an explicit
    /// `host` and no discovery rule.
    fn bind_unbound(&mut self, index: usize) {
        let config = &self.monitors[index];
        if config.common.disabled {
            return;
        }
        let Ok(plugin) = self.registry.lookup(config.monitor_type()) else {
            return;
        };
        let unbound = !plugin.accepts_endpoints()
            || (config.common.discovery_rule.is_empty() && config.fields.contains_key("host"));
        if unbound {
            self.bind(index, None);
        }
    }

    /// Binds a monitor entry to an endpoint if the entry accepts endpoints
    /// and its discovery rule matches. An entry without a rule and without a
    /// static `host` matches every endpoint.
    fn bind_endpoint(&mut self, index: usize, endpoint: &Endpoint) {
        let config = &self.monitors[index];
        if config.common.disabled {
            return;
        }
        let Ok(plugin) = self.registry.lookup(config.monitor_type()) else {
            return;
        };
        if !plugin.accepts_endpoints() {
            return;
        }
        let matched = if config.common.discovery_rule.is_empty() {
            !config.fields.contains_key("host")
        } else {
            config.common.matches(endpoint)
        };
        if matched {
            self.bind(index, Some(endpoint));
        }
    }

    fn bind(&mut self, index: usize, endpoint: Option<&Endpoint>) {
        let config = &self.monitors[index];
        let key = (index, endpoint.map(|e| e.id.clone()));
        let binding = match self
            .registry
            .lookup(config.monitor_type())
            .map_err(MonitorError::from)
            .and_then(|plugin| merge(plugin, config, endpoint, self.default_interval))
        {
            Ok(effective) => {
                // Seeing the producing entry or endpoint again re-arms a
                // failed key.
                self.failed.remove(&effective.identity);
                Binding::Desired(Arc::new(effective))
            }
            Err(e) => {
                tracing::error!(
                    monitor_type = %config.monitor_type(),
                    endpoint_id = ?endpoint.map(|e| &e.id),
                    error = %e,
                    "Monitor config rejected"
                );
                Binding::Rejected
            }
        };
        self.bindings.insert(key, binding);
    }

    /// The desired set, deduplicated by identity.
    fn desired(&self) -> HashMap<ConfigIdentity, Arc<EffectiveConfig>> {
        let mut desired = HashMap::new();
        for binding in self.bindings.values() {
            if let Binding::Desired(config) = binding {
                desired
                    .entry(config.identity.clone())
                    .or_insert_with(|| config.clone());
            }
        }
        desired
    }

    /// Diffs the desired set against the slot table and issues the starts
    /// and stops needed to converge.
    pub fn reconcile(&mut self) -> ReconcileStats {
        let desired = self.desired();
        let mut stats = ReconcileStats::default();

        self.failed.retain(|identity| desired.contains_key(identity));

        let stale: Vec<ConfigIdentity> = self
            .slots
            .keys()
            .filter(|identity| !desired.contains_key(*identity))
            .cloned()
            .collect();
        for identity in stale {
            if self.stop(&identity) {
                stats.stopped += 1;
            }
        }

        for (identity, config) in desired {
            match self.slots.get_mut(&identity) {
                Some(Slot::Starting { wanted, .. }) => *wanted = true,
                Some(Slot::Running { .. }) => {}
                None if self.failed.contains(&identity) => {}
                None => {
                    self.start(config);
                    stats.started += 1;
                }
            }
        }

        if stats != ReconcileStats::default() {
            tracing::debug!(
                started = stats.started,
                stopped = stats.stopped,
                instances = self.slots.len(),
                "Reconciled"
            );
        }
        stats
    }

    fn start(&mut self, config: Arc<EffectiveConfig>) {
        let Ok(plugin) = self.registry.lookup(config.monitor_type()) else {
            return;
        };
        let output = Output::for_instance(
            self.services.sink.clone(),
            &config,
            !plugin.filters_metrics(),
        );
        let mut monitor = plugin.create_monitor(MonitorContext {
            output,
            collectd: self.services.collectd.clone(),
        });

        let generation = self.next_generation;
        self.next_generation += 1;
        let identity = config.identity.clone();

        tracing::info!(
            monitor_type = %config.monitor_type(),
            monitor_id = %config.monitor_id,
            endpoint_id = ?config.endpoint.as_ref().map(|e| &e.id),
            "Starting monitor"
        );

        let task_config = config.clone();
        let task_identity = identity.clone();
        let handle = self.starts.spawn(async move {
            let result = monitor.configure(&task_config).await.map(|()| monitor);
            (task_identity, generation, result)
        });
        self.start_tasks
            .insert(handle.id(), (identity.clone(), generation));
        self.slots.insert(
            identity,
            Slot::Starting {
                generation,
                wanted: true,
                config,
            },
        );
    }

    /// Stops a key. Returns true if a running instance was shut down.
    fn stop(&mut self, identity: &ConfigIdentity) -> bool {
        match self.slots.get_mut(identity) {
            Some(Slot::Starting { wanted, .. }) => {
                *wanted = false;
                false
            }
            Some(Slot::Running { .. }) => {
                if let Some(Slot::Running {
                    mut monitor,
                    config,
                }) = self.slots.remove(identity)
                {
                    tracing::info!(
                        monitor_type = %config.monitor_type(),
                        monitor_id = %config.monitor_id,
                        "Stopping monitor"
                    );
                    monitor.shutdown();
                }
                true
            }
            None => false,
        }
    }

    fn finish_start(&mut self, joined: Result<(Id, StartResult), JoinError>) {
        let (identity, generation, result) = match joined {
            Ok((id, outcome)) => {
                self.start_tasks.remove(&id);
                outcome
            }
            Err(e) => {
                let Some((identity, generation)) = self.start_tasks.remove(&e.id()) else {
                    return;
                };
                let reason = if e.is_panic() {
                    anyhow::anyhow!("configure panicked")
                } else {
                    anyhow::anyhow!("configure cancelled")
                };
                (identity, generation, Err(reason))
            }
        };

        let Some(Slot::Starting {
            generation: current,
            wanted,
            ..
        }) = self.slots.get(&identity)
        else {
            return;
        };
        if *current != generation {
            return;
        }
        let wanted = *wanted;
        let Some(Slot::Starting { config, .. }) = self.slots.remove(&identity) else {
            return;
        };

        match result {
            Ok(monitor) if wanted => {
                tracing::info!(
                    monitor_type = %config.monitor_type(),
                    monitor_id = %config.monitor_id,
                    "Monitor running"
                );
                self.slots
                    .insert(identity, Slot::Running { monitor, config });
            }
            Ok(mut monitor) => {
                tracing::info!(
                    monitor_id = %config.monitor_id,
                    "Monitor no longer wanted after start, shutting down"
                );
                monitor.shutdown();
            }
            Err(reason) => {
                let e = MonitorError::Configure {
                    monitor_type: config.monitor_type().to_string(),
                    reason,
                };
                tracing::error!(
                    monitor_id = %config.monitor_id,
                    endpoint_id = ?config.endpoint.as_ref().map(|e| &e.id),
                    error = %e,
                    "Monitor failed to start"
                );
                if wanted {
                    self.failed.insert(identity);
                }
            }
        }
    }

    /// Waits for every outstanding `configure` call to finish.
    pub async fn settle(&mut self) {
        while let Some(joined) = self.starts.join_next_with_id().await {
            self.finish_start(joined);
        }
    }

    /// Number of instances whose `configure` succeeded and that are still
    /// desired.
    pub fn running_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Running { .. }))
            .count()
    }

    pub fn pending_starts(&self) -> usize {
        self.starts.len()
    }

    /// Effective configs of running instances, ordered by monitor ID.
    pub fn running(&self) -> Vec<Arc<EffectiveConfig>> {
        let mut running: Vec<Arc<EffectiveConfig>> = self
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Running { config, .. } => Some(config.clone()),
                Slot::Starting { .. } => None,
            })
            .collect();
        running.sort_by(|a, b| a.monitor_id.cmp(&b.monitor_id));
        running
    }

    /// Shuts down every instance and abandons starts still in flight.
    pub async fn shutdown(&mut self) {
        self.starts.abort_all();
        self.settle().await;
        let identities: Vec<ConfigIdentity> = self.slots.keys().cloned().collect();
        for identity in identities {
            self.stop(&identity);
        }
        self.slots.clear();
        tracing::info!("All monitors stopped");
    }

    /// Processes events until the channel closes or `cancel` fires, then
    /// shuts every instance down.
    pub async fn run(mut self, mut events: mpsc::Receiver<ReconcilerEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = self.starts.join_next_with_id(), if !self.starts.is_empty() => {
                    self.finish_start(joined);
                }
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle_event(event);
                    }
                    None => break,
                },
            }
        }
        self.shutdown().await;
    }
}
