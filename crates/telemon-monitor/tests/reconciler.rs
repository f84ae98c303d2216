use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telemon_common::types::{Endpoint, EndpointId, MonitorId};
use telemon_monitor::config::{EffectiveConfig, MonitorConfig};
use telemon_monitor::output::{OutputMessage, OutputSink};
use telemon_monitor::reconciler::{ReconcileStats, Reconciler, ReconcilerEvent, Services};
use telemon_monitor::registry::{MonitorContext, MonitorPlugin, MonitorRegistry};
use telemon_monitor::Monitor;
use telemon_observer::EndpointEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Configure(MonitorId),
    Shutdown(MonitorId),
}

/// Records every lifecycle call and how many instances are live per ID.
#[derive(Default)]
struct Journal {
    calls: Vec<Call>,
    live: HashMap<MonitorId, usize>,
    max_live: usize,
}

type SharedJournal = Arc<Mutex<Journal>>;

struct RecordingMonitor {
    journal: SharedJournal,
    context: MonitorContext,
    monitor_id: Option<MonitorId>,
}

#[async_trait]
impl Monitor for RecordingMonitor {
    async fn configure(&mut self, config: &EffectiveConfig) -> anyhow::Result<()> {
        if let Some(ms) = config.fields.get("delay_ms").and_then(|v| v.as_u64()) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        let id = config.monitor_id.clone();
        {
            let mut journal = self.journal.lock().unwrap();
            journal.calls.push(Call::Configure(id.clone()));
            if config.fields.get("fail") == Some(&json!(true)) {
                anyhow::bail!("refusing to start");
            }
            let live = journal.live.entry(id.clone()).or_default();
            *live += 1;
            let live = *live;
            journal.max_live = journal.max_live.max(live);
        }
        self.context
            .output
            .send_datapoint(telemon_common::types::Datapoint::gauge("fake.up", 1.0));
        self.monitor_id = Some(id);
        Ok(())
    }

    fn shutdown(&mut self) {
        let id = self.monitor_id.take().expect("shutdown before configure");
        let mut journal = self.journal.lock().unwrap();
        journal.calls.push(Call::Shutdown(id.clone()));
        if let Some(live) = journal.live.get_mut(&id) {
            *live -= 1;
        }
    }
}

struct RecordingPlugin {
    name: &'static str,
    accepts_endpoints: bool,
    journal: SharedJournal,
}

impl MonitorPlugin for RecordingPlugin {
    fn monitor_type(&self) -> &str {
        self.name
    }

    fn accepts_endpoints(&self) -> bool {
        self.accepts_endpoints
    }

    fn create_monitor(&self, context: MonitorContext) -> Box<dyn Monitor> {
        Box::new(RecordingMonitor {
            journal: self.journal.clone(),
            context,
            monitor_id: None,
        })
    }
}

struct Harness {
    reconciler: Reconciler,
    journal: SharedJournal,
    output: mpsc::UnboundedReceiver<OutputMessage>,
}

impl Harness {
    fn new() -> Self {
        let journal = SharedJournal::default();
        let mut registry = MonitorRegistry::new();
        for (name, accepts_endpoints) in [("http", true), ("cpu", false)] {
            registry
                .register(Box::new(RecordingPlugin {
                    name,
                    accepts_endpoints,
                    journal: journal.clone(),
                }))
                .unwrap();
        }
        let (sink, output) = OutputSink::channel();
        let reconciler = Reconciler::new(
            Arc::new(registry),
            Services {
                sink,
                collectd: None,
            },
        );
        Self {
            reconciler,
            journal,
            output,
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.journal.lock().unwrap().calls.clone()
    }

    fn configures(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Configure(_)))
            .count()
    }

    fn max_live(&self) -> usize {
        self.journal.lock().unwrap().max_live
    }
}

fn e1() -> Endpoint {
    Endpoint::new("static:e1", "a", Some(1), "web")
}

fn appeared(endpoint: Endpoint) -> EndpointEvent {
    EndpointEvent::Appeared(endpoint)
}

fn vanished(id: &str) -> EndpointEvent {
    EndpointEvent::Vanished(EndpointId::from(id))
}

#[tokio::test]
async fn endpoint_appear_and_vanish_binds_one_instance() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let stats = h
        .reconciler
        .apply_config(vec![MonitorConfig::new("http"), MonitorConfig::new("cpu")], INTERVAL);
    assert_eq!(stats.started, 1, "only the host-wide monitor starts without endpoints");
    h.reconciler.settle().await;

    let stats = h.reconciler.apply_endpoint_event(appeared(e1()));
    assert_eq!(stats, ReconcileStats { started: 1, stopped: 0 });
    h.reconciler.settle().await;
    assert_eq!(h.reconciler.running_count(), 2);

    let bound = h
        .reconciler
        .running()
        .into_iter()
        .find(|c| c.monitor_type() == "http")
        .expect("http instance running");
    assert_eq!(bound.endpoint.as_ref().map(|e| e.id.clone()), Some(EndpointId::from("static:e1")));
    assert_eq!(bound.fields["host"], json!("a"));
    assert_eq!(bound.fields["port"], json!(1));
    let http_id = bound.monitor_id.clone();

    let stats = h.reconciler.apply_endpoint_event(vanished("static:e1"));
    assert_eq!(stats, ReconcileStats { started: 0, stopped: 1 });
    assert_eq!(h.reconciler.running_count(), 1);
    assert_eq!(h.calls().last(), Some(&Call::Shutdown(http_id)));
    assert_eq!(h.configures(), 2);

    let mut datapoints = 0;
    while let Ok(OutputMessage::Datapoint(dp)) = h.output.try_recv() {
        assert!(dp.dimensions.contains_key("monitor_id"));
        datapoints += 1;
    }
    assert_eq!(datapoints, 2);
    Ok(())
}

#[tokio::test]
async fn unknown_type_does_not_stop_other_monitors() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let stats = h.reconciler.apply_config(
        vec![MonitorConfig::new("nonexistent"), MonitorConfig::new("cpu")],
        INTERVAL,
    );
    assert_eq!(stats.started, 1);
    h.reconciler.settle().await;
    let running = h.reconciler.running();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].monitor_type(), "cpu");
    Ok(())
}

#[tokio::test]
async fn reconciling_the_same_desired_set_twice_is_a_no_op() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let config = vec![MonitorConfig::new("http"), MonitorConfig::new("cpu")];
    h.reconciler.apply_config(config.clone(), INTERVAL);
    h.reconciler.apply_endpoint_event(appeared(e1()));
    h.reconciler.settle().await;

    assert_eq!(h.reconciler.apply_config(config, INTERVAL), ReconcileStats::default());
    assert_eq!(h.reconciler.apply_endpoint_event(appeared(e1())), ReconcileStats::default());
    assert_eq!(h.reconciler.reconcile(), ReconcileStats::default());
    h.reconciler.settle().await;
    assert_eq!(h.configures(), 2);
    Ok(())
}

#[tokio::test]
async fn reload_restarts_only_changed_monitors() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let a = MonitorConfig::new("cpu").with_field("percpu", true);
    let b = MonitorConfig::new("cpu").with_field("percpu", false);
    h.reconciler.apply_config(vec![a.clone(), b], INTERVAL);
    h.reconciler.settle().await;
    let before: Vec<MonitorId> = h.reconciler.running().iter().map(|c| c.monitor_id.clone()).collect();
    assert_eq!(before.len(), 2);

    let b_changed = MonitorConfig::new("cpu")
        .with_field("percpu", false)
        .with_field("report_per_core", true);
    let stats = h.reconciler.apply_config(vec![a.clone(), b_changed], INTERVAL);
    assert_eq!(stats, ReconcileStats { started: 1, stopped: 1 });
    h.reconciler.settle().await;

    let a_id = h
        .reconciler
        .running()
        .into_iter()
        .find(|c| c.fields.get("report_per_core").is_none())
        .map(|c| c.monitor_id.clone())
        .expect("a still running");
    assert!(before.contains(&a_id));
    let a_configures = h
        .calls()
        .iter()
        .filter(|c| **c == Call::Configure(a_id.clone()))
        .count();
    assert_eq!(a_configures, 1, "unchanged monitor was not restarted");
    assert!(!h.calls().contains(&Call::Shutdown(a_id)));
    Ok(())
}

#[tokio::test]
async fn endpoint_change_is_stop_old_then_start_new() -> anyhow::Result<()> {
    let mut h = Harness::new();
    h.reconciler.apply_config(vec![MonitorConfig::new("http")], INTERVAL);
    h.reconciler.apply_endpoint_event(appeared(e1()));
    h.reconciler.settle().await;

    let mut moved = e1();
    moved.port = Some(2);
    let stats = h.reconciler.apply_endpoint_event(appeared(moved));
    assert_eq!(stats, ReconcileStats { started: 1, stopped: 1 });
    h.reconciler.settle().await;

    let running = h.reconciler.running();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].fields["port"], json!(2));
    assert!(matches!(h.calls()[1], Call::Shutdown(_)));
    Ok(())
}

#[tokio::test]
async fn failed_start_is_not_retried_until_its_trigger_recurs() -> anyhow::Result<()> {
    let mut h = Harness::new();
    let config = vec![
        MonitorConfig::new("http").with_field("fail", true),
        MonitorConfig::new("cpu"),
    ];
    h.reconciler.apply_config(config.clone(), INTERVAL);
    h.reconciler.apply_endpoint_event(appeared(e1()));
    h.reconciler.settle().await;
    assert_eq!(h.reconciler.running_count(), 1);
    assert_eq!(h.configures(), 2);

    // Unrelated endpoint churn does not retry the failed key.
    let other = Endpoint::new("static:e2", "b", Some(2), "api");
    h.reconciler.apply_endpoint_event(appeared(other));
    h.reconciler.apply_endpoint_event(vanished("static:e2"));
    h.reconciler.settle().await;
    let failed_for_e1 = h.configures();

    // The triggering endpoint reappearing does.
    h.reconciler.apply_endpoint_event(appeared(e1()));
    h.reconciler.settle().await;
    assert_eq!(h.configures(), failed_for_e1 + 1);

    // So does a config reload.
    h.reconciler.apply_config(config, INTERVAL);
    h.reconciler.settle().await;
    assert_eq!(h.configures(), failed_for_e1 + 2);
    assert_eq!(h.reconciler.running_count(), 1);
    Ok(())
}

#[tokio::test]
async fn vanish_during_start_shuts_down_after_configure() -> anyhow::Result<()> {
    let mut h = Harness::new();
    h.reconciler
        .apply_config(vec![MonitorConfig::new("http").with_field("delay_ms", 30)], INTERVAL);
    h.reconciler.apply_endpoint_event(appeared(e1()));
    assert_eq!(h.reconciler.pending_starts(), 1);

    h.reconciler.apply_endpoint_event(vanished("static:e1"));
    // Reappearing while the first start is in flight must not start twice.
    let stats = h.reconciler.apply_endpoint_event(appeared(e1()));
    assert_eq!(stats.started, 0);
    h.reconciler.apply_endpoint_event(vanished("static:e1"));

    h.reconciler.settle().await;
    assert_eq!(h.reconciler.running_count(), 0);
    let calls = h.calls();
    assert_eq!(calls.len(), 2);
    assert!(matches!(calls[0], Call::Configure(_)));
    assert!(matches!(calls[1], Call::Shutdown(_)));
    Ok(())
}

#[tokio::test]
async fn churn_never_runs_two_instances_of_one_identity() -> anyhow::Result<()> {
    let mut h = Harness::new();
    h.reconciler
        .apply_config(vec![MonitorConfig::new("http").with_field("delay_ms", 2)], INTERVAL);

    let endpoints = [
        Endpoint::new("static:e1", "a", Some(1), "web"),
        Endpoint::new("static:e2", "b", Some(2), "api"),
        // Same content as e1 under another ID: deduplicated by identity.
        Endpoint::new("static:e3", "a", Some(1), "web"),
    ];
    for round in 0..40usize {
        let endpoint = endpoints[round % endpoints.len()].clone();
        if round % 3 == 0 {
            h.reconciler.apply_endpoint_event(vanished(&endpoint.id.0));
        } else {
            h.reconciler.apply_endpoint_event(appeared(endpoint));
        }
        if round % 7 == 0 {
            h.reconciler.settle().await;
        }
        assert!(h.reconciler.running_count() <= 2);
    }
    h.reconciler.settle().await;
    assert!(h.max_live() <= 1);

    h.reconciler.shutdown().await;
    let journal = h.journal.lock().unwrap();
    assert!(journal.live.values().all(|n| *n == 0), "every started instance was shut down");
    Ok(())
}

#[tokio::test]
async fn run_loop_processes_events_and_shuts_down_on_cancel() -> anyhow::Result<()> {
    let h = Harness::new();
    let journal = h.journal.clone();
    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(h.reconciler.run(rx, cancel.clone()));

    tx.send(ReconcilerEvent::Config {
        monitors: vec![MonitorConfig::new("http"), MonitorConfig::new("cpu")],
        default_interval: INTERVAL,
    })
    .await?;
    tx.send(ReconcilerEvent::Endpoint(appeared(e1()))).await?;

    let mut output = h.output;
    let mut up = 0;
    while up < 2 {
        match tokio::time::timeout(Duration::from_secs(5), output.recv()).await? {
            Some(OutputMessage::Datapoint(_)) => up += 1,
            Some(_) => {}
            None => anyhow::bail!("output closed"),
        }
    }

    cancel.cancel();
    task.await?;
    let journal = journal.lock().unwrap();
    let shutdowns = journal
        .calls
        .iter()
        .filter(|c| matches!(c, Call::Shutdown(_)))
        .count();
    assert_eq!(shutdowns, 2);
    Ok(())
}

#[tokio::test]
async fn slow_configure_does_not_hold_up_other_monitors() -> anyhow::Result<()> {
    let h = Harness::new();
    let journal = h.journal.clone();
    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(h.reconciler.run(rx, cancel.clone()));

    tx.send(ReconcilerEvent::Config {
        monitors: vec![
            MonitorConfig::new("http").with_field("delay_ms", 600_000),
            MonitorConfig::new("cpu"),
        ],
        default_interval: INTERVAL,
    })
    .await?;
    tx.send(ReconcilerEvent::Endpoint(appeared(e1()))).await?;

    let mut output = h.output;
    let first = loop {
        match tokio::time::timeout(Duration::from_secs(5), output.recv()).await? {
            Some(OutputMessage::Datapoint(dp)) => break dp,
            Some(_) => {}
            None => anyhow::bail!("output closed"),
        }
    };
    assert_eq!(first.dimensions["monitor_type"], "cpu");
    {
        let journal = journal.lock().unwrap();
        assert_eq!(journal.calls.len(), 1, "http is still configuring");
        assert!(matches!(journal.calls[0], Call::Configure(_)));
    }

    // The hung start is abandoned on shutdown; only cpu was running.
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task).await??;
    let journal = journal.lock().unwrap();
    let shutdowns = journal
        .calls
        .iter()
        .filter(|c| matches!(c, Call::Shutdown(_)))
        .count();
    assert_eq!(shutdowns, 1);
    Ok(())
}
