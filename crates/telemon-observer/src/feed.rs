use crate::{EndpointEvent, Observer};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use telemon_common::types::{Endpoint, EndpointId};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Tracks the last snapshot of one observer and turns new snapshots into
/// [`EndpointEvent`]s.
///
/// Vanished events are produced before Appeared events, and an endpoint
/// whose attributes are unchanged produces nothing.
#[derive(Debug, Default)]
pub struct EndpointTracker {
    known: BTreeMap<EndpointId, Endpoint>,
}

impl EndpointTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, discovered: Vec<Endpoint>) -> Vec<EndpointEvent> {
        let next: BTreeMap<EndpointId, Endpoint> = discovered
            .into_iter()
            .map(|ep| (ep.id.clone(), ep))
            .collect();

        let mut events: Vec<EndpointEvent> = self
            .known
            .keys()
            .filter(|id| !next.contains_key(*id))
            .map(|id| EndpointEvent::Vanished(id.clone()))
            .collect();

        for (id, endpoint) in &next {
            if self.known.get(id) != Some(endpoint) {
                events.push(EndpointEvent::Appeared(endpoint.clone()));
            }
        }

        self.known = next;
        events
    }

    /// Forgets every known endpoint, returning a Vanished event for each.
    pub fn vanish_all(&mut self) -> Vec<EndpointEvent> {
        std::mem::take(&mut self.known)
            .into_keys()
            .map(EndpointEvent::Vanished)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

/// Exponential backoff applied to an observer after a failed discovery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

struct Backoff {
    policy: BackoffPolicy,
    current: Option<Duration>,
}

impl Backoff {
    fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: None,
        }
    }

    fn reset(&mut self) {
        self.current = None;
    }

    /// Doubles the delay up to the cap and adds up to 10% jitter.
    fn next_delay(&mut self) -> Duration {
        let base = match self.current {
            None => self.policy.initial,
            Some(prev) => (prev * 2).min(self.policy.max),
        };
        self.current = Some(base);
        let jitter_ms = (base.as_millis() / 10) as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Drives a set of observers and merges their events into one ordered
/// stream.
///
/// Each observer runs in its own task. A failing observer keeps its last
/// snapshot (no Vanished events are synthesised for an outage) and is
/// retried with backoff. On cancellation every observer reports its known
/// endpoints as vanished before its task exits.
///
/// The first observer of each type keeps its endpoint IDs as produced. Later
/// observers of the same type get an ordinal in the prefix (`static[1]:...`),
/// so two observers listing the same service never share an ID.
pub struct EndpointFeed {
    observers: Vec<Box<dyn Observer>>,
    backoff: BackoffPolicy,
    channel_capacity: usize,
}

impl EndpointFeed {
    pub fn new(observers: Vec<Box<dyn Observer>>) -> Self {
        Self {
            observers,
            backoff: BackoffPolicy::default(),
            channel_capacity: 256,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Starts every observer and returns the event stream.
    pub fn subscribe(self, cancel: CancellationToken) -> FeedSubscription {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let mut tasks = JoinSet::new();
        let mut seen: HashMap<String, usize> = HashMap::new();
        for observer in self.observers {
            let count = seen.entry(observer.observer_type().to_string()).or_default();
            let ordinal = *count;
            *count += 1;
            let tx = tx.clone();
            let cancel = cancel.clone();
            let backoff = self.backoff;
            tasks.spawn(run_observer(observer, ordinal, tx, cancel, backoff));
        }
        FeedSubscription { events: rx, tasks }
    }
}

/// The consuming end of an [`EndpointFeed`].
pub struct FeedSubscription {
    events: mpsc::Receiver<EndpointEvent>,
    tasks: JoinSet<()>,
}

impl FeedSubscription {
    /// Waits for the next event. Returns `None` once every observer task has
    /// exited and its final Vanished events have been delivered.
    pub async fn next(&mut self) -> Option<EndpointEvent> {
        self.events.recv().await
    }

    /// Drains remaining events and waits for every observer task to finish.
    /// Only meaningful after the feed's cancellation token fired.
    pub async fn join(mut self) -> Vec<EndpointEvent> {
        let mut remaining = Vec::new();
        while let Some(event) = self.events.recv().await {
            remaining.push(event);
        }
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Observer task panicked");
            }
        }
        remaining
    }
}

/// Rewrites an endpoint ID for the `ordinal`-th observer of its type.
fn qualify_id(id: &EndpointId, observer_type: &str, ordinal: usize) -> EndpointId {
    if ordinal == 0 {
        return id.clone();
    }
    let raw = id
        .0
        .strip_prefix(observer_type)
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or(&id.0);
    EndpointId(format!("{observer_type}[{ordinal}]:{raw}"))
}

async fn run_observer(
    mut observer: Box<dyn Observer>,
    ordinal: usize,
    tx: mpsc::Sender<EndpointEvent>,
    cancel: CancellationToken,
    policy: BackoffPolicy,
) {
    let observer_type = observer.observer_type().to_string();
    let mut tracker = EndpointTracker::new();
    let mut backoff = Backoff::new(policy);

    tracing::info!(observer = %observer_type, ordinal, "Observer started");

    loop {
        let discovered = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = observer.discover() => result,
        };

        let delay = match discovered {
            Ok(mut endpoints) => {
                backoff.reset();
                for endpoint in &mut endpoints {
                    if endpoint.observer.is_empty() {
                        endpoint.observer = observer_type.clone();
                    }
                    endpoint.id = qualify_id(&endpoint.id, &observer_type, ordinal);
                }
                for event in tracker.update(endpoints) {
                    if tx.send(event).await.is_err() {
                        tracing::debug!(observer = %observer_type, "Feed receiver dropped");
                        return;
                    }
                }
                observer.poll_interval()
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    observer = %observer_type,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    known = tracker.len(),
                    "Discovery failed, keeping last known endpoints"
                );
                delay
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    for event in tracker.vanish_all() {
        if tx.send(event).await.is_err() {
            break;
        }
    }
    tracing::info!(observer = %observer_type, "Observer stopped");
}
