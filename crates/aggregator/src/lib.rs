//! Watt aggregator: a single-owner actor merging cluster resources and mesh
//! endpoints into snapshots.
//!
//! All mutable state lives inside [`Aggregator`] and is only touched from its
//! run loop. Producers talk to it through [`Intake`]; consumers read the two
//! output channels handed in at construction.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use watt_core::{
    required_services, watch_list, EndpointTable, Endpoints, KubernetesEvent, Resolvers, Resource, ResourceTable,
    Snapshot,
};

mod bootstrap;
mod error;

pub use bootstrap::BootstrapTracker;
pub use error::AggregatorError;

/// Construction-time settings.
#[derive(Debug)]
pub struct AggregatorConfig {
    /// Kinds that must each be seen once before the first snapshot. May be empty.
    pub required_kinds: Vec<String>,
    /// Capacity of each intake channel. Producers wait when it is full.
    pub intake_capacity: usize,
    pub resolvers: Resolvers,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self { required_kinds: Vec::new(), intake_capacity: 64, resolvers: Resolvers::default() }
    }
}

impl AggregatorConfig {
    pub fn with_required_kinds<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { required_kinds: kinds.into_iter().map(Into::into).collect(), ..Self::default() }
    }
}

/// Producer side of the two intake points.
#[derive(Debug, Clone)]
pub struct Intake {
    pub kubernetes: mpsc::Sender<KubernetesEvent>,
    pub consul: mpsc::Sender<Endpoints>,
}

/// Counters published after every processed event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorStats {
    pub kubernetes_events: u64,
    pub consul_events: u64,
    pub watch_updates: u64,
    pub snapshots: u64,
    pub bootstrapped: bool,
}

enum Input {
    Kubernetes(Option<KubernetesEvent>),
    Consul(Option<Endpoints>),
    Closed,
}

enum Flow {
    Continue,
    Stop,
}

pub struct Aggregator {
    kube_rx: mpsc::Receiver<KubernetesEvent>,
    consul_rx: mpsc::Receiver<Endpoints>,
    snapshots: mpsc::Sender<String>,
    watches: mpsc::Sender<Vec<Resource>>,
    resolvers: Resolvers,
    tracker: BootstrapTracker,
    resources: ResourceTable,
    endpoints: EndpointTable,
    /// `None` until the first cluster-resource event, so that event always publishes a watch list.
    required: Option<BTreeSet<String>>,
    /// Last watch list handed out. Resolver edits that keep the same service
    /// (address, datacenter) still republish.
    published: Option<Vec<Resource>>,
    bootstrapped: bool,
    stats: AggregatorStats,
    stats_tx: watch::Sender<AggregatorStats>,
}

impl Aggregator {
    pub fn new(
        config: AggregatorConfig,
        snapshots: mpsc::Sender<String>,
        watches: mpsc::Sender<Vec<Resource>>,
    ) -> (Self, Intake) {
        let cap = config.intake_capacity.max(1);
        let (kube_tx, kube_rx) = mpsc::channel(cap);
        let (consul_tx, consul_rx) = mpsc::channel(cap);
        let (stats_tx, _) = watch::channel(AggregatorStats::default());
        let me = Self {
            kube_rx,
            consul_rx,
            snapshots,
            watches,
            resolvers: config.resolvers,
            tracker: BootstrapTracker::new(config.required_kinds),
            resources: ResourceTable::new(),
            endpoints: EndpointTable::new(),
            required: None,
            published: None,
            bootstrapped: false,
            stats: AggregatorStats::default(),
            stats_tx,
        };
        (me, Intake { kubernetes: kube_tx, consul: consul_tx })
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<AggregatorStats> {
        self.stats_tx.subscribe()
    }

    /// Spawn the run loop on the current tokio runtime.
    pub fn start(self) -> RunningAggregator {
        let (stop_tx, stop_rx) = oneshot::channel();
        let stats = self.subscribe_stats();
        let join = tokio::spawn(self.run(stop_rx));
        RunningAggregator { stop: stop_tx, join, stats }
    }

    /// Drive the loop until `stop` fires (or its sender is dropped), or both intakes close.
    pub async fn run(mut self, mut stop: oneshot::Receiver<()>) -> Result<(), AggregatorError> {
        info!(required_kinds = ?self.tracker.required_kinds(), resolvers = self.resolvers.len(), "aggregator started");
        if self.resolvers.is_empty() {
            warn!("no resolvers configured; watch list will stay empty");
        }
        let mut kube_open = true;
        let mut consul_open = true;
        loop {
            let input = tokio::select! {
                biased;
                _ = &mut stop => break,
                input = next_input(&mut self.kube_rx, &mut self.consul_rx, kube_open, consul_open) => input,
            };
            let flow = match input {
                Input::Kubernetes(Some(ev)) => self.on_kubernetes(ev, &mut stop).await?,
                Input::Consul(Some(eps)) => self.on_consul(eps, &mut stop).await?,
                Input::Kubernetes(None) => {
                    debug!("kubernetes intake closed");
                    kube_open = false;
                    Flow::Continue
                }
                Input::Consul(None) => {
                    debug!("consul intake closed");
                    consul_open = false;
                    Flow::Continue
                }
                Input::Closed => {
                    info!("both intakes closed; nothing left to aggregate");
                    Flow::Stop
                }
            };
            if let Flow::Stop = flow {
                break;
            }
        }
        info!(snapshots = self.stats.snapshots, bootstrapped = self.bootstrapped, "aggregator stopped");
        Ok(())
    }

    async fn on_kubernetes(
        &mut self,
        ev: KubernetesEvent,
        stop: &mut oneshot::Receiver<()>,
    ) -> Result<Flow, AggregatorError> {
        let KubernetesEvent { kind, resources } = ev;
        debug!(kind = %kind, count = resources.len(), "kubernetes event");
        counter!("watt_events_total", 1u64, "source" => "kubernetes");
        self.stats.kubernetes_events += 1;

        self.tracker.observe_kind(&kind);
        self.resources.insert(kind, resources);

        let required = required_services(&self.resources, &self.resolvers);
        let watches = watch_list(&self.resources, &self.resolvers);
        let services_changed = self.required.as_ref() != Some(&required);
        if services_changed || self.published.as_ref() != Some(&watches) {
            debug!(services = ?required, resolvers = watches.len(), services_changed, "publishing watch list");
            self.required = Some(required);
            self.published = Some(watches.clone());
            if let Flow::Stop = emit(&self.watches, watches, stop, AggregatorError::WatchSink).await? {
                return Ok(Flow::Stop);
            }
            counter!("watt_watch_updates_total", 1u64);
            self.stats.watch_updates += 1;
        }
        self.maybe_snapshot(stop).await
    }

    async fn on_consul(&mut self, eps: Endpoints, stop: &mut oneshot::Receiver<()>) -> Result<Flow, AggregatorError> {
        debug!(service = %eps.service, count = eps.endpoints.len(), "consul endpoints");
        counter!("watt_events_total", 1u64, "source" => "consul");
        self.stats.consul_events += 1;

        self.tracker.observe_service(&eps.service);
        self.endpoints.insert(eps.service.clone(), eps);
        self.maybe_snapshot(stop).await
    }

    async fn maybe_snapshot(&mut self, stop: &mut oneshot::Receiver<()>) -> Result<Flow, AggregatorError> {
        if !self.bootstrapped {
            let empty = BTreeSet::new();
            let required = self.required.as_ref().unwrap_or(&empty);
            if !self.tracker.ready(required) {
                debug!(
                    missing_kinds = ?self.tracker.missing_kinds(),
                    missing_services = ?self.tracker.missing_services(required),
                    "not bootstrapped yet; holding snapshot"
                );
                self.publish_stats();
                return Ok(Flow::Continue);
            }
            info!("bootstrap complete");
            gauge!("watt_bootstrapped", 1.0);
            self.bootstrapped = true;
            self.stats.bootstrapped = true;
        }

        let json = Snapshot::assemble(&self.resources, &self.endpoints).to_json()?;
        histogram!("watt_snapshot_bytes", json.len() as f64);
        if let Flow::Stop = emit(&self.snapshots, json, stop, AggregatorError::SnapshotSink).await? {
            return Ok(Flow::Stop);
        }
        counter!("watt_snapshots_total", 1u64);
        self.stats.snapshots += 1;
        self.publish_stats();
        Ok(Flow::Continue)
    }

    fn publish_stats(&self) {
        self.stats_tx.send_replace(self.stats);
    }
}

async fn next_input(
    kube: &mut mpsc::Receiver<KubernetesEvent>,
    consul: &mut mpsc::Receiver<Endpoints>,
    kube_open: bool,
    consul_open: bool,
) -> Input {
    tokio::select! {
        ev = kube.recv(), if kube_open => Input::Kubernetes(ev),
        ev = consul.recv(), if consul_open => Input::Consul(ev),
        else => Input::Closed,
    }
}

/// Send on an output sink, giving up if stop fires while the sink is full.
async fn emit<T>(
    tx: &mpsc::Sender<T>,
    value: T,
    stop: &mut oneshot::Receiver<()>,
    closed: AggregatorError,
) -> Result<Flow, AggregatorError> {
    tokio::select! {
        biased;
        _ = stop => Ok(Flow::Stop),
        res = tx.send(value) => match res {
            Ok(()) => Ok(Flow::Continue),
            Err(_) => {
                warn!(error = %closed, "output sink rejected value");
                Err(closed)
            }
        },
    }
}

/// Handle to a spawned aggregator. Dropping it stops the loop.
#[derive(Debug)]
pub struct RunningAggregator {
    stop: oneshot::Sender<()>,
    join: JoinHandle<Result<(), AggregatorError>>,
    stats: watch::Receiver<AggregatorStats>,
}

impl RunningAggregator {
    pub fn stats(&self) -> watch::Receiver<AggregatorStats> {
        self.stats.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal the loop to stop and wait for it to exit. Safe at any phase.
    pub async fn stop(self) -> Result<(), AggregatorError> {
        let RunningAggregator { stop, join, .. } = self;
        let _ = stop.send(());
        flatten(join.await)
    }

    /// Wait for the loop to exit on its own (both intakes closed, or a sink failure).
    pub async fn wait(self) -> Result<(), AggregatorError> {
        let RunningAggregator { stop, join, .. } = self;
        let res = join.await;
        drop(stop);
        flatten(res)
    }
}

fn flatten(res: Result<Result<(), AggregatorError>, tokio::task::JoinError>) -> Result<(), AggregatorError> {
    res.map_err(|e| AggregatorError::Join(e.to_string()))?
}
