//! Ties the pieces together: monitor specs come in as control events,
//! discovery instances materialize their targets, and a rate-limited
//! loop pushes the resulting units through the dispatcher.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval};
use tracing::{info, warn};

use crate::cluster::{BundleSink, FeedHub, NodeInventory, RoutingResolver, SliceStore, WorkerScaler};
use crate::config::Config;
use crate::discover::driver::{Discover, DiscoverOptions};
use crate::discover::kinds::DiscoveryKind;
use crate::discover::shared::SharedDiscovery;
use crate::discover::MonitorMeta;
use crate::dispatch::{Dispatcher, WorkerPool};
use crate::notifier::RateBus;
use crate::rebalance::Rebalancer;
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};

/// Secondary trigger for dispatch rounds deferred by the spacing gap.
const PENDING_CHECK_PERIOD: Duration = Duration::from_secs(30);
/// Safety net: a full round at least once an hour.
const FORCED_DISPATCH_PERIOD: Duration = Duration::from_secs(3600);

/// A scrape monitor as submitted by the control surface.
#[derive(Clone, Debug, Deserialize)]
pub struct MonitorSpec {
    #[serde(flatten)]
    pub kind: DiscoveryKind,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub index: i32,
    /// Namespaces to watch; empty means the monitor's own.
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub proxy_url: String,
    #[serde(default)]
    pub params: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub relabels: Vec<relabel::Config>,
    #[serde(default)]
    pub metric_relabels: Vec<serde_yaml::Value>,
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub anti_affinity: bool,
    #[serde(default)]
    pub forward_localhost: bool,
    #[serde(default)]
    pub disable_custom_timestamp: bool,
}

fn default_path() -> String {
    "/metrics".to_owned()
}

fn default_scheme() -> String {
    "http".to_owned()
}

impl MonitorSpec {
    pub fn meta(&self) -> MonitorMeta {
        MonitorMeta {
            kind: self.kind.role().to_owned(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            index: self.index,
        }
    }

    fn watched_namespaces(&self) -> Vec<String> {
        if self.namespaces.is_empty() {
            vec![self.namespace.clone()]
        } else {
            self.namespaces.clone()
        }
    }
}

#[derive(Debug)]
pub enum MonitorEvent {
    Apply(MonitorSpec),
    Delete(MonitorMeta),
}

/// Everything the control surface can tell the operator at runtime.
#[derive(Debug)]
pub enum ControlEvent {
    Monitor(MonitorEvent),
    /// The worker fleet was resized outside our own scale requests.
    WorkerReplicas(usize),
}

pub struct Operator {
    config: Config,
    nodes: Arc<dyn NodeInventory>,
    routing: Arc<dyn RoutingResolver>,
    feeds: Arc<FeedHub>,
    slices: Arc<dyn SliceStore>,

    shared: Arc<SharedDiscovery>,
    bus: Arc<RateBus>,
    dispatcher: Dispatcher,
    discovers: tokio::sync::Mutex<HashMap<String, Arc<Discover>>>,
}

impl Operator {
    pub fn new(
        config: Config,
        nodes: Arc<dyn NodeInventory>,
        sink: Arc<dyn BundleSink>,
        scaler: Arc<dyn WorkerScaler>,
        slices: Arc<dyn SliceStore>,
        routing: Arc<dyn RoutingResolver>,
        feeds: Arc<FeedHub>,
    ) -> Self {
        let workers = WorkerPool::new(config.workers.clone(), scaler);
        let dispatcher = Dispatcher::new(&config, sink, Arc::clone(&nodes), workers);

        Self {
            config,
            nodes,
            routing,
            feeds,
            slices,
            shared: Arc::new(SharedDiscovery::new()),
            bus: Arc::new(RateBus::default()),
            dispatcher,
            discovers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ControlEvent>,
        mut shutdown: ShutdownSignal,
    ) {
        self.shared.activate();

        let children = ShutdownCoordinator::new();
        if self.config.slices.enable {
            let rebalancer = Rebalancer::new(
                self.config.slices.name.clone(),
                self.config.slices.max_per_slice,
                self.config.slices.rebalance_threshold,
                Arc::clone(&self.nodes),
                Arc::clone(&self.slices),
            );
            tokio::spawn(rebalancer.run(children.register()));
        }

        let min_gap = Duration::from_secs(self.config.dispatch_interval.max(1));
        let mut forced = interval(FORCED_DISPATCH_PERIOD);
        forced.tick().await;
        let mut pending_check = interval(PENDING_CHECK_PERIOD);
        pending_check.tick().await;

        let mut last_dispatch: Option<Instant> = None;
        let mut pending = false;
        let mut events_open = true;

        let gap_elapsed =
            |last: Option<Instant>| last.is_none_or(|at| at.elapsed() >= min_gap);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,

                event = events.recv(), if events_open => match event {
                    Some(ControlEvent::Monitor(MonitorEvent::Apply(spec))) => {
                        self.apply_monitor(spec).await;
                    }
                    Some(ControlEvent::Monitor(MonitorEvent::Delete(meta))) => {
                        self.delete_monitor(&meta).await;
                    }
                    Some(ControlEvent::WorkerReplicas(count)) => {
                        info!(message = "worker fleet resized externally", count);
                        self.dispatcher.workers().set_count(count);
                        self.bus.publish();
                    }
                    None => {
                        warn!(message = "control event feed closed");
                        events_open = false;
                    }
                },

                _ = forced.tick() => {
                    self.dispatch_round().await;
                    last_dispatch = Some(Instant::now());
                    pending = false;
                }

                _ = self.bus.notified() => {
                    if gap_elapsed(last_dispatch) {
                        self.dispatch_round().await;
                        last_dispatch = Some(Instant::now());
                    } else {
                        // too soon after the last round; re-fired below
                        pending = true;
                    }
                }

                _ = pending_check.tick(), if pending => {
                    if gap_elapsed(last_dispatch) {
                        self.dispatch_round().await;
                        last_dispatch = Some(Instant::now());
                        pending = false;
                    }
                }
            }
        }

        children.shutdown().await;
        let discovers: Vec<_> = self.discovers.lock().await.drain().collect();
        for (_key, discover) in discovers {
            discover.stop().await;
        }
        self.shared.deactivate().await;
    }

    /// Builds (or replaces) the discovery instance for a monitor spec.
    pub async fn apply_monitor(&self, spec: MonitorSpec) {
        let meta = spec.meta();

        let routing = match self.routing.resolve(&meta, spec.system) {
            Ok(routing) => routing,
            Err(err) => {
                // retried when the monitor is resubmitted
                warn!(message = "skipping monitor without routing", ?err, monitor = meta.id());
                return;
            }
        };

        if let Err(err) = relabel::validate(&spec.relabels) {
            warn!(message = "skipping monitor with invalid relabel rules", ?err, monitor = meta.id());
            return;
        }

        let namespaces = spec.watched_namespaces();
        for namespace in &namespaces {
            let source = spec.kind.source(namespace, &self.feeds);
            if let Err(err) = self.shared.register(source).await {
                warn!(message = "failed to register discovery source", ?err, namespace);
            }
        }

        let role = spec.kind.role();
        let opts = DiscoverOptions {
            name: format!("{}/{}", spec.namespace, spec.name),
            meta: meta.clone(),
            keys: namespaces
                .iter()
                .map(|namespace| format!("{role}/{namespace}"))
                .collect(),
            path: spec.path.clone(),
            scheme: spec.scheme.clone(),
            proxy_url: spec.proxy_url.clone(),
            period: spec
                .period
                .clone()
                .unwrap_or_else(|| self.config.default_period.clone()),
            timeout: spec
                .timeout
                .clone()
                .unwrap_or_else(|| self.config.default_timeout.clone()),
            relabels: spec.relabels.clone(),
            params: spec.params.clone(),
            extra_labels: routing.labels,
            metric_relabels: spec.metric_relabels.clone(),
            routing_id: routing.id,
            system: spec.system,
            forward_localhost: spec.forward_localhost,
            disable_custom_timestamp: spec.disable_custom_timestamp,
            anti_affinity: spec.anti_affinity,
            dispatch_interval: Duration::from_secs(self.config.dispatch_interval.max(1)),
            max_start_jitter: Duration::from_secs(5),
        };

        let caps = spec.kind.capabilities(Arc::clone(&self.nodes));
        let discover = Arc::new(Discover::new(
            opts,
            caps,
            Arc::clone(&self.shared),
            Arc::clone(&self.bus),
        ));

        let previous = self
            .discovers
            .lock()
            .await
            .insert(meta.id(), Arc::clone(&discover));
        if let Some(previous) = previous {
            previous.stop().await;
        }

        info!(message = "monitor applied", monitor = meta.id());
        discover.start().await;
    }

    pub async fn delete_monitor(&self, meta: &MonitorMeta) {
        let removed = self.discovers.lock().await.remove(&meta.id());
        match removed {
            Some(discover) => {
                discover.stop().await;
                info!(message = "monitor deleted", monitor = meta.id());
            }
            None => warn!(message = "delete for unknown monitor", monitor = meta.id()),
        }
    }

    pub async fn monitor_count(&self) -> usize {
        self.discovers.lock().await.len()
    }

    async fn dispatch_round(&self) {
        let mut units = Vec::new();
        {
            let discovers = self.discovers.lock().await;
            for discover in discovers.values() {
                units.extend(discover.fixed_units());
                units.extend(discover.node_units());
            }
        }

        info!(message = "dispatching units", count = units.len());
        self.dispatcher.dispatch(units).await;
    }
}
