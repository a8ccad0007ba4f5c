use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::cache::{self, TargetCache};
use super::shared::SharedDiscovery;
use super::target::ScrapeTarget;
use super::{
    ADDRESS_LABEL, ConfigUnit, INSTANCE_LABEL, JOB_LABEL, Labels, META_LABEL_PREFIX,
    METRICS_PATH_LABEL, MonitorMeta, NODE_META_LABEL, SCHEME_LABEL, TargetGroup, TaskType,
    UNKNOWN_NODE,
};
use crate::cluster::NodeMatch;
use crate::notifier::RateBus;
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};

/// How often an instance recomputes regardless of upstream staleness, in
/// ticks; heals missed events.
const FORCED_RESYNC_TICKS: u64 = 100;
const MIN_TICK: Duration = Duration::from_secs(5);

/// Basic auth / bearer material a discovery kind contributes to every
/// target it produces.
#[derive(Clone, Debug, Default)]
pub struct AuthInfo {
    pub username: String,
    pub password: String,
    pub bearer_token: String,
}

/// Kind-specific capabilities composed into the kind-agnostic
/// materializer: auth material and node-name resolution.
pub trait KindCapabilities: Send + Sync {
    fn auth(&self) -> AuthInfo {
        AuthInfo::default()
    }

    fn resolve_node(&self, name: &str) -> NodeMatch {
        NodeMatch {
            name: name.to_string(),
            known: false,
        }
    }
}

/// Capabilities for kinds whose targets never belong to a cluster node.
pub struct DetachedCapabilities {
    pub auth: AuthInfo,
}

impl KindCapabilities for DetachedCapabilities {
    fn auth(&self) -> AuthInfo {
        self.auth.clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoverError {
    #[error("target has no address after relabeling")]
    NoAddress,
    #[error("invalid scheme {0:?}")]
    InvalidScheme(String),
    #[error("invalid target address {0:?}")]
    InvalidAddress(String),
    #[error("invalid group source {0:?}")]
    BadSource(String),
    #[error(transparent)]
    Render(#[from] serde_yaml::Error),
}

/// Static per-instance options; the monitor spec boils down to this.
#[derive(Clone, Debug)]
pub struct DiscoverOptions {
    pub name: String,
    pub meta: MonitorMeta,
    /// Watch keys this instance consumes from the shared discovery.
    pub keys: Vec<String>,
    pub path: String,
    pub scheme: String,
    pub proxy_url: String,
    pub period: String,
    pub timeout: String,
    pub relabels: Vec<relabel::Config>,
    pub params: BTreeMap<String, Vec<String>>,
    pub extra_labels: Labels,
    pub metric_relabels: Vec<serde_yaml::Value>,
    pub routing_id: u32,
    pub system: bool,
    pub forward_localhost: bool,
    pub disable_custom_timestamp: bool,
    pub anti_affinity: bool,
    pub dispatch_interval: Duration,
    /// Upper bound of the randomized startup delay; zero disables it.
    pub max_start_jitter: Duration,
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            meta: MonitorMeta::default(),
            keys: Vec::new(),
            path: "/metrics".into(),
            scheme: "http".into(),
            proxy_url: String::new(),
            period: "60s".into(),
            timeout: "30s".into(),
            relabels: Vec::new(),
            params: BTreeMap::new(),
            extra_labels: Labels::new(),
            metric_relabels: Vec::new(),
            routing_id: 0,
            system: false,
            forward_localhost: false,
            disable_custom_timestamp: false,
            anti_affinity: false,
            dispatch_interval: Duration::from_secs(30),
            max_start_jitter: Duration::from_secs(5),
        }
    }
}

struct Lifecycle {
    coordinator: Option<ShutdownCoordinator>,
    handle: Option<JoinHandle<()>>,
}

/// One discovery instance: consumes raw target batches for its keys,
/// materializes them into config units and signals the bus on change.
pub struct Discover {
    opts: DiscoverOptions,
    caps: Arc<dyn KindCapabilities>,
    shared: Arc<SharedDiscovery>,
    bus: Arc<RateBus>,
    cache: TargetCache,

    // source -> content hash -> unit
    units: std::sync::Mutex<HashMap<String, HashMap<u64, ConfigUnit>>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl Discover {
    pub fn new(
        opts: DiscoverOptions,
        caps: Arc<dyn KindCapabilities>,
        shared: Arc<SharedDiscovery>,
        bus: Arc<RateBus>,
    ) -> Self {
        Self {
            opts,
            caps,
            shared,
            bus,
            cache: TargetCache::default(),
            units: std::sync::Mutex::new(HashMap::new()),
            lifecycle: tokio::sync::Mutex::new(Lifecycle {
                coordinator: None,
                handle: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.opts.name
    }

    pub fn is_system(&self) -> bool {
        self.opts.system
    }

    /// Feature mask folded into every unit's identity hash.
    fn mask(&self) -> String {
        if self.opts.system { "1" } else { "0" }.to_string()
    }

    fn tick_period(&self) -> Duration {
        (self.opts.dispatch_interval / 2).max(MIN_TICK)
    }

    pub async fn start(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.handle.is_some() {
            return;
        }

        info!(message = "starting discover", name = self.opts.name);
        let coordinator = ShutdownCoordinator::new();
        let signal = coordinator.register();
        lifecycle.coordinator = Some(coordinator);
        lifecycle.handle = Some(tokio::spawn(run_loop(Arc::clone(self), signal)));
    }

    /// Stops the loop, waits for it, then clears instance state.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(coordinator) = lifecycle.coordinator.take() {
            info!(message = "waiting discover", name = self.opts.name);
            coordinator.shutdown().await;
        }
        if let Some(handle) = lifecycle.handle.take() {
            let _ = handle.await;
        }

        self.cache.clear();
        self.units.lock().unwrap().clear();
        info!(message = "stopped discover", name = self.opts.name);
    }

    pub fn fixed_units(&self) -> Vec<ConfigUnit> {
        self.units_of(TaskType::Fixed)
    }

    pub fn node_units(&self) -> Vec<ConfigUnit> {
        self.units_of(TaskType::PerNode)
    }

    fn units_of(&self, task_type: TaskType) -> Vec<ConfigUnit> {
        let units = self.units.lock().unwrap();
        units
            .values()
            .flat_map(|group| group.values())
            .filter(|unit| unit.task_type == task_type)
            .cloned()
            .collect()
    }

    /// Builds a label set from the discovered one: defaults, the relabel
    /// chain, address validation and port defaulting. `Ok(None)` means the
    /// target was intentionally dropped.
    fn populate_labels(
        &self,
        mut labels: Labels,
    ) -> Result<(Option<Labels>, Labels), DiscoverError> {
        for (name, value) in [
            (JOB_LABEL, self.opts.name.as_str()),
            (METRICS_PATH_LABEL, self.opts.path.as_str()),
            (SCHEME_LABEL, self.opts.scheme.as_str()),
        ] {
            if labels.get(name).is_none_or(|v| v.is_empty()) {
                labels.insert(name.to_string(), value.to_string());
            }
        }

        let original = labels.clone();
        let Some(mut labels) = relabel::process(labels, &self.opts.relabels) else {
            return Ok((None, original));
        };

        let mut address = labels
            .get(ADDRESS_LABEL)
            .cloned()
            .filter(|addr| !addr.is_empty())
            .ok_or(DiscoverError::NoAddress)?;

        if needs_port(&address) {
            let scheme = labels.get(SCHEME_LABEL).map(String::as_str).unwrap_or("");
            let port = match scheme {
                "http" | "" => 80,
                "https" => 443,
                other => return Err(DiscoverError::InvalidScheme(other.to_string())),
            };
            address = format!("{address}:{port}");
            labels.insert(ADDRESS_LABEL.to_string(), address.clone());
        }

        if !valid_host_port(&address) {
            return Err(DiscoverError::InvalidAddress(address));
        }

        labels.retain(|name, _value| !name.starts_with(META_LABEL_PREFIX));
        if labels.get(INSTANCE_LABEL).is_none_or(|v| v.is_empty()) {
            labels.insert(INSTANCE_LABEL.to_string(), address);
        }

        Ok((Some(labels), original))
    }

    fn make_target(
        &self,
        labels: Labels,
        original: &Labels,
        namespace: &str,
    ) -> (ScrapeTarget, TaskType) {
        let node_hint = original
            .get(NODE_META_LABEL)
            .cloned()
            .unwrap_or_default();

        let NodeMatch { name, known } = self.caps.resolve_node(&node_hint);
        let node_name = if name.is_empty() {
            UNKNOWN_NODE.to_string()
        } else {
            name
        };
        let task_type = if known {
            TaskType::PerNode
        } else {
            TaskType::Fixed
        };

        let mut path = labels
            .get(METRICS_PATH_LABEL)
            .cloned()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| self.opts.path.clone());
        let mut params = self.opts.params.clone();
        // query carried on the path wins over static params
        let full_path = path.clone();
        if let Some((bare, query)) = full_path.split_once('?') {
            path = bare.to_string();
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                params
                    .entry(key.to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }

        let auth = self.caps.auth();
        let target = ScrapeTarget {
            meta: self.opts.meta.clone(),
            address: labels.get(ADDRESS_LABEL).cloned().unwrap_or_default(),
            node_name,
            scheme: labels
                .get(SCHEME_LABEL)
                .cloned()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| self.opts.scheme.clone()),
            path,
            namespace: namespace.to_string(),
            routing_id: self.opts.routing_id,
            period: self.opts.period.clone(),
            timeout: self.opts.timeout.clone(),
            proxy_url: self.opts.proxy_url.clone(),
            username: auth.username,
            password: auth.password,
            bearer_token: auth.bearer_token,
            params,
            labels,
            extra_labels: self.opts.extra_labels.clone(),
            mask: self.mask(),
            disable_custom_timestamp: self.opts.disable_custom_timestamp,
            metric_relabels: self.opts.metric_relabels.clone(),
        };
        (target, task_type)
    }

    fn materialize(&self, group: &TargetGroup) -> Result<Vec<ConfigUnit>, DiscoverError> {
        let namespace = namespace_from_source(&group.source)?;

        let mut units = Vec::with_capacity(group.targets.len());
        for target_labels in &group.targets {
            let mut merged = group.labels.clone();
            for (name, value) in target_labels {
                merged.insert(name.clone(), value.clone());
            }

            let digest = cache::digest(&namespace, &merged);
            if let Some(unit) = self.cache.get(digest) {
                units.push(unit);
                continue;
            }

            let (populated, original) = match self.populate_labels(merged) {
                Ok((populated, original)) => (populated, original),
                Err(err) => {
                    warn!(
                        message = "failed to populate labels",
                        ?err,
                        discover = self.opts.name
                    );
                    continue;
                }
            };
            let Some(populated) = populated else {
                // dropped by the relabel chain on purpose
                continue;
            };

            let (mut target, task_type) = self.make_target(populated, &original, &namespace);
            if self.opts.forward_localhost {
                target.address = forward_address(&target.address);
            }

            let rendered = match target.render() {
                Ok(rendered) => rendered,
                Err(err) => {
                    warn!(
                        message = "failed to serialize target",
                        ?err,
                        discover = self.opts.name
                    );
                    continue;
                }
            };

            let unit = ConfigUnit {
                meta: self.opts.meta.clone(),
                node: target.node_name.clone(),
                filename: rendered.filename,
                address: target.address.clone(),
                scheme: target.scheme.clone(),
                path: target.path.clone(),
                mask: target.mask.clone(),
                namespace: namespace.clone(),
                task_type,
                anti_affinity: self.opts.anti_affinity,
                data: rendered.data,
            };
            self.cache.put(digest, unit.clone());
            units.push(unit);
        }
        Ok(units)
    }

    /// Diffs the materialized units against the stored set for this source
    /// and signals the bus when membership changed.
    fn apply_units(&self, source: &str, new_units: Vec<ConfigUnit>) {
        let mut all = self.units.lock().unwrap();
        let group = all.entry(source.to_string()).or_default();

        let mut seen = Vec::with_capacity(new_units.len());
        let mut changed = false;

        for unit in new_units {
            let hash = unit.hash();
            if !group.contains_key(&hash) {
                info!(
                    message = "discover adds file",
                    discover = self.opts.name,
                    node = unit.node,
                    filename = unit.filename
                );
                group.insert(hash, unit);
                changed = true;
            }
            seen.push(hash);
        }

        let vanished = group
            .keys()
            .filter(|hash| !seen.contains(hash))
            .copied()
            .collect::<Vec<_>>();
        for hash in vanished {
            if let Some(unit) = group.remove(&hash) {
                info!(
                    message = "discover deletes file",
                    discover = self.opts.name,
                    node = unit.node,
                    filename = unit.filename
                );
                changed = true;
            }
        }

        if group.is_empty() {
            all.remove(source);
        }

        if changed {
            debug!(message = "source membership changed", source);
            self.bus.publish();
        }
    }

    fn run_pass(&self, groups: Vec<TargetGroup>) {
        for group in groups {
            match self.materialize(&group) {
                Ok(units) => self.apply_units(&group.source, units),
                Err(err) => warn!(
                    message = "failed to handle target group",
                    ?err,
                    source = group.source
                ),
            }
        }
    }
}

async fn run_loop(discover: Arc<Discover>, mut shutdown: ShutdownSignal) {
    let jitter = discover.opts.max_start_jitter;
    if !jitter.is_zero() {
        let delay = rand::rng().random_range(Duration::ZERO..jitter);
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let tick = discover.tick_period();
    let mut ticker = interval(tick);
    ticker.tick().await;

    let mut counter = 0u64;
    let mut fetched = false;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            _ = ticker.tick() => {
                counter += 1;
                discover.cache.sweep();

                let mut groups = Vec::new();
                let mut updated = 0i64;
                for key in &discover.opts.keys {
                    if let Some((batch, at)) = discover.shared.fetch(key) {
                        groups.extend(batch);
                        updated = updated.max(at);
                    }
                }

                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                let stale = now - updated > 2 * tick.as_secs() as i64;
                if stale && counter % FORCED_RESYNC_TICKS != 0 && fetched {
                    debug!(message = "nothing changed upstream, skipping pass", discover = discover.opts.name);
                    continue;
                }

                fetched = true;
                discover.run_pass(groups);
            }
        }
    }

    // final signal so a stopped instance's units get undistributed
    discover.bus.publish();
}

fn namespace_from_source(source: &str) -> Result<String, DiscoverError> {
    let parts = source.split('/').collect::<Vec<_>>();
    if parts.len() != 3 {
        return Err(DiscoverError::BadSource(source.to_string()));
    }
    Ok(parts[1].to_string())
}

/// Rewrites the host to loopback keeping the port, for targets only
/// reachable through a local forward.
fn forward_address(address: &str) -> String {
    let (scheme, rest) = match address.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, address),
    };
    let rewritten = match rest.rsplit_once(':') {
        Some((_host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
            format!("127.0.0.1:{port}")
        }
        _ => "127.0.0.1".to_string(),
    };
    match scheme {
        Some(scheme) => format!("{scheme}://{rewritten}"),
        None => rewritten,
    }
}

fn valid_host_port(address: &str) -> bool {
    let Some((host, port)) = address.rsplit_once(':') else {
        return false;
    };
    if host.is_empty() || port.parse::<u16>().is_err() {
        return false;
    }
    // a bare IPv6 host must be bracketed once a port is attached
    !(host.contains(':') && !(host.starts_with('[') && host.ends_with(']')))
}

fn needs_port(address: &str) -> bool {
    !valid_host_port(address) && valid_host_port(&format!("{address}:1234"))
}
