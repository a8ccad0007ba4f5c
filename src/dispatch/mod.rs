//! Spreads materialized config units across worker bundles.
//!
//! Per-node units always land in that node's bundle; fixed units are
//! assigned by filename hash or round robin over the worker fleet.
//! Bundles carry a content signature, so an unchanged bundle costs
//! nothing to "rewrite", and a per-round write budget keeps one bad
//! round from hammering the sink.

mod workers;

pub use workers::{WorkerPool, desired};

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::cluster::{BundleSink, NodeInventory};
use crate::codec;
use crate::config::{Config, DispatchMode};
use crate::discover::target::hash_str;
use crate::discover::{ConfigUnit, TaskType};
use crate::notifier::Alarmer;

/// Signature caches are dropped this often, forcing a full rewrite that
/// repairs any bundle mutated behind our back.
const FULL_REWRITE_PERIOD: Duration = Duration::from_secs(2 * 60 * 60);

pub struct Dispatcher {
    mode: DispatchMode,
    prefix: String,
    ratio: f64,
    sink: Arc<dyn BundleSink>,
    nodes: Arc<dyn NodeInventory>,
    workers: WorkerPool,

    // bundle name -> signature of its sorted filenames
    applied: Mutex<HashMap<String, u64>>,
    skipped: AtomicU64,
    rewrite_alarm: Alarmer,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        sink: Arc<dyn BundleSink>,
        nodes: Arc<dyn NodeInventory>,
        workers: WorkerPool,
    ) -> Self {
        Self {
            mode: config.dispatch_mode,
            prefix: config.bundle_prefix.clone(),
            ratio: config.bundle_ratio,
            sink,
            nodes,
            workers,
            applied: Mutex::new(HashMap::new()),
            skipped: AtomicU64::new(0),
            rewrite_alarm: Alarmer::new(FULL_REWRITE_PERIOD),
        }
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// Units skipped by the write budget since startup.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Runs one dispatch round over the full desired unit set.
    pub async fn dispatch(&self, units: Vec<ConfigUnit>) {
        if self.rewrite_alarm.due() {
            info!(message = "dropping bundle signatures for a full rewrite");
            self.applied.lock().unwrap().clear();
        }

        let (fixed, per_node): (Vec<_>, Vec<_>) = units
            .into_iter()
            .partition(|unit| unit.task_type == TaskType::Fixed);

        let worker_count = self.workers.reconcile(fixed.len()).await;
        let bundles = self.assemble(fixed, per_node, worker_count);

        let budget = ((self.nodes.count() as f64 * self.ratio) as usize).max(1);
        let mut written = 0usize;

        for (name, files) in &bundles {
            let signature = bundle_signature(files);
            if self.applied.lock().unwrap().get(name) == Some(&signature) {
                continue;
            }

            if written >= budget {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(message = "write budget exhausted, deferring bundle", name);
                continue;
            }
            written += 1;

            match self.write_bundle(name, files).await {
                Ok(()) => {
                    self.applied.lock().unwrap().insert(name.clone(), signature);
                }
                Err(err) => {
                    error!(message = "failed to write bundle", ?err, name);
                    // forget the stale signature so the next round retries
                    self.applied.lock().unwrap().remove(name);
                }
            }
        }

        self.cleanup(&bundles).await;
    }

    /// Groups units into named bundles.
    fn assemble(
        &self,
        mut fixed: Vec<ConfigUnit>,
        per_node: Vec<ConfigUnit>,
        worker_count: usize,
    ) -> BTreeMap<String, BTreeMap<String, Vec<u8>>> {
        let mut bundles: BTreeMap<String, BTreeMap<String, Vec<u8>>> = BTreeMap::new();

        for unit in per_node {
            bundles
                .entry(format!("{}-node-{}", self.prefix, unit.node))
                .or_default()
                .insert(unit.filename, unit.data);
        }

        // stable order keeps both assignment modes deterministic
        fixed.sort_by(|a, b| a.filename.cmp(&b.filename));
        let n = worker_count.max(1);
        for (position, unit) in fixed.into_iter().enumerate() {
            let mut index = match self.mode {
                DispatchMode::Hash => (hash_str(&unit.filename) % n as u64) as usize,
                DispatchMode::RoundRobin => position % n,
            };

            // a flagged unit whose scrape host runs a worker never keeps its
            // normal assignment: it always lands right after that worker
            if unit.anti_affinity
                && let Some(colocated) = self.nodes.worker_index(address_host(&unit.address))
            {
                index = (colocated + 1) % n;
            }

            bundles
                .entry(format!("{}-{}", self.prefix, index))
                .or_default()
                .insert(unit.filename, unit.data);
        }

        bundles
    }

    async fn write_bundle(
        &self,
        name: &str,
        files: &BTreeMap<String, Vec<u8>>,
    ) -> crate::Result<()> {
        let mut packed = BTreeMap::new();
        for (filename, data) in files {
            packed.insert(filename.clone(), codec::compress(data)?);
        }

        debug!(message = "writing bundle", name, files = packed.len());
        self.sink.apply(name, packed).await
    }

    /// Deletes previously-applied bundles that no unit maps to anymore.
    async fn cleanup(&self, desired: &BTreeMap<String, BTreeMap<String, Vec<u8>>>) {
        let stale: Vec<String> = {
            let applied = self.applied.lock().unwrap();
            applied
                .keys()
                .filter(|name| !desired.contains_key(*name))
                .cloned()
                .collect()
        };

        for name in stale {
            info!(message = "deleting orphaned bundle", name);
            match self.sink.delete(&name).await {
                Ok(()) => {
                    self.applied.lock().unwrap().remove(&name);
                }
                Err(err) => warn!(message = "failed to delete bundle", ?err, name),
            }
        }
    }
}

fn bundle_signature(files: &BTreeMap<String, Vec<u8>>) -> u64 {
    // keys iterate sorted; the signature only tracks membership
    let joined = files.keys().cloned().collect::<Vec<_>>().join("\n");
    hash_str(&joined)
}

fn address_host(address: &str) -> &str {
    let rest = address
        .split_once("://")
        .map_or(address, |(_scheme, rest)| rest);
    match rest.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => rest,
    }
}
