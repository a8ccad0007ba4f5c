//! Seams to the surrounding cluster: node inventory, bundle persistence,
//! address-slice storage, worker scaling, routing resolution and the raw
//! event feeds the discovery kinds consume. The orchestrator plumbing
//! behind these traits lives outside this crate; the in-memory
//! implementations here back tests and dry-run mode.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use crate::discover::{Labels, MonitorMeta};
use crate::rebalance::AddressSlice;

/// Result of resolving a discovered node name against the inventory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeMatch {
    pub name: String,
    pub known: bool,
}

pub trait NodeInventory: Send + Sync {
    fn count(&self) -> usize;

    /// Corrects the name (aliases, stale casings) and answers whether the
    /// node is currently part of the cluster.
    fn resolve(&self, name: &str) -> NodeMatch;

    /// Node addresses ordered by node name, so downstream objects stay
    /// stable across map-iteration order.
    fn addresses(&self) -> Vec<String>;

    /// Index of the fixed-pool worker running on the given host, when any.
    fn worker_index(&self, host: &str) -> Option<usize>;
}

/// Persistence for named distribution bundles: `map[filename] -> bytes`.
#[async_trait]
pub trait BundleSink: Send + Sync {
    async fn apply(&self, name: &str, files: BTreeMap<String, Vec<u8>>) -> crate::Result<()>;
    async fn delete(&self, name: &str) -> crate::Result<()>;
}

#[async_trait]
pub trait SliceStore: Send + Sync {
    async fn service_exists(&self) -> crate::Result<bool>;
    async fn list(&self) -> crate::Result<Vec<AddressSlice>>;
    async fn sync(&self, slice: AddressSlice) -> crate::Result<()>;
    async fn delete(&self, name: &str) -> crate::Result<()>;
}

#[async_trait]
pub trait WorkerScaler: Send + Sync {
    async fn scale(&self, replicas: usize) -> crate::Result<()>;
    async fn ready_replicas(&self) -> crate::Result<usize>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct RoutingInfo {
    pub id: u32,
    pub labels: Labels,
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("no routing id configured for {0}")]
    NotConfigured(String),
}

/// Maps monitor metadata to the numeric routing id the distribution
/// pipeline needs, plus extra labels to stamp on every target.
pub trait RoutingResolver: Send + Sync {
    fn resolve(&self, meta: &MonitorMeta, system: bool) -> Result<RoutingInfo, RoutingError>;
}

// ===== raw event feeds ======================================================

/// One endpoint of an orchestrator object (cluster-role kind).
#[derive(Clone, Debug)]
pub struct EndpointEntry {
    pub address: String,
    pub port: u16,
    pub node: String,
    pub labels: Labels,
}

#[derive(Clone, Debug)]
pub struct ObjectEndpoints {
    pub namespace: String,
    pub name: String,
    pub labels: Labels,
    pub endpoints: Vec<EndpointEntry>,
}

/// One service snapshot from an HTTP registry poll.
#[derive(Clone, Debug)]
pub struct RegistryService {
    pub name: String,
    pub addresses: Vec<String>,
    pub labels: Labels,
}

/// One key/value record from a coordination store; an empty value marks a
/// deleted key.
#[derive(Clone, Debug)]
pub struct KeyValueRecord {
    pub key: String,
    pub value: Vec<u8>,
}

/// One instance reported by a mesh registry.
#[derive(Clone, Debug)]
pub struct MeshInstance {
    pub service: String,
    pub host: String,
    pub port: u16,
    pub healthy: bool,
    pub metadata: Labels,
}

/// A raw batch pushed by the external watch plumbing; each discovery kind
/// consumes the variant it understands.
#[derive(Clone, Debug)]
pub enum FeedBatch {
    Objects(Vec<ObjectEndpoints>),
    Registry(Vec<RegistryService>),
    KeyValues(Vec<KeyValueRecord>),
    Instances(Vec<MeshInstance>),
}

/// Fan-out point between the external plumbing and the kind sources. The
/// plumbing pushes batches per (role, namespace); sources subscribe.
pub struct FeedHub {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<FeedBatch>>>>,
}

impl FeedHub {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, role: &str, namespace: &str) -> mpsc::Receiver<FeedBatch> {
        let (tx, rx) = mpsc::channel(16);
        self.subscribers
            .lock()
            .unwrap()
            .entry(format!("{role}/{namespace}"))
            .or_default()
            .push(tx);
        rx
    }

    /// Delivers a batch to every live subscriber of the (role, namespace)
    /// channel, pruning closed ones.
    pub fn push(&self, role: &str, namespace: &str, batch: FeedBatch) {
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(senders) = subscribers.get_mut(&format!("{role}/{namespace}")) {
            senders.retain(|tx| tx.try_send(batch.clone()).is_ok());
        }
    }
}

impl Default for FeedHub {
    fn default() -> Self {
        Self::new()
    }
}

// ===== in-memory / dry-run implementations =================================

/// Fixed node inventory; the embedding process swaps in a live one.
pub struct StaticNodes {
    nodes: Vec<(String, String)>,
    workers: Vec<String>,
}

impl StaticNodes {
    /// `nodes` are (name, address) pairs; `workers` are the hosts the
    /// fixed-pool workers run on, indexed by worker ordinal.
    pub fn new(mut nodes: Vec<(String, String)>, workers: Vec<String>) -> Self {
        nodes.sort();
        Self { nodes, workers }
    }
}

impl NodeInventory for StaticNodes {
    fn count(&self) -> usize {
        self.nodes.len()
    }

    fn resolve(&self, name: &str) -> NodeMatch {
        let known = self.nodes.iter().any(|(node, _)| node == name);
        NodeMatch {
            name: name.to_string(),
            known,
        }
    }

    fn addresses(&self) -> Vec<String> {
        self.nodes.iter().map(|(_, addr)| addr.clone()).collect()
    }

    fn worker_index(&self, host: &str) -> Option<usize> {
        self.workers.iter().position(|worker| worker == host)
    }
}

/// Keeps bundles in memory and counts writes; used by tests and dry-run.
pub struct MemoryBundleSink {
    pub bundles: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
    pub applies: AtomicUsize,
    pub deletes: AtomicUsize,
    dry_run: bool,
}

impl MemoryBundleSink {
    pub fn new() -> Self {
        Self {
            bundles: Mutex::new(BTreeMap::new()),
            applies: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            dry_run: false,
        }
    }

    /// Dry-run flavor: records nothing permanent, logs every operation.
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::new()
        }
    }

    pub fn apply_count(&self) -> usize {
        self.applies.load(Ordering::Relaxed)
    }
}

impl Default for MemoryBundleSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BundleSink for MemoryBundleSink {
    async fn apply(&self, name: &str, files: BTreeMap<String, Vec<u8>>) -> crate::Result<()> {
        self.applies.fetch_add(1, Ordering::Relaxed);
        if self.dry_run {
            info!(message = "dry-run bundle apply", name, files = files.len());
            return Ok(());
        }
        self.bundles.lock().unwrap().insert(name.to_string(), files);
        Ok(())
    }

    async fn delete(&self, name: &str) -> crate::Result<()> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        if self.dry_run {
            info!(message = "dry-run bundle delete", name);
            return Ok(());
        }
        self.bundles.lock().unwrap().remove(name);
        Ok(())
    }
}

pub struct MemorySliceStore {
    pub present: std::sync::atomic::AtomicBool,
    pub slices: Mutex<BTreeMap<String, AddressSlice>>,
    pub syncs: AtomicUsize,
    pub removals: AtomicUsize,
}

impl MemorySliceStore {
    pub fn new() -> Self {
        Self {
            present: std::sync::atomic::AtomicBool::new(true),
            slices: Mutex::new(BTreeMap::new()),
            syncs: AtomicUsize::new(0),
            removals: AtomicUsize::new(0),
        }
    }
}

impl Default for MemorySliceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SliceStore for MemorySliceStore {
    async fn service_exists(&self) -> crate::Result<bool> {
        Ok(self.present.load(Ordering::Relaxed))
    }

    async fn list(&self) -> crate::Result<Vec<AddressSlice>> {
        Ok(self.slices.lock().unwrap().values().cloned().collect())
    }

    async fn sync(&self, slice: AddressSlice) -> crate::Result<()> {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        self.slices
            .lock()
            .unwrap()
            .insert(slice.name.clone(), slice);
        Ok(())
    }

    async fn delete(&self, name: &str) -> crate::Result<()> {
        self.removals.fetch_add(1, Ordering::Relaxed);
        self.slices.lock().unwrap().remove(name);
        Ok(())
    }
}

/// Scaler whose ready count always follows the last scale request.
pub struct ImmediateScaler {
    replicas: AtomicUsize,
}

impl ImmediateScaler {
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: AtomicUsize::new(replicas),
        }
    }
}

#[async_trait]
impl WorkerScaler for ImmediateScaler {
    async fn scale(&self, replicas: usize) -> crate::Result<()> {
        self.replicas.store(replicas, Ordering::Relaxed);
        Ok(())
    }

    async fn ready_replicas(&self) -> crate::Result<usize> {
        Ok(self.replicas.load(Ordering::Relaxed))
    }
}

/// Resolves every monitor to one fixed routing id.
pub struct StaticRouting {
    pub id: u32,
    pub labels: Labels,
}

impl RoutingResolver for StaticRouting {
    fn resolve(&self, _meta: &MonitorMeta, _system: bool) -> Result<RoutingInfo, RoutingError> {
        Ok(RoutingInfo {
            id: self.id,
            labels: self.labels.clone(),
        })
    }
}
