pub mod cache;
pub mod driver;
pub mod kinds;
pub mod shared;
pub mod target;

use std::collections::BTreeMap;

use serde::Deserialize;

/// Sentinel owner for targets whose node cannot be resolved.
pub const UNKNOWN_NODE: &str = "unknown";

pub const ADDRESS_LABEL: &str = "__address__";
pub const SCHEME_LABEL: &str = "__scheme__";
pub const METRICS_PATH_LABEL: &str = "__metrics_path__";
pub const JOB_LABEL: &str = "job";
pub const INSTANCE_LABEL: &str = "instance";
pub const META_LABEL_PREFIX: &str = "__meta_";
/// Meta label carrying the owning node name, set by the discovery kinds.
pub const NODE_META_LABEL: &str = "__meta_node_name";

pub type Labels = BTreeMap<String, String>;

/// One discovery source's current batch of reachable targets plus shared
/// labels. `source` is "{role}/{namespace}/{name}".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetGroup {
    pub source: String,
    pub targets: Vec<Labels>,
    pub labels: Labels,
}

/// Identity of the monitor spec a discovery instance was built from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
pub struct MonitorMeta {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub index: i32,
}

impl MonitorMeta {
    pub fn id(&self) -> String {
        format!("{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Which worker pool a materialized target is scheduled on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskType {
    /// Hashed/round-robin across the fixed-size worker fleet.
    Fixed,
    /// Pinned to the agent running on the owning node.
    PerNode,
}

/// A single fully-resolved, serialized scrape target ready for scheduling.
#[derive(Clone, Debug)]
pub struct ConfigUnit {
    pub meta: MonitorMeta,
    pub node: String,
    pub filename: String,
    pub address: String,
    pub scheme: String,
    pub path: String,
    pub mask: String,
    pub namespace: String,
    pub task_type: TaskType,
    pub anti_affinity: bool,
    pub data: Vec<u8>,
}

impl ConfigUnit {
    /// Stable identity hash; unchanged input keeps filenames and bundle
    /// signatures stable across runs.
    pub fn hash(&self) -> u64 {
        target::stable_hash(&self.node, &self.data, &self.mask)
    }
}
