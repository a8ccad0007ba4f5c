use std::path::Path;

use serde::Deserialize;

use crate::operator::MonitorSpec;

/// How fixed-pool units map to workers.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Stable placement keyed on the unit filename.
    #[default]
    Hash,
    /// Even spread, cheaper to balance but reshuffles on resize.
    RoundRobin,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Minimum spacing between dispatch rounds, in seconds.
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval: u64,
    #[serde(default)]
    pub dispatch_mode: DispatchMode,
    /// Prefix of every bundle name this operator owns.
    #[serde(default = "default_bundle_prefix")]
    pub bundle_prefix: String,
    /// Bundle write budget per round, as a multiple of the node count.
    #[serde(default = "default_bundle_ratio")]
    pub bundle_ratio: f64,
    #[serde(default = "default_period")]
    pub default_period: String,
    #[serde(default = "default_timeout")]
    pub default_timeout: String,
    /// Log bundle operations instead of persisting them.
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub slices: SliceConfig,
    /// Monitors applied at startup, before any control events arrive.
    #[serde(default)]
    pub monitors: Vec<MonitorSpec>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// When off, the fixed pool stays at `replicas` workers.
    #[serde(default)]
    pub hpa: bool,
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    #[serde(default = "default_max_replicas")]
    pub max_replicas: usize,
    /// Target fixed-pool units per worker when sizing under hpa.
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Readiness polls after a scale request before giving up waiting.
    #[serde(default = "default_scale_max_retry")]
    pub scale_max_retry: usize,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SliceConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_slice_name")]
    pub name: String,
    #[serde(default = "default_max_per_slice")]
    pub max_per_slice: usize,
    /// Utilization below which the slice layout gets repacked.
    #[serde(default = "default_rebalance_threshold")]
    pub rebalance_threshold: f64,
}

const fn default_dispatch_interval() -> u64 {
    30
}

fn default_bundle_prefix() -> String {
    "scrape-config".to_owned()
}

const fn default_bundle_ratio() -> f64 {
    2.0
}

fn default_period() -> String {
    "60s".to_owned()
}

fn default_timeout() -> String {
    "30s".to_owned()
}

const fn default_replicas() -> usize {
    1
}

const fn default_max_replicas() -> usize {
    10
}

const fn default_factor() -> f64 {
    600.0
}

const fn default_scale_max_retry() -> usize {
    12
}

fn default_slice_name() -> String {
    "proxy".to_owned()
}

const fn default_max_per_slice() -> usize {
    100
}

const fn default_rebalance_threshold() -> f64 {
    0.5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatch_interval: default_dispatch_interval(),
            dispatch_mode: DispatchMode::default(),
            bundle_prefix: default_bundle_prefix(),
            bundle_ratio: default_bundle_ratio(),
            default_period: default_period(),
            default_timeout: default_timeout(),
            dry_run: false,
            workers: WorkerConfig::default(),
            slices: SliceConfig::default(),
            monitors: Vec::new(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            hpa: false,
            replicas: default_replicas(),
            max_replicas: default_max_replicas(),
            factor: default_factor(),
            scale_max_retry: default_scale_max_retry(),
        }
    }
}

impl Default for SliceConfig {
    fn default() -> Self {
        Self {
            enable: false,
            name: default_slice_name(),
            max_per_slice: default_max_per_slice(),
            rebalance_threshold: default_rebalance_threshold(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}
