use std::collections::BTreeMap;
use std::hash::Hasher;

use serde_yaml::{Mapping, Value};
use twox_hash::XxHash64;

use super::MonitorMeta;

/// Stable 64-bit hash over a unit's owning node, payload bytes and feature
/// mask. Seed zero keeps it deterministic across runs.
pub fn stable_hash(node: &str, data: &[u8], mask: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(node.as_bytes());
    hasher.write(data);
    hasher.write(mask.as_bytes());
    hasher.finish()
}

pub fn hash_str(s: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(s.as_bytes());
    hasher.finish()
}

/// Replaces every non-alphanumeric byte with '-' and collapses doubles, so
/// the result is safe as a file or object name.
fn sanitize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else {
            out.push('-');
        }
    }
    while out.contains("--") {
        out = out.replace("--", "-");
    }
    out
}

/// Task ids must fit a signed 32-bit consumer; fold larger hashes down.
fn fold_task_id(mut n: u64) -> u64 {
    while n > i32::MAX as u64 {
        n /= 50;
    }
    n
}

/// A scrape descriptor with everything resolved, ready to serialize.
#[derive(Clone, Debug, Default)]
pub struct ScrapeTarget {
    pub meta: MonitorMeta,
    pub address: String,
    pub node_name: String,
    pub scheme: String,
    pub path: String,
    pub namespace: String,
    pub routing_id: u32,
    pub period: String,
    pub timeout: String,
    pub proxy_url: String,
    pub username: String,
    pub password: String,
    pub bearer_token: String,
    pub params: BTreeMap<String, Vec<String>>,
    pub labels: BTreeMap<String, String>,
    pub extra_labels: BTreeMap<String, String>,
    pub mask: String,
    pub disable_custom_timestamp: bool,
    pub metric_relabels: Vec<Value>,
}

pub struct Rendered {
    pub filename: String,
    pub hash: u64,
    pub data: Vec<u8>,
}

fn entry(key: &str, value: Value) -> (Value, Value) {
    (Value::String(key.to_string()), value)
}

impl ScrapeTarget {
    fn full_address(&self) -> String {
        if self.address.starts_with("http://") || self.address.starts_with("https://") {
            self.address.clone()
        } else {
            format!("{}://{}", self.scheme, self.address)
        }
    }

    /// Name of the file the payload is shipped under; stable for unchanged
    /// input because it embeds the content hash.
    pub fn file_name(&self, hash: u64) -> String {
        sanitize(&format!(
            "{}-{}-{}-{}-{}",
            self.node_name, self.address, self.path, hash, self.mask
        ))
    }

    fn task_id(&self) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(self.routing_id.to_string().as_bytes());
        hasher.write(self.address.as_bytes());
        hasher.write(self.path.as_bytes());
        for (name, value) in &self.labels {
            hasher.write(name.as_bytes());
            hasher.write(value.as_bytes());
        }
        hasher.write(self.meta.index.to_string().as_bytes());
        hasher.write(self.namespace.as_bytes());
        hasher.write(self.meta.name.as_bytes());
        fold_task_id(hasher.finish())
    }

    fn task_labels(&self) -> Mapping {
        let mut labels = Mapping::new();
        for (name, value) in &self.labels {
            // internal labels never leave the operator
            if name.starts_with("__") && name.ends_with("__") {
                continue;
            }
            labels.insert(Value::String(name.clone()), Value::String(value.clone()));
        }

        labels.insert(
            "scrape_endpoint_url".into(),
            Value::String(self.full_address() + &self.path),
        );
        labels.insert(
            "scrape_endpoint_index".into(),
            Value::String(self.meta.index.to_string()),
        );
        labels.insert("monitor_name".into(), Value::String(self.meta.name.clone()));
        labels.insert(
            "monitor_namespace".into(),
            Value::String(self.meta.namespace.clone()),
        );

        for (name, value) in &self.extra_labels {
            labels.insert(Value::String(name.clone()), Value::String(value.clone()));
        }
        labels
    }

    fn module(&self) -> Mapping {
        let mut module = Mapping::new();
        module.insert("module".into(), "prometheus".into());
        module.insert("period".into(), Value::String(self.period.clone()));
        module.insert("timeout".into(), Value::String(self.timeout.clone()));
        module.insert("proxy_url".into(), Value::String(self.proxy_url.clone()));
        module.insert(
            "disable_custom_timestamp".into(),
            Value::Bool(self.disable_custom_timestamp),
        );
        module.insert(
            "hosts".into(),
            Value::Sequence(vec![Value::String(self.full_address())]),
        );

        if !self.params.is_empty() {
            let mut query = Mapping::new();
            for (key, values) in &self.params {
                query.insert(
                    Value::String(key.clone()),
                    Value::Sequence(values.iter().cloned().map(Value::String).collect()),
                );
            }
            module.insert("query".into(), Value::Mapping(query));
        }

        module.insert("namespace".into(), Value::String(self.namespace.clone()));
        module.insert("metrics_path".into(), Value::String(self.path.clone()));

        if !self.username.is_empty() && !self.password.is_empty() {
            module.insert("username".into(), Value::String(self.username.clone()));
            module.insert("password".into(), Value::String(self.password.clone()));
        }
        if !self.bearer_token.is_empty() {
            module.insert("bearer_token".into(), Value::String(self.bearer_token.clone()));
        }
        if !self.metric_relabels.is_empty() {
            module.insert(
                "metric_relabel_configs".into(),
                Value::Sequence(self.metric_relabels.clone()),
            );
        }
        module
    }

    pub fn yaml_bytes(&self) -> Result<Vec<u8>, serde_yaml::Error> {
        let mut task = Mapping::new();
        task.insert("task_id".into(), Value::Number(self.task_id().into()));
        task.insert("period".into(), Value::String(self.period.clone()));
        task.insert("timeout".into(), Value::String(self.timeout.clone()));
        task.insert(
            "labels".into(),
            Value::Sequence(vec![Value::Mapping(self.task_labels())]),
        );
        task.insert("module".into(), Value::Mapping(self.module()));

        let root = Mapping::from_iter([
            entry("type", "scrape".into()),
            entry("name", Value::String(self.address.clone() + &self.path)),
            entry("version", "1".into()),
            entry("routing_id", Value::Number(self.routing_id.into())),
            entry("tasks", Value::Sequence(vec![Value::Mapping(task)])),
        ]);

        let text = serde_yaml::to_string(&Value::Mapping(root))?;
        Ok(text.into_bytes())
    }

    /// Serializes the descriptor and derives its stable identity.
    pub fn render(&self) -> Result<Rendered, serde_yaml::Error> {
        let data = self.yaml_bytes()?;
        let hash = stable_hash(&self.node_name, &data, &self.mask);
        Ok(Rendered {
            filename: self.file_name(hash),
            hash,
            data,
        })
    }
}
