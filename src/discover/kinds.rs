//! The four discovery kinds. Each kind is a thin adapter: it subscribes
//! to the raw feed for its role, converts batches into target groups and
//! contributes kind-specific capabilities (auth, node resolution) to the
//! shared materializer.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::warn;

use super::driver::{AuthInfo, DetachedCapabilities, KindCapabilities};
use super::shared::TargetSource;
use super::{ADDRESS_LABEL, Labels, META_LABEL_PREFIX, NODE_META_LABEL, TargetGroup};
use crate::cluster::{
    FeedBatch, FeedHub, MeshInstance, NodeInventory, NodeMatch, ObjectEndpoints, RegistryService,
};
use crate::shutdown::ShutdownSignal;

/// Where a monitor's targets come from.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscoveryKind {
    /// Endpoints of orchestrator objects; targets are owned by nodes.
    ClusterRole,
    /// Services polled from an HTTP registry.
    HttpRegistry {
        #[serde(default)]
        username: String,
        #[serde(default)]
        password: String,
    },
    /// Service records watched in a coordination store.
    CoordinationStore {
        #[serde(default)]
        bearer_token: String,
    },
    /// Instances reported by a service mesh registry.
    MeshRegistry,
}

impl DiscoveryKind {
    pub fn role(&self) -> &'static str {
        match self {
            DiscoveryKind::ClusterRole => "cluster_role",
            DiscoveryKind::HttpRegistry { .. } => "http_registry",
            DiscoveryKind::CoordinationStore { .. } => "coordination_store",
            DiscoveryKind::MeshRegistry => "mesh_registry",
        }
    }

    pub fn capabilities(&self, nodes: Arc<dyn NodeInventory>) -> Arc<dyn KindCapabilities> {
        match self {
            DiscoveryKind::ClusterRole => Arc::new(NodeBoundCapabilities { nodes }),
            DiscoveryKind::HttpRegistry { username, password } => {
                Arc::new(DetachedCapabilities {
                    auth: AuthInfo {
                        username: username.clone(),
                        password: password.clone(),
                        bearer_token: String::new(),
                    },
                })
            }
            DiscoveryKind::CoordinationStore { bearer_token } => Arc::new(DetachedCapabilities {
                auth: AuthInfo {
                    bearer_token: bearer_token.clone(),
                    ..AuthInfo::default()
                },
            }),
            DiscoveryKind::MeshRegistry => Arc::new(DetachedCapabilities {
                auth: AuthInfo::default(),
            }),
        }
    }

    /// Builds the source feeding the shared discovery for one namespace.
    pub fn source(&self, namespace: &str, feeds: &FeedHub) -> Box<dyn TargetSource> {
        Box::new(FeedSource {
            kind: self.clone(),
            namespace: namespace.to_string(),
            rx: feeds.subscribe(self.role(), namespace),
        })
    }
}

/// Targets from this kind belong to cluster nodes; resolution goes
/// through the live inventory.
struct NodeBoundCapabilities {
    nodes: Arc<dyn NodeInventory>,
}

impl KindCapabilities for NodeBoundCapabilities {
    fn resolve_node(&self, name: &str) -> NodeMatch {
        self.nodes.resolve(name)
    }
}

/// Bridges one (role, namespace) feed channel into target groups.
struct FeedSource {
    kind: DiscoveryKind,
    namespace: String,
    rx: mpsc::Receiver<FeedBatch>,
}

#[async_trait]
impl TargetSource for FeedSource {
    fn key(&self) -> String {
        format!("{}/{}", self.kind.role(), self.namespace)
    }

    async fn run(
        mut self: Box<Self>,
        tx: mpsc::Sender<Vec<TargetGroup>>,
        mut shutdown: ShutdownSignal,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,

                batch = self.rx.recv() => {
                    let Some(batch) = batch else { return };
                    let groups = convert(&self.kind, &self.namespace, batch);
                    if tx.send(groups).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn convert(kind: &DiscoveryKind, namespace: &str, batch: FeedBatch) -> Vec<TargetGroup> {
    let role = kind.role();
    match (kind, batch) {
        (DiscoveryKind::ClusterRole, FeedBatch::Objects(objects)) => {
            objects_to_groups(role, namespace, objects)
        }
        (DiscoveryKind::HttpRegistry { .. }, FeedBatch::Registry(services)) => {
            registry_to_groups(role, namespace, services)
        }
        (DiscoveryKind::CoordinationStore { .. }, FeedBatch::KeyValues(records)) => records
            .into_iter()
            .map(|record| record_to_group(role, namespace, &record.key, &record.value))
            .collect(),
        (DiscoveryKind::MeshRegistry, FeedBatch::Instances(instances)) => {
            instances_to_groups(role, namespace, instances)
        }
        (_, batch) => {
            warn!(
                message = "feed batch does not match the discovery kind",
                role,
                namespace,
                batch = ?std::mem::discriminant(&batch)
            );
            Vec::new()
        }
    }
}

fn meta_labels(labels: &Labels) -> Labels {
    labels
        .iter()
        .map(|(name, value)| {
            if name.starts_with("__") {
                (name.clone(), value.clone())
            } else {
                (format!("{META_LABEL_PREFIX}{name}"), value.clone())
            }
        })
        .collect()
}

fn objects_to_groups(
    role: &str,
    namespace: &str,
    objects: Vec<ObjectEndpoints>,
) -> Vec<TargetGroup> {
    objects
        .into_iter()
        .map(|object| {
            let targets = object
                .endpoints
                .iter()
                .map(|endpoint| {
                    let mut labels = meta_labels(&endpoint.labels);
                    labels.insert(
                        ADDRESS_LABEL.to_string(),
                        format!("{}:{}", endpoint.address, endpoint.port),
                    );
                    labels.insert(NODE_META_LABEL.to_string(), endpoint.node.clone());
                    labels
                })
                .collect();

            TargetGroup {
                source: format!("{role}/{namespace}/{}", object.name),
                targets,
                labels: meta_labels(&object.labels),
            }
        })
        .collect()
}

fn registry_to_groups(
    role: &str,
    namespace: &str,
    services: Vec<RegistryService>,
) -> Vec<TargetGroup> {
    services
        .into_iter()
        .map(|service| TargetGroup {
            source: format!("{role}/{namespace}/{}", service.name),
            targets: service
                .addresses
                .iter()
                .map(|address| Labels::from([(ADDRESS_LABEL.to_string(), address.clone())]))
                .collect(),
            labels: meta_labels(&service.labels),
        })
        .collect()
}

/// Payload of a coordination-store service record.
#[derive(Debug, Deserialize)]
struct StoreRecord {
    address: String,
    #[serde(default)]
    labels: Labels,
}

fn record_to_group(role: &str, namespace: &str, key: &str, value: &[u8]) -> TargetGroup {
    // keys can be hierarchical; keep the source shape flat
    let name = key.replace('/', "-");
    let source = format!("{role}/{namespace}/{name}");

    // an empty value marks a deleted key: an empty group retracts the
    // targets previously published under this source
    if value.is_empty() {
        return TargetGroup {
            source,
            targets: Vec::new(),
            labels: Labels::new(),
        };
    }

    match serde_json::from_slice::<StoreRecord>(value) {
        Ok(record) => {
            let mut target = meta_labels(&record.labels);
            target.insert(ADDRESS_LABEL.to_string(), record.address);
            TargetGroup {
                source,
                targets: vec![target],
                labels: Labels::new(),
            }
        }
        Err(err) => {
            warn!(message = "unparsable service record", ?err, key);
            TargetGroup {
                source,
                targets: Vec::new(),
                labels: Labels::new(),
            }
        }
    }
}

fn instances_to_groups(
    role: &str,
    namespace: &str,
    instances: Vec<MeshInstance>,
) -> Vec<TargetGroup> {
    let mut by_service: BTreeMap<String, Vec<Labels>> = BTreeMap::new();
    for instance in instances {
        let targets = by_service.entry(instance.service.clone()).or_default();
        if !instance.healthy {
            continue;
        }
        let mut labels = meta_labels(&instance.metadata);
        labels.insert(
            ADDRESS_LABEL.to_string(),
            format!("{}:{}", instance.host, instance.port),
        );
        targets.push(labels);
    }

    by_service
        .into_iter()
        .map(|(service, targets)| TargetGroup {
            source: format!("{role}/{namespace}/{service}"),
            targets,
            labels: Labels::new(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::EndpointEntry;

    #[test]
    fn kind_tags_deserialize() {
        let kind: DiscoveryKind = serde_yaml::from_str("kind: cluster_role").unwrap();
        assert_eq!(kind, DiscoveryKind::ClusterRole);

        let kind: DiscoveryKind =
            serde_yaml::from_str("kind: http_registry\nusername: scrape\npassword: s3cret")
                .unwrap();
        assert_eq!(kind.role(), "http_registry");
    }

    #[test]
    fn cluster_role_groups_carry_node_and_address() {
        let groups = convert(
            &DiscoveryKind::ClusterRole,
            "monitoring",
            FeedBatch::Objects(vec![ObjectEndpoints {
                namespace: "monitoring".into(),
                name: "node-exporter".into(),
                labels: Labels::from([("app".to_string(), "node-exporter".to_string())]),
                endpoints: vec![EndpointEntry {
                    address: "10.0.0.1".into(),
                    port: 9100,
                    node: "node-1".into(),
                    labels: Labels::new(),
                }],
            }]),
        );

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].source, "cluster_role/monitoring/node-exporter");
        assert_eq!(groups[0].labels.get("__meta_app").unwrap(), "node-exporter");
        assert_eq!(
            groups[0].targets[0].get(ADDRESS_LABEL).unwrap(),
            "10.0.0.1:9100"
        );
        assert_eq!(groups[0].targets[0].get(NODE_META_LABEL).unwrap(), "node-1");
    }

    #[test]
    fn registry_groups_one_per_service() {
        let kind = DiscoveryKind::HttpRegistry {
            username: String::new(),
            password: String::new(),
        };
        let groups = convert(
            &kind,
            "default",
            FeedBatch::Registry(vec![RegistryService {
                name: "api".into(),
                addresses: vec!["10.0.0.1:8080".into(), "10.0.0.2:8080".into()],
                labels: Labels::new(),
            }]),
        );

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].source, "http_registry/default/api");
        assert_eq!(groups[0].targets.len(), 2);
    }

    #[test]
    fn store_records_parse_and_retract() {
        let kind = DiscoveryKind::CoordinationStore {
            bearer_token: String::new(),
        };
        let groups = convert(
            &kind,
            "default",
            FeedBatch::KeyValues(vec![
                crate::cluster::KeyValueRecord {
                    key: "services/api".into(),
                    value: br#"{"address": "10.0.0.1:8080", "labels": {"env": "prod"}}"#.to_vec(),
                },
                crate::cluster::KeyValueRecord {
                    key: "services/gone".into(),
                    value: Vec::new(),
                },
                crate::cluster::KeyValueRecord {
                    key: "services/bad".into(),
                    value: b"{broken".to_vec(),
                },
            ]),
        );

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].source, "coordination_store/default/services-api");
        assert_eq!(
            groups[0].targets[0].get(ADDRESS_LABEL).unwrap(),
            "10.0.0.1:8080"
        );
        assert_eq!(groups[0].targets[0].get("__meta_env").unwrap(), "prod");
        assert!(groups[1].targets.is_empty());
        assert!(groups[2].targets.is_empty());
    }

    #[test]
    fn mesh_groups_filter_unhealthy() {
        let groups = convert(
            &DiscoveryKind::MeshRegistry,
            "default",
            FeedBatch::Instances(vec![
                MeshInstance {
                    service: "api".into(),
                    host: "10.0.0.1".into(),
                    port: 8080,
                    healthy: true,
                    metadata: Labels::new(),
                },
                MeshInstance {
                    service: "api".into(),
                    host: "10.0.0.2".into(),
                    port: 8080,
                    healthy: false,
                    metadata: Labels::new(),
                },
            ]),
        );

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].targets.len(), 1);
        assert_eq!(
            groups[0].targets[0].get(ADDRESS_LABEL).unwrap(),
            "10.0.0.1:8080"
        );
    }

    #[test]
    fn mismatched_batch_is_skipped() {
        let groups = convert(
            &DiscoveryKind::ClusterRole,
            "default",
            FeedBatch::Registry(vec![]),
        );
        assert!(groups.is_empty());
    }

    #[tokio::test]
    async fn feed_source_forwards_converted_batches() {
        let feeds = FeedHub::new();
        let kind = DiscoveryKind::MeshRegistry;
        let source = kind.source("default", &feeds);
        assert_eq!(source.key(), "mesh_registry/default");

        let coordinator = crate::shutdown::ShutdownCoordinator::new();
        let (tx, mut rx) = mpsc::channel(4);
        let handle = tokio::spawn(source.run(tx, coordinator.register()));

        feeds.push(
            "mesh_registry",
            "default",
            FeedBatch::Instances(vec![MeshInstance {
                service: "api".into(),
                host: "10.0.0.1".into(),
                port: 8080,
                healthy: true,
                metadata: Labels::new(),
            }]),
        );

        let groups = rx.recv().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].source, "mesh_registry/default/api");

        coordinator.shutdown().await;
        let _ = handle.await;
    }
}
