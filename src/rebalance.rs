//! Keeps the proxy service's address slices converged on the node set.
//!
//! Slice membership is sticky: an address already placed in a slice stays
//! there as long as it is still desired, so churn in the node set touches
//! as few slices as possible. A full repack only happens when the slice
//! count is provably wasteful.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cluster::{NodeInventory, SliceStore};
use crate::shutdown::ShutdownSignal;

const SYNC_PERIOD: Duration = Duration::from_secs(180);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressSlice {
    pub name: String,
    pub addresses: Vec<String>,
}

/// What one convergence pass wants done to the stored slices.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub to_sync: Vec<AddressSlice>,
    pub to_delete: BTreeSet<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.to_sync.is_empty() && self.to_delete.is_empty()
    }
}

/// Computes the slice changes needed to cover `desired` addresses.
pub fn plan(
    service_present: bool,
    base: &str,
    existing: &[AddressSlice],
    desired: &[String],
    max_per_slice: usize,
    threshold: f64,
) -> Plan {
    // without the owning service every slice is an orphan
    if !service_present {
        return Plan {
            to_sync: Vec::new(),
            to_delete: existing.iter().map(|s| s.name.clone()).collect(),
        };
    }

    let desired: BTreeSet<&str> = desired.iter().map(String::as_str).collect();
    let max_per_slice = max_per_slice.max(1);
    let needed = desired.len().div_ceil(max_per_slice).max(1);

    if existing.len() > needed
        && (desired.len() as f64) < threshold * (existing.len() * max_per_slice) as f64
    {
        return repack(base, existing, &desired, max_per_slice, needed);
    }

    // fast path: membership already matches and nothing is overfull
    let current: BTreeSet<&str> = existing
        .iter()
        .flat_map(|slice| slice.addresses.iter().map(String::as_str))
        .collect();
    let current_total: usize = existing.iter().map(|slice| slice.addresses.len()).sum();
    let within_bounds = existing
        .iter()
        .all(|slice| slice.addresses.len() <= max_per_slice);
    if current == desired && current_total == desired.len() && within_bounds {
        return Plan::default();
    }

    incremental(base, existing, &desired, max_per_slice)
}

/// Squeezes the desired set into the minimal slice count, reusing the
/// lowest base-indexed names.
fn repack(
    base: &str,
    existing: &[AddressSlice],
    desired: &BTreeSet<&str>,
    max_per_slice: usize,
    needed: usize,
) -> Plan {
    let mut packed = Vec::with_capacity(needed);
    let mut addresses = desired.iter().map(|addr| addr.to_string());
    for index in 0..needed {
        packed.push(AddressSlice {
            name: format!("{base}-{index}"),
            addresses: addresses.by_ref().take(max_per_slice).collect(),
        });
    }

    let kept: BTreeSet<&str> = packed.iter().map(|slice| slice.name.as_str()).collect();
    let to_delete = existing
        .iter()
        .filter(|slice| !kept.contains(slice.name.as_str()))
        .map(|slice| slice.name.clone())
        .collect();

    // a reused slice that already holds exactly its packed share stays put
    let to_sync = packed
        .into_iter()
        .filter(|slice| existing.iter().all(|e| *e != *slice))
        .collect();

    Plan { to_sync, to_delete }
}

fn incremental(
    base: &str,
    existing: &[AddressSlice],
    desired: &BTreeSet<&str>,
    max_per_slice: usize,
) -> Plan {
    // drop departed addresses and duplicates, keeping first placement
    let mut assigned: BTreeSet<&str> = BTreeSet::new();
    let mut slices: Vec<(AddressSlice, Vec<String>)> = existing
        .iter()
        .map(|slice| {
            let kept = slice
                .addresses
                .iter()
                .filter(|addr| desired.contains(addr.as_str()) && assigned.insert(addr.as_str()))
                .cloned()
                .collect::<Vec<_>>();
            (slice.clone(), kept)
        })
        .collect();

    let mut remaining: std::collections::VecDeque<String> = desired
        .iter()
        .filter(|addr| !assigned.contains(*addr))
        .map(|addr| addr.to_string())
        .collect();

    // fill the fullest slices first so the emptiest can be retired
    slices.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.name.cmp(&b.0.name)));

    let mut plan = Plan::default();
    for (original, mut kept) in slices {
        // an overfull slice sheds its tail back into the unplaced pool
        if kept.len() > max_per_slice {
            remaining.extend(kept.split_off(max_per_slice));
        }

        while kept.len() < max_per_slice {
            match remaining.pop_front() {
                Some(addr) => kept.push(addr),
                None => break,
            }
        }

        if kept.is_empty() {
            plan.to_delete.insert(original.name);
        } else if kept != original.addresses {
            plan.to_sync.push(AddressSlice {
                name: original.name,
                addresses: kept,
            });
        }
    }

    // brand-new slices continue the numbering after the highest live index
    let mut next_index = max_index(base, existing).map_or(0, |idx| idx + 1);
    while !remaining.is_empty() {
        let take = remaining.len().min(max_per_slice);
        let addresses = remaining.drain(..take).collect();
        plan.to_sync.push(AddressSlice {
            name: format!("{base}-{next_index}"),
            addresses,
        });
        next_index += 1;
    }

    plan
}

fn max_index(base: &str, existing: &[AddressSlice]) -> Option<usize> {
    let prefix = format!("{base}-");
    existing
        .iter()
        .filter_map(|slice| slice.name.strip_prefix(&prefix))
        .filter_map(|suffix| suffix.parse::<usize>().ok())
        .max()
}

/// Periodically replans the stored slices against the node inventory.
pub struct Rebalancer {
    base: String,
    max_per_slice: usize,
    threshold: f64,
    nodes: Arc<dyn NodeInventory>,
    store: Arc<dyn SliceStore>,
}

impl Rebalancer {
    pub fn new(
        base: String,
        max_per_slice: usize,
        threshold: f64,
        nodes: Arc<dyn NodeInventory>,
        store: Arc<dyn SliceStore>,
    ) -> Self {
        Self {
            base,
            max_per_slice,
            threshold,
            nodes,
            store,
        }
    }

    pub async fn sync_once(&self) -> crate::Result<()> {
        let service_present = self.store.service_exists().await?;
        let existing = self.store.list().await?;
        let desired = self.nodes.addresses();

        let plan = plan(
            service_present,
            &self.base,
            &existing,
            &desired,
            self.max_per_slice,
            self.threshold,
        );
        if plan.is_empty() {
            return Ok(());
        }

        info!(
            message = "rebalancing address slices",
            syncs = plan.to_sync.len(),
            deletes = plan.to_delete.len(),
            addresses = desired.len()
        );
        for slice in plan.to_sync {
            self.store.sync(slice).await?;
        }
        for name in plan.to_delete {
            self.store.delete(&name).await?;
        }
        Ok(())
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(SYNC_PERIOD);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,

                _ = ticker.tick() => {
                    if let Err(err) = self.sync_once().await {
                        warn!(message = "slice sync failed", ?err);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cluster::{MemorySliceStore, StaticNodes};
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;

    fn slice(name: &str, addresses: &[&str]) -> AddressSlice {
        AddressSlice {
            name: name.into(),
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn absent_service_deletes_everything() {
        let existing = vec![slice("proxy-0", &["10.0.0.1"]), slice("proxy-1", &["10.0.0.2"])];
        let plan = plan(false, "proxy", &existing, &addrs(&["10.0.0.1"]), 2, 0.5);
        assert!(plan.to_sync.is_empty());
        assert_eq!(
            plan.to_delete,
            BTreeSet::from(["proxy-0".to_string(), "proxy-1".to_string()])
        );
    }

    #[test]
    fn converged_state_is_untouched() {
        let existing = vec![slice("proxy-0", &["10.0.0.1", "10.0.0.2"])];
        let plan = plan(
            true,
            "proxy",
            &existing,
            &addrs(&["10.0.0.1", "10.0.0.2"]),
            2,
            0.5,
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn departed_addresses_are_filtered() {
        let existing = vec![slice("proxy-0", &["10.0.0.1", "10.0.0.2"])];
        let plan = plan(true, "proxy", &existing, &addrs(&["10.0.0.1"]), 2, 0.4);
        assert_eq!(plan.to_sync, vec![slice("proxy-0", &["10.0.0.1"])]);
        assert!(plan.to_delete.is_empty());
    }

    #[test]
    fn emptied_slices_are_deleted() {
        let existing = vec![
            slice("proxy-0", &["10.0.0.1", "10.0.0.2"]),
            slice("proxy-1", &["10.0.0.3"]),
        ];
        let plan = plan(
            true,
            "proxy",
            &existing,
            &addrs(&["10.0.0.1", "10.0.0.2"]),
            2,
            0.5,
        );
        assert!(plan.to_sync.is_empty());
        assert_eq!(plan.to_delete, BTreeSet::from(["proxy-1".to_string()]));
    }

    #[test]
    fn new_addresses_fill_the_fullest_slice_first() {
        let existing = vec![
            slice("proxy-0", &["10.0.0.1"]),
            slice("proxy-1", &["10.0.0.2", "10.0.0.3"]),
        ];
        let plan = plan(
            true,
            "proxy",
            &existing,
            &addrs(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]),
            3,
            0.4,
        );

        // proxy-1 is fuller, so it takes the newcomer
        assert_eq!(
            plan.to_sync,
            vec![slice("proxy-1", &["10.0.0.2", "10.0.0.3", "10.0.0.4"])]
        );
        assert!(plan.to_delete.is_empty());
    }

    #[test]
    fn same_count_swap_syncs_in_place() {
        let existing = vec![slice("proxy-0", &["10.0.0.1", "10.0.0.2", "10.0.0.3"])];
        let plan = plan(
            true,
            "proxy",
            &existing,
            &addrs(&["10.0.0.1", "10.0.0.2", "10.0.0.4"]),
            3,
            0.5,
        );

        assert_eq!(
            plan.to_sync,
            vec![slice("proxy-0", &["10.0.0.1", "10.0.0.2", "10.0.0.4"])]
        );
        assert!(plan.to_delete.is_empty());
    }

    #[test]
    fn emptied_slice_takes_the_newcomers_in_the_same_pass() {
        let existing = vec![
            slice("proxy-0", &["10.0.0.1", "10.0.0.2", "10.0.0.3"]),
            slice("proxy-1", &["10.0.0.4", "10.0.0.5"]),
        ];
        let plan = plan(
            true,
            "proxy",
            &existing,
            &addrs(&[
                "10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.7", "10.0.0.8", "10.0.0.9",
            ]),
            3,
            0.5,
        );

        // proxy-1 loses both members but is refilled, not deleted
        assert_eq!(
            plan.to_sync,
            vec![slice("proxy-1", &["10.0.0.7", "10.0.0.8", "10.0.0.9"])]
        );
        assert!(plan.to_delete.is_empty());
    }

    #[test]
    fn overfull_slice_is_trimmed_to_capacity() {
        let existing = vec![slice("proxy-0", &["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"])];
        let plan = plan(
            true,
            "proxy",
            &existing,
            &addrs(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]),
            3,
            0.5,
        );

        assert_eq!(
            plan.to_sync,
            vec![
                slice("proxy-0", &["10.0.0.1", "10.0.0.2", "10.0.0.3"]),
                slice("proxy-1", &["10.0.0.4"]),
            ]
        );
        assert!(plan.to_delete.is_empty());
    }

    #[test]
    fn overflow_creates_slices_after_the_highest_index() {
        let existing = vec![slice("proxy-3", &["10.0.0.1", "10.0.0.2"])];
        let plan = plan(
            true,
            "proxy",
            &existing,
            &addrs(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"]),
            2,
            0.9,
        );

        assert_eq!(
            plan.to_sync,
            vec![
                slice("proxy-4", &["10.0.0.3", "10.0.0.4"]),
                slice("proxy-5", &["10.0.0.5"]),
            ]
        );
    }

    #[test]
    fn duplicates_across_slices_are_collapsed() {
        let existing = vec![
            slice("proxy-0", &["10.0.0.1"]),
            slice("proxy-1", &["10.0.0.1"]),
        ];
        let plan = plan(true, "proxy", &existing, &addrs(&["10.0.0.1"]), 2, 0.4);
        assert!(plan.to_sync.is_empty());
        assert_eq!(plan.to_delete, BTreeSet::from(["proxy-1".to_string()]));
    }

    #[test]
    fn underutilized_layout_is_repacked() {
        // 3 slices of capacity 10 holding 4 addresses: 4/30 < 0.5
        let existing = vec![
            slice("proxy-0", &["10.0.0.1"]),
            slice("proxy-1", &["10.0.0.2", "10.0.0.3"]),
            slice("proxy-2", &["10.0.0.4"]),
        ];
        let plan = plan(
            true,
            "proxy",
            &existing,
            &addrs(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]),
            10,
            0.5,
        );

        assert_eq!(plan.to_sync.len(), 1);
        assert_eq!(plan.to_sync[0].name, "proxy-0");
        assert_eq!(plan.to_sync[0].addresses.len(), 4);
        assert_eq!(
            plan.to_delete,
            BTreeSet::from(["proxy-1".to_string(), "proxy-2".to_string()])
        );
    }

    #[test]
    fn utilization_above_threshold_avoids_repack() {
        // 2 slices of capacity 2 holding 3 addresses: 3/4 >= 0.5
        let existing = vec![
            slice("proxy-0", &["10.0.0.1", "10.0.0.2"]),
            slice("proxy-1", &["10.0.0.3"]),
        ];
        let plan = plan(
            true,
            "proxy",
            &existing,
            &addrs(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]),
            2,
            0.5,
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn plans_are_idempotent() {
        let existing = vec![
            slice("proxy-0", &["10.0.0.1", "10.0.0.9"]),
            slice("proxy-1", &["10.0.0.2"]),
        ];
        let desired = addrs(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let first = plan(true, "proxy", &existing, &desired, 2, 0.4);

        // apply the plan to the starting state
        let mut state: BTreeMap<String, AddressSlice> = existing
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        for s in &first.to_sync {
            state.insert(s.name.clone(), s.clone());
        }
        for name in &first.to_delete {
            state.remove(name);
        }

        let after: Vec<AddressSlice> = state.into_values().collect();
        let second = plan(true, "proxy", &after, &desired, 2, 0.4);
        assert!(second.is_empty(), "second pass produced {second:?}");
    }

    #[tokio::test]
    async fn sync_once_writes_the_plan() {
        let nodes = Arc::new(StaticNodes::new(
            vec![
                ("node-a".into(), "10.0.0.1".into()),
                ("node-b".into(), "10.0.0.2".into()),
            ],
            vec![],
        ));
        let store = Arc::new(MemorySliceStore::new());
        let rebalancer = Rebalancer::new("proxy".into(), 10, 0.5, nodes, store.clone());

        rebalancer.sync_once().await.unwrap();
        {
            let slices = store.slices.lock().unwrap();
            assert_eq!(slices.len(), 1);
            assert_eq!(slices["proxy-0"].addresses, addrs(&["10.0.0.1", "10.0.0.2"]));
        }

        // converged: the second pass must not touch the store
        rebalancer.sync_once().await.unwrap();
        assert_eq!(store.syncs.load(Ordering::Relaxed), 1);
    }
}
