use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use twox_hash::XxHash64;

use super::{ConfigUnit, Labels};

pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Digest of a target's namespace plus its sorted label set; two passes
/// over an unchanged target produce the same key.
pub fn digest(namespace: &str, labels: &Labels) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(namespace.as_bytes());
    for (name, value) in labels {
        hasher.write(name.as_bytes());
        hasher.write(value.as_bytes());
    }
    hasher.finish()
}

struct CacheEntry {
    unit: ConfigUnit,
    at: Instant,
}

/// TTL cache of materialized units keyed by label digest, letting the
/// materializer skip relabeling and serialization for unchanged targets.
pub struct TargetCache {
    ttl: Duration,
    entries: Mutex<HashMap<u64, CacheEntry>>,
}

impl TargetCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: u64) -> Option<ConfigUnit> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&key)?;
        if entry.at.elapsed() >= self.ttl {
            entries.remove(&key);
            return None;
        }

        entry.at = Instant::now();
        Some(entry.unit.clone())
    }

    pub fn put(&self, key: u64, unit: ConfigUnit) {
        self.entries.lock().unwrap().insert(
            key,
            CacheEntry {
                unit,
                at: Instant::now(),
            },
        );
    }

    /// Removes expired entries; called from the instance loop.
    pub fn sweep(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_key, entry| entry.at.elapsed() < self.ttl);
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TargetCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::advance;

    use super::*;
    use crate::discover::{MonitorMeta, TaskType};

    fn unit(address: &str) -> ConfigUnit {
        ConfigUnit {
            meta: MonitorMeta::default(),
            node: "node-1".into(),
            filename: format!("f-{address}"),
            address: address.into(),
            scheme: "http".into(),
            path: "/metrics".into(),
            mask: "0".into(),
            namespace: "default".into(),
            task_type: TaskType::Fixed,
            anti_affinity: false,
            data: address.as_bytes().to_vec(),
        }
    }

    #[test]
    fn digest_ignores_label_insertion_order() {
        let a = Labels::from([
            ("x".to_string(), "1".to_string()),
            ("y".to_string(), "2".to_string()),
        ]);
        let mut b = Labels::new();
        b.insert("y".into(), "2".into());
        b.insert("x".into(), "1".into());

        assert_eq!(digest("ns", &a), digest("ns", &b));
        assert_ne!(digest("ns", &a), digest("other", &a));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = TargetCache::new(Duration::from_secs(600));
        cache.put(1, unit("10.0.0.1:80"));

        advance(Duration::from_secs(599)).await;
        assert!(cache.get(1).is_some());

        // the hit refreshed the entry
        advance(Duration::from_secs(599)).await;
        assert!(cache.get(1).is_some());

        advance(Duration::from_secs(600)).await;
        assert!(cache.get(1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_expired_entries() {
        let cache = TargetCache::new(Duration::from_secs(600));
        cache.put(1, unit("10.0.0.1:80"));
        cache.put(2, unit("10.0.0.2:80"));

        advance(Duration::from_secs(300)).await;
        cache.put(3, unit("10.0.0.3:80"));

        advance(Duration::from_secs(300)).await;
        cache.sweep();
        assert_eq!(cache.len(), 1);
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache = TargetCache::default();
        cache.put(1, unit("10.0.0.1:80"));
        cache.clear();
        assert!(cache.is_empty());
    }
}
