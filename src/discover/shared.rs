use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, interval};
use tracing::{debug, warn};

use super::TargetGroup;
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};

const GC_PERIOD: Duration = Duration::from_secs(60);
const STALE_AFTER: Duration = Duration::from_secs(600);

/// Produces raw target batches for one subscription key. One underlying
/// session feeds every consumer interested in the same key.
#[async_trait]
pub trait TargetSource: Send + 'static {
    /// Dedupe key, typically "{role}/{namespace}".
    fn key(&self) -> String;

    async fn run(self: Box<Self>, tx: mpsc::Sender<Vec<TargetGroup>>, shutdown: ShutdownSignal);
}

#[derive(Debug, thiserror::Error)]
pub enum SharedError {
    #[error("shared discovery is not activated")]
    NotActivated,
}

struct Entry {
    group: TargetGroup,
    seen: Instant,
}

/// Per-key batch store with the last upstream update time.
struct Store {
    entries: Mutex<BTreeMap<String, Entry>>,
    updated: AtomicI64,
}

impl Store {
    fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            updated: AtomicI64::new(0),
        }
    }

    fn apply(&self, groups: Vec<TargetGroup>) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        for group in groups {
            entries.insert(group.source.clone(), Entry { group, seen: now });
        }
        self.updated.store(unix_now(), Ordering::Relaxed);
    }

    /// Drops entries that are both empty and unseen for a while, bounding
    /// memory from sources that disappeared.
    fn gc(&self, stale_after: Duration) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|source, entry| {
            let stale = entry.group.targets.is_empty() && entry.seen.elapsed() >= stale_after;
            if stale {
                debug!(message = "dropping idle empty source", source);
            }
            !stale
        });
    }

    fn snapshot(&self) -> (Vec<TargetGroup>, i64) {
        let entries = self.entries.lock().unwrap();
        let groups = entries.values().map(|entry| entry.group.clone()).collect();
        (groups, self.updated.load(Ordering::Relaxed))
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Deduplicates identical discovery subscriptions; `register` starts at
/// most one underlying session per key.
pub struct SharedDiscovery {
    stores: Mutex<HashMap<String, Arc<Store>>>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
    coordinator: Mutex<Option<ShutdownCoordinator>>,
}

impl SharedDiscovery {
    pub fn new() -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
            coordinator: Mutex::new(None),
        }
    }

    /// Opens the process-wide lifecycle; `register` fails before this.
    pub fn activate(&self) {
        let mut coordinator = self.coordinator.lock().unwrap();
        if coordinator.is_none() {
            *coordinator = Some(ShutdownCoordinator::new());
        }
    }

    /// Starts a session for the source's key unless one exists already.
    pub async fn register(&self, source: Box<dyn TargetSource>) -> Result<(), SharedError> {
        let key = source.key();

        let (store, signal) = {
            let coordinator = self.coordinator.lock().unwrap();
            let coordinator = coordinator.as_ref().ok_or(SharedError::NotActivated)?;

            let mut stores = self.stores.lock().unwrap();
            if stores.contains_key(&key) {
                debug!(message = "session already running", key);
                return Ok(());
            }

            let store = Arc::new(Store::new());
            stores.insert(key.clone(), Arc::clone(&store));
            (store, coordinator.register())
        };

        let (tx, rx) = mpsc::channel(16);
        let mut tasks = self.tasks.lock().await;
        tasks.spawn(source.run(tx, signal.clone()));
        tasks.spawn(run_session(key, store, rx, signal));
        Ok(())
    }

    /// Current cached batch for a key plus its last update unix time.
    pub fn fetch(&self, key: &str) -> Option<(Vec<TargetGroup>, i64)> {
        let stores = self.stores.lock().unwrap();
        stores.get(key).map(|store| store.snapshot())
    }

    /// Stops every session and waits for the background work to drain.
    pub async fn deactivate(&self) {
        let coordinator = self.coordinator.lock().unwrap().take();
        if let Some(coordinator) = coordinator {
            coordinator.shutdown().await;
        }

        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
        self.stores.lock().unwrap().clear();
    }
}

impl Default for SharedDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_session(
    key: String,
    store: Arc<Store>,
    mut rx: mpsc::Receiver<Vec<TargetGroup>>,
    mut shutdown: ShutdownSignal,
) {
    let mut gc = interval(GC_PERIOD);
    gc.tick().await;

    let mut open = true;
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,

            _ = gc.tick() => store.gc(STALE_AFTER),

            batch = rx.recv(), if open => match batch {
                Some(groups) => store.apply(groups),
                None => {
                    // a broken upstream stops producing; consumers observe
                    // staleness through the timestamp
                    warn!(message = "upstream feed closed", key);
                    open = false;
                }
            }
        }
    }
}
