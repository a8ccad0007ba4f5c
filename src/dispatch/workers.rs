use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::cluster::WorkerScaler;
use crate::config::WorkerConfig;
use crate::notifier::WAIT_PERIOD;

/// Minimum spacing between scale requests; keeps a flapping unit count
/// from thrashing the worker fleet.
const SCALE_MIN_INTERVAL: Duration = Duration::from_secs(120);

/// Worker count the fixed pool should run for `units` scheduled units.
pub fn desired(config: &WorkerConfig, units: usize) -> usize {
    if !config.hpa || units == 0 {
        return config.replicas.max(1);
    }

    let scaled = (units as f64 / config.factor).round() as usize;
    scaled.clamp(1, config.max_replicas).max(config.replicas)
}

/// Tracks the fixed-pool worker fleet and resizes it to fit the load.
pub struct WorkerPool {
    config: WorkerConfig,
    scaler: Arc<dyn WorkerScaler>,
    count: AtomicUsize,
    last_scaled: Mutex<Option<Instant>>,
}

impl WorkerPool {
    pub fn new(config: WorkerConfig, scaler: Arc<dyn WorkerScaler>) -> Self {
        let count = config.replicas.max(1);
        Self {
            config,
            scaler,
            count: AtomicUsize::new(count),
            last_scaled: Mutex::new(None),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Adopts a replica count observed outside our own scale requests.
    pub fn set_count(&self, count: usize) {
        self.count.store(count.max(1), Ordering::Relaxed);
    }

    /// Resizes the fleet for the given unit count and returns the worker
    /// count dispatch should assume for this round.
    pub async fn reconcile(&self, units: usize) -> usize {
        let current = self.count();
        let want = desired(&self.config, units);
        if want == current {
            return current;
        }

        {
            let last_scaled = self.last_scaled.lock().unwrap();
            if let Some(at) = *last_scaled {
                if at.elapsed() < SCALE_MIN_INTERVAL {
                    return current;
                }
            }
        }

        info!(message = "scaling workers", from = current, to = want, units);
        if let Err(err) = self.scaler.scale(want).await {
            warn!(message = "scale request failed", ?err);
            return current;
        }
        *self.last_scaled.lock().unwrap() = Some(Instant::now());

        // wait for readiness, but never hold a dispatch round hostage
        for _attempt in 0..self.config.scale_max_retry {
            match self.scaler.ready_replicas().await {
                Ok(ready) if ready == want => {
                    self.count.store(want, Ordering::Relaxed);
                    return want;
                }
                Ok(_) => {}
                Err(err) => warn!(message = "readiness check failed", ?err),
            }
            tokio::time::sleep(WAIT_PERIOD).await;
        }

        warn!(message = "workers not ready in time, dispatching anyway", want);
        self.count.store(want, Ordering::Relaxed);
        want
    }
}
