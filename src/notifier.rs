use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

/// Poll period used when waiting on slow external operations, e.g. the
/// worker pool reaching its ready count.
pub const WAIT_PERIOD: Duration = Duration::from_secs(5);

const DEFAULT_RATE: Duration = Duration::from_secs(5);

/// Coalesces bursts of change signals into one delayed wake-up.
///
/// `publish` arms (or re-arms) a single-shot timer; when it fires, one
/// permit is stored on the notify handle. Any burst of publishes within the
/// window yields at least one signal and no more than one per window.
pub struct RateBus {
    delay: Duration,
    notify: Arc<Notify>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl RateBus {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            notify: Arc::new(Notify::new()),
            pending: Mutex::new(None),
        }
    }

    pub fn publish(&self) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(handle) = pending.take() {
            handle.abort();
        }

        let notify = Arc::clone(&self.notify);
        let delay = self.delay;
        *pending = Some(tokio::spawn(async move {
            sleep(delay).await;
            notify.notify_one();
        }));
    }

    /// Resolves when the armed timer fires; a permit stored before the call
    /// resolves it immediately.
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

impl Default for RateBus {
    fn default() -> Self {
        Self::new(DEFAULT_RATE)
    }
}

impl Drop for RateBus {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// A once-per-period latch. `due` answers true at most once per period and
/// resets the clock when it does.
pub struct Alarmer {
    period: Duration,
    last: Mutex<Instant>,
}

impl Alarmer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last: Mutex::new(Instant::now()),
        }
    }

    pub fn due(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        if last.elapsed() >= self.period {
            *last = Instant::now();
            return true;
        }
        false
    }
}
