use tokio::sync::{mpsc, watch};

/// Hands out cloneable shutdown signals and waits for every holder to drop
/// theirs before `shutdown` returns, so background tasks are fully drained.
pub struct ShutdownCoordinator {
    trigger: watch::Sender<bool>,
    drain_tx: mpsc::Sender<()>,
    drain_rx: mpsc::Receiver<()>,
}

#[derive(Clone)]
pub struct ShutdownSignal {
    triggered: watch::Receiver<bool>,
    // dropped with the signal, which is what the coordinator waits on
    _drain: mpsc::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (trigger, _) = watch::channel(false);
        let (drain_tx, drain_rx) = mpsc::channel(1);

        Self {
            trigger,
            drain_tx,
            drain_rx,
        }
    }

    pub fn register(&self) -> ShutdownSignal {
        ShutdownSignal {
            triggered: self.trigger.subscribe(),
            _drain: self.drain_tx.clone(),
        }
    }

    /// Fires the signal and waits until all registered holders are gone.
    pub async fn shutdown(mut self) {
        let _ = self.trigger.send(true);
        drop(self.drain_tx);

        while self.drain_rx.recv().await.is_some() {}
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    /// Resolves once shutdown is triggered (or the coordinator is gone).
    pub async fn recv(&mut self) {
        if *self.triggered.borrow() {
            return;
        }

        // an error means the coordinator was dropped, treat it as shutdown
        let _ = self.triggered.changed().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn shutdown_waits_for_holders() {
        let coordinator = ShutdownCoordinator::new();
        let mut signal = coordinator.register();

        let handle = tokio::spawn(async move {
            signal.recv().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        });

        coordinator.shutdown().await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn recv_after_trigger_resolves_immediately() {
        let coordinator = ShutdownCoordinator::new();
        let mut signal = coordinator.register();
        let mut cloned = signal.clone();

        tokio::join!(coordinator.shutdown(), async {
            signal.recv().await;
            drop(signal);
            cloned.recv().await;
            drop(cloned);
        });
    }
}
