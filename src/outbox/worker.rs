use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

use super::{Outbox, RemoteClient};

/// Receiving side of a shutdown request. Cheap to clone.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Sending side; dropping it does not count as a shutdown request.
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        shutdown_channel().1
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested.
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Trigger dropped without firing.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Drains the outbox on a fixed interval and whenever connectivity returns.
pub struct SyncWorker {
    outbox: Outbox,
    remote: Arc<dyn RemoteClient>,
    online: Arc<Notify>,
}

impl SyncWorker {
    pub fn new(outbox: Outbox, remote: Arc<dyn RemoteClient>) -> Self {
        Self {
            outbox,
            remote,
            online: Arc::new(Notify::new()),
        }
    }

    /// Handle for the connectivity monitor; `notify_one` wakes the worker for
    /// an immediate drain.
    pub fn online_notifier(&self) -> Arc<Notify> {
        self.online.clone()
    }

    pub fn notify_online(&self) {
        self.online.notify_one();
    }

    pub fn spawn(self, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let interval = self.outbox.config().interval;
        info!(
            target: "handreceipt",
            event = "sync_worker_start",
            interval_secs = interval.as_secs()
        );
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
                _ = self.online.notified() => {}
            }
            if shutdown.is_triggered() {
                break;
            }
            if let Err(err) = self.outbox.drain(self.remote.as_ref(), &shutdown).await {
                error!(target: "handreceipt", event = "sync_worker_drain_failed", error = %err);
            }
        }
        info!(target: "handreceipt", event = "sync_worker_stop");
    }
}
