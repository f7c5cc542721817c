use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use crate::error::STORAGE_UNAVAILABLE;
use crate::{AppError, AppResult};

struct LiveHandle {
    id: u64,
    version: i64,
    version_change: watch::Sender<Option<i64>>,
}

/// Open handles on one database plus the upgrades queued behind them.
#[derive(Default)]
struct Slot {
    handles: Vec<LiveHandle>,
    upgrades: Vec<(u64, i64)>,
}

impl Slot {
    fn is_empty(&self) -> bool {
        self.handles.is_empty() && self.upgrades.is_empty()
    }

    /// An open may register once no handle is older than it and no queued
    /// upgrade is newer.
    fn admits(&self, version: i64) -> bool {
        self.handles.iter().all(|h| h.version >= version)
            && self.upgrades.iter().all(|&(_, v)| v <= version)
    }
}

#[derive(Default)]
struct CoordinatorInner {
    live: Mutex<HashMap<String, Slot>>,
    released: Notify,
    next_id: AtomicU64,
}

/// Serialises schema upgrades across execution contexts that share one
/// database. Every open handle registers here; an open at a newer version asks
/// older handles to close and waits until they have. Opens at or below a
/// queued upgrade's version wait behind it.
#[derive(Clone, Default)]
pub struct SchemaCoordinator {
    inner: Arc<CoordinatorInner>,
}

/// Live registration of one open handle. Dropping it releases the slot and
/// wakes any blocked opener.
pub struct Registration {
    coordinator: SchemaCoordinator,
    name: String,
    id: u64,
    version_change: watch::Receiver<Option<i64>>,
}

impl Registration {
    /// Receives `Some(version)` once a newer open is waiting for this handle
    /// to close.
    pub fn version_change(&self) -> watch::Receiver<Option<i64>> {
        self.version_change.clone()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.coordinator.release(&self.name, self.id);
    }
}

/// Queue entry for an upgrade in progress; removed on success, timeout or
/// cancellation.
struct QueuedUpgrade {
    coordinator: SchemaCoordinator,
    name: String,
    id: u64,
}

impl Drop for QueuedUpgrade {
    fn drop(&mut self) {
        self.coordinator.dequeue(&self.name, self.id);
    }
}

impl SchemaCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.inner.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Versions of the handles currently open against `name`.
    pub fn live_versions(&self, name: &str) -> Vec<i64> {
        self.live()
            .get(name)
            .map(|slot| slot.handles.iter().map(|h| h.version).collect())
            .unwrap_or_default()
    }

    /// Versions of the upgrades waiting on `name`.
    pub fn queued_upgrades(&self, name: &str) -> Vec<i64> {
        self.live()
            .get(name)
            .map(|slot| slot.upgrades.iter().map(|&(_, v)| v).collect())
            .unwrap_or_default()
    }

    pub async fn acquire(
        &self,
        name: &str,
        version: i64,
        timeout: Duration,
    ) -> AppResult<Registration> {
        let deadline = tokio::time::Instant::now() + timeout;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let mut queued: Option<QueuedUpgrade> = None;
        let mut announced = false;

        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let registered = {
                let mut live = self.live();
                let slot = live.entry(name.to_string()).or_default();
                slot.upgrades.retain(|&(queued_id, _)| queued_id != id);
                if slot.admits(version) {
                    let (tx, rx) = watch::channel(None);
                    slot.handles.push(LiveHandle {
                        id,
                        version,
                        version_change: tx,
                    });
                    Some(rx)
                } else {
                    let stale: Vec<&LiveHandle> =
                        slot.handles.iter().filter(|h| h.version < version).collect();
                    for handle in &stale {
                        handle.version_change.send_replace(Some(version));
                        if !announced {
                            warn!(
                                target: "handreceipt",
                                event = "schema_version_change_blocking",
                                db = %name,
                                live_version = handle.version,
                                requested_version = version
                            );
                        }
                    }
                    let upgrading = !stale.is_empty();
                    if upgrading {
                        slot.upgrades.push((id, version));
                    }
                    if !announced {
                        info!(
                            target: "handreceipt",
                            event = "schema_open_blocked",
                            db = %name,
                            waiting_on = stale.len(),
                            behind_upgrade = !upgrading,
                            requested_version = version
                        );
                        announced = true;
                    }
                    if upgrading && queued.is_none() {
                        queued = Some(QueuedUpgrade {
                            coordinator: self.clone(),
                            name: name.to_string(),
                            id,
                        });
                    }
                    None
                }
            };

            if let Some(version_change) = registered {
                return Ok(Registration {
                    coordinator: self.clone(),
                    name: name.to_string(),
                    id,
                    version_change,
                });
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                warn!(
                    target: "handreceipt",
                    event = "schema_open_timeout",
                    db = %name,
                    requested_version = version,
                    timeout_ms = timeout.as_millis() as u64
                );
                return Err(AppError::new(
                    STORAGE_UNAVAILABLE,
                    "Other connections to the database did not make way in time.",
                )
                .with_context("db", name)
                .with_context("requested_version", version.to_string()));
            }
        }
    }

    fn release(&self, name: &str, id: u64) {
        self.remove(name, |slot| slot.handles.retain(|h| h.id != id));
    }

    fn dequeue(&self, name: &str, id: u64) {
        self.remove(name, |slot| {
            slot.upgrades.retain(|&(queued_id, _)| queued_id != id)
        });
    }

    fn remove(&self, name: &str, f: impl FnOnce(&mut Slot)) {
        {
            let mut live = self.live();
            if let Some(slot) = live.get_mut(name) {
                f(slot);
                if slot.is_empty() {
                    live.remove(name);
                }
            }
        }
        self.inner.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_version_handles_coexist() {
        let coordinator = SchemaCoordinator::new();
        let a = coordinator
            .acquire("db", 2, Duration::from_millis(50))
            .await
            .expect("first");
        let b = coordinator
            .acquire("db", 2, Duration::from_millis(50))
            .await
            .expect("second");
        assert_eq!(coordinator.live_versions("db"), vec![2, 2]);
        drop(a);
        drop(b);
        assert!(coordinator.live_versions("db").is_empty());
    }

    #[tokio::test]
    async fn newer_open_waits_for_release() {
        let coordinator = SchemaCoordinator::new();
        let old = coordinator
            .acquire("db", 1, Duration::from_millis(50))
            .await
            .expect("old");
        let mut signal = old.version_change();

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .acquire("db", 2, Duration::from_secs(5))
                    .await
                    .map(|_| ())
            })
        };

        signal.changed().await.expect("version change delivered");
        assert_eq!(*signal.borrow(), Some(2));
        drop(old);

        waiter.await.expect("join").expect("upgrade proceeds");
    }

    #[tokio::test]
    async fn same_version_open_waits_behind_a_queued_upgrade() {
        let coordinator = SchemaCoordinator::new();
        let old = coordinator
            .acquire("db", 1, Duration::from_millis(50))
            .await
            .expect("old");
        let mut signal = old.version_change();

        let upgrade = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .acquire("db", 2, Duration::from_secs(5))
                    .await
                    .map(|registration| registration.id)
            })
        };
        signal.changed().await.expect("version change delivered");
        assert_eq!(coordinator.queued_upgrades("db"), vec![2]);

        let late = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .acquire("db", 1, Duration::from_secs(5))
                    .await
                    .map(|registration| registration.id)
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!late.is_finished());
        assert_eq!(coordinator.live_versions("db"), vec![1]);

        drop(old);
        upgrade.await.expect("join").expect("upgrade proceeds");
        late.await.expect("join").expect("late open proceeds");
        assert!(coordinator.queued_upgrades("db").is_empty());
        assert!(coordinator.live_versions("db").is_empty());
    }

    #[tokio::test]
    async fn timed_out_upgrade_leaves_the_queue() {
        let coordinator = SchemaCoordinator::new();
        let _old = coordinator
            .acquire("db", 1, Duration::from_millis(50))
            .await
            .expect("old");
        coordinator
            .acquire("db", 2, Duration::from_millis(30))
            .await
            .err()
            .expect("times out");
        assert!(coordinator.queued_upgrades("db").is_empty());
        coordinator
            .acquire("db", 1, Duration::from_millis(50))
            .await
            .expect("same version admitted again");
        assert_eq!(coordinator.live_versions("db"), vec![1]);
    }

    #[tokio::test]
    async fn unreleased_handle_times_out() {
        let coordinator = SchemaCoordinator::new();
        let _old = coordinator
            .acquire("db", 1, Duration::from_millis(50))
            .await
            .expect("old");
        let err = coordinator
            .acquire("db", 2, Duration::from_millis(50))
            .await
            .err()
            .expect("times out");
        assert_eq!(err.code(), STORAGE_UNAVAILABLE);
    }
}
