use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::db::{Database, IndexRange, StoreTx, TxMode};
use crate::error::{
    AUTH_REQUIRED, CLIENT_REJECTED, IDEMPOTENCY_CONFLICT, NETWORK_ERROR, SERVER_ERROR, VALIDATION,
};
use crate::id::{new_idempotency_key, new_uuid_v7};
use crate::model::Entity;
use crate::table::{IndexValue, Table};
use crate::time::now_ms;
use crate::{AppError, AppResult};

pub mod remote;
pub mod worker;

pub use remote::{HttpRemote, RemoteClient, RemoteError, RemoteRequest, RemoteResponse};
pub use worker::{shutdown_channel, ShutdownSignal, ShutdownTrigger, SyncWorker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePayload {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// A mutation the remote API should eventually see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAction {
    #[serde(rename = "type")]
    pub kind: String,
    /// Entity the action targets, e.g. `maintenance_items:m_1`. Actions that
    /// share a key are replayed strictly in enqueue order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_key: Option<String>,
    pub payload: RemotePayload,
    /// Kept verbatim when supplied; generated otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl RemoteAction {
    pub fn new(kind: impl Into<String>, method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            entity_key: None,
            payload: RemotePayload {
                method,
                url: url.into(),
                body: None,
            },
            idempotency_key: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.payload.body = Some(body);
        self
    }

    pub fn for_entity(mut self, table: Table, id: &str) -> Self {
        self.entity_key = Some(format!("{}:{}", table.name(), id));
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Syncing,
    Failed,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Syncing => "syncing",
            EntryStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_key: Option<String>,
    pub payload: RemotePayload,
    pub idempotency_key: String,
    /// Epoch milliseconds; strictly increasing per outbox.
    pub timestamp: i64,
    pub status: EntryStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl OutboxEntry {
    fn is_due(&self, now: i64) -> bool {
        self.status == EntryStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

impl Entity for OutboxEntry {
    const TABLE: Table = Table::Outbox;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_value(&self, column: &str) -> IndexValue {
        match column {
            "timestamp" => self.timestamp.into(),
            "status" => self.status.as_str().into(),
            "idempotency_key" => (&self.idempotency_key).into(),
            "entity_key" => self.entity_key.as_deref().into(),
            _ => IndexValue::Null,
        }
    }
}

/// What the UI needs for a "will sync when online" indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxStatus {
    pub pending: u64,
    pub syncing: u64,
    pub failed: u64,
    pub auth_required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Another drain was already running; nothing was attempted.
    pub skipped: bool,
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    /// Entries held back behind an earlier entry for the same entity.
    pub deferred: usize,
    pub auth_required: bool,
    pub cancelled: bool,
}

/// How one replay attempt ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Delivered { replayed: bool },
    Retry(AppError),
    Reject(AppError),
    AuthRequired,
}

pub fn classify(result: &Result<RemoteResponse, RemoteError>) -> Disposition {
    let response = match result {
        Ok(response) => response,
        Err(err @ (RemoteError::Network(_) | RemoteError::Timeout)) => {
            return Disposition::Retry(AppError::new(NETWORK_ERROR, err.to_string()));
        }
        Err(err @ RemoteError::InvalidRequest(_)) => {
            return Disposition::Reject(AppError::new(CLIENT_REJECTED, err.to_string()));
        }
    };
    match response.status {
        200..=299 => Disposition::Delivered {
            replayed: response.idempotent_replayed,
        },
        409 if response.idempotent_replayed => Disposition::Delivered { replayed: true },
        401 => Disposition::AuthRequired,
        500..=599 => Disposition::Retry(
            AppError::new(SERVER_ERROR, "Server error.")
                .with_context("status", response.status.to_string()),
        ),
        status => Disposition::Reject(
            AppError::new(CLIENT_REJECTED, "Request rejected by the server.")
                .with_context("status", status.to_string()),
        ),
    }
}

/// Delay before the `attempt`-th retry: `base * 2^(attempt-1)`, capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}

/// Held while a drain runs; a second drain sees the flag and backs off.
struct DrainGuard {
    flag: Arc<AtomicBool>,
}

impl DrainGuard {
    fn begin(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag: flag.clone() })
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

struct OutboxInner {
    db: Database,
    config: SyncConfig,
    last_timestamp: Mutex<i64>,
    draining: Arc<AtomicBool>,
    auth_required: AtomicBool,
    status: watch::Sender<OutboxStatus>,
}

/// Durable queue of remote mutations with an ordered, single-flight replay.
#[derive(Clone)]
pub struct Outbox {
    inner: Arc<OutboxInner>,
}

fn not_found(id: &str) -> AppError {
    AppError::not_found(Table::Outbox.name(), id)
}

async fn ordered_entries(tx: &mut StoreTx) -> AppResult<Vec<OutboxEntry>> {
    tx.get_all_by_index_range::<OutboxEntry>("by-timestamp", IndexRange::default())
        .await
}

impl Outbox {
    pub async fn new(db: Database, config: SyncConfig) -> AppResult<Self> {
        db.ensure_available(Table::Outbox)?;
        let mut tx = db.begin(&[Table::Outbox], TxMode::ReadOnly).await?;
        let result = ordered_entries(&mut tx).await;
        let entries = tx.finish(result).await?;
        let last = entries.last().map(|e| e.timestamp).unwrap_or(0);

        let (status, _) = watch::channel(OutboxStatus::default());
        let outbox = Self {
            inner: Arc::new(OutboxInner {
                db,
                config,
                last_timestamp: Mutex::new(last),
                draining: Arc::new(AtomicBool::new(false)),
                auth_required: AtomicBool::new(false),
                status,
            }),
        };
        outbox.refresh_status().await?;
        Ok(outbox)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    fn next_timestamp(&self) -> i64 {
        let mut last = self
            .inner
            .last_timestamp
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let next = now_ms().max(*last + 1);
        *last = next;
        next
    }

    /// Queues `action` inside the caller's transaction so the entry commits
    /// together with the local write it mirrors. Call
    /// [`Outbox::refresh_status`] after the commit.
    pub async fn enqueue_in(&self, tx: &mut StoreTx, action: RemoteAction) -> AppResult<OutboxEntry> {
        if action.payload.url.trim().is_empty() {
            return Err(AppError::new(VALIDATION, "Remote action needs a URL.")
                .with_context("type", action.kind));
        }
        let entry = OutboxEntry {
            id: new_uuid_v7(),
            kind: action.kind,
            entity_key: action.entity_key,
            payload: action.payload,
            idempotency_key: action
                .idempotency_key
                .filter(|k| !k.trim().is_empty())
                .unwrap_or_else(new_idempotency_key),
            timestamp: self.next_timestamp(),
            status: EntryStatus::Pending,
            retry_count: 0,
            next_attempt_at: None,
            last_error: None,
        };
        tx.insert(&entry).await?;
        info!(
            target: "handreceipt",
            event = "outbox_enqueue",
            id = %entry.id,
            kind = %entry.kind,
            timestamp = entry.timestamp
        );
        Ok(entry)
    }

    pub async fn enqueue(&self, action: RemoteAction) -> AppResult<OutboxEntry> {
        let mut tx = self.inner.db.begin(&[Table::Outbox], TxMode::ReadWrite).await?;
        let result = self.enqueue_in(&mut tx, action).await;
        let entry = tx.finish(result).await?;
        self.refresh_status().await?;
        Ok(entry)
    }

    /// Every entry in replay order.
    pub async fn entries(&self) -> AppResult<Vec<OutboxEntry>> {
        let mut tx = self.inner.db.begin(&[Table::Outbox], TxMode::ReadOnly).await?;
        let result = ordered_entries(&mut tx).await;
        tx.finish(result).await
    }

    pub async fn pending_entries(&self) -> AppResult<Vec<OutboxEntry>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.status == EntryStatus::Pending)
            .collect())
    }

    /// Entries parked for manual resolution.
    pub async fn failed_entries(&self) -> AppResult<Vec<OutboxEntry>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.status == EntryStatus::Failed)
            .collect())
    }

    /// Puts a failed entry back in the queue with fresh counters.
    pub async fn retry(&self, id: &str) -> AppResult<OutboxEntry> {
        let mut tx = self.inner.db.begin(&[Table::Outbox], TxMode::ReadWrite).await?;
        let result = async {
            let mut entry = tx.get::<OutboxEntry>(id).await?.ok_or_else(|| not_found(id))?;
            if entry.status != EntryStatus::Failed {
                return Err(AppError::validation("Only failed entries can be retried.")
                    .with_context("id", id)
                    .with_context("status", entry.status.as_str()));
            }
            entry.status = EntryStatus::Pending;
            entry.retry_count = 0;
            entry.next_attempt_at = None;
            entry.last_error = None;
            tx.put(&entry).await?;
            Ok::<_, AppError>(entry)
        }
        .await;
        let entry = tx.finish(result).await?;
        info!(target: "handreceipt", event = "outbox_entry_requeued", id = %id);
        self.refresh_status().await?;
        Ok(entry)
    }

    /// Drops an entry without sending it.
    pub async fn discard(&self, id: &str) -> AppResult<()> {
        let mut tx = self.inner.db.begin(&[Table::Outbox], TxMode::ReadWrite).await?;
        let result = async {
            if !tx.delete(Table::Outbox, id).await? {
                return Err(not_found(id));
            }
            Ok::<_, AppError>(())
        }
        .await;
        tx.finish(result).await?;
        info!(target: "handreceipt", event = "outbox_entry_discarded", id = %id);
        self.refresh_status().await?;
        Ok(())
    }

    /// Returns entries left `syncing` by an interrupted run to `pending`.
    /// Their idempotency keys make the second send safe.
    pub async fn recover_interrupted(&self) -> AppResult<usize> {
        let mut tx = self.inner.db.begin(&[Table::Outbox], TxMode::ReadWrite).await?;
        let result = async {
            let stuck: Vec<OutboxEntry> = tx
                .get_all_by_index("by-status", EntryStatus::Syncing.as_str())
                .await?;
            for mut entry in stuck.iter().cloned() {
                entry.status = EntryStatus::Pending;
                tx.put(&entry).await?;
            }
            Ok::<_, AppError>(stuck.len())
        }
        .await;
        let recovered = tx.finish(result).await?;
        if recovered > 0 {
            warn!(target: "handreceipt", event = "outbox_recovered", count = recovered);
        }
        self.refresh_status().await?;
        Ok(recovered)
    }

    pub fn subscribe(&self) -> watch::Receiver<OutboxStatus> {
        self.inner.status.subscribe()
    }

    pub fn status(&self) -> OutboxStatus {
        *self.inner.status.borrow()
    }

    /// Clears the auth flag once the external sign-in flow has completed.
    pub async fn auth_restored(&self) -> AppResult<OutboxStatus> {
        self.inner.auth_required.store(false, Ordering::SeqCst);
        self.refresh_status().await
    }

    /// Recounts entries by status and publishes the result to subscribers.
    pub async fn refresh_status(&self) -> AppResult<OutboxStatus> {
        let mut tx = self.inner.db.begin(&[Table::Outbox], TxMode::ReadOnly).await?;
        let result = async {
            let mut status = OutboxStatus {
                auth_required: self.inner.auth_required.load(Ordering::SeqCst),
                ..OutboxStatus::default()
            };
            status.pending = tx.count_by_index(Table::Outbox, "by-status", "pending").await? as u64;
            status.syncing = tx.count_by_index(Table::Outbox, "by-status", "syncing").await? as u64;
            status.failed = tx.count_by_index(Table::Outbox, "by-status", "failed").await? as u64;
            Ok::<_, AppError>(status)
        }
        .await;
        let status = tx.finish(result).await?;
        self.inner.status.send_replace(status);
        Ok(status)
    }

    /// Replays due entries in `(timestamp, id)` order until a pass finds
    /// nothing left to send.
    ///
    /// Only one drain runs at a time; a concurrent call returns a report with
    /// `skipped` set. While a 401 is outstanding nothing is sent until
    /// [`Outbox::auth_restored`] is called. `shutdown` is checked between
    /// entries, never during one. Remote failures are recorded on the entries and never returned as
    /// errors; storage failures are.
    pub async fn drain(
        &self,
        remote: &dyn RemoteClient,
        shutdown: &ShutdownSignal,
    ) -> AppResult<DrainReport> {
        let Some(_guard) = DrainGuard::begin(&self.inner.draining) else {
            debug!(target: "handreceipt", event = "outbox_drain_skipped");
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        };
        if self.inner.auth_required.load(Ordering::SeqCst) {
            debug!(target: "handreceipt", event = "outbox_drain_awaiting_auth");
            return Ok(DrainReport {
                auth_required: true,
                ..DrainReport::default()
            });
        }

        let mut report = DrainReport::default();
        let mut attempted: HashSet<String> = HashSet::new();
        let mut deferred: HashSet<String> = HashSet::new();

        'passes: loop {
            let batch = self.next_batch(&attempted, &mut deferred).await?;
            if batch.is_empty() {
                break;
            }
            // Keys whose earlier entry did not go through in this pass.
            let mut halted: HashSet<String> = HashSet::new();
            for entry in batch {
                if shutdown.is_triggered() {
                    report.cancelled = true;
                    break 'passes;
                }
                if let Some(key) = &entry.entity_key {
                    if halted.contains(key) {
                        deferred.insert(entry.id.clone());
                        continue;
                    }
                }
                attempted.insert(entry.id.clone());
                deferred.remove(&entry.id);

                let disposition = match self.replay(remote, &entry).await? {
                    Some(disposition) => disposition,
                    None => continue,
                };
                let delivered = matches!(disposition, Disposition::Delivered { .. });
                if !delivered {
                    if let Some(key) = &entry.entity_key {
                        halted.insert(key.clone());
                    }
                }
                match disposition {
                    Disposition::Delivered { .. } => report.delivered += 1,
                    Disposition::Retry(_) => report.retried += 1,
                    Disposition::Reject(_) => report.failed += 1,
                    Disposition::AuthRequired => {
                        report.auth_required = true;
                        break 'passes;
                    }
                }
            }
        }

        report.deferred = deferred.len();
        self.refresh_status().await?;
        info!(
            target: "handreceipt",
            event = "outbox_drain_complete",
            delivered = report.delivered,
            retried = report.retried,
            failed = report.failed,
            deferred = report.deferred,
            auth_required = report.auth_required,
            cancelled = report.cancelled
        );
        Ok(report)
    }

    /// Up to `batch_size` due entries not yet attempted in this drain, in
    /// replay order. An entry is held back while an earlier entry with the
    /// same entity key is still waiting, failed or in flight.
    async fn next_batch(
        &self,
        attempted: &HashSet<String>,
        deferred: &mut HashSet<String>,
    ) -> AppResult<Vec<OutboxEntry>> {
        let entries = self.entries().await?;
        let now = now_ms();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut batch = Vec::new();

        for entry in entries {
            let eligible = entry.is_due(now) && !attempted.contains(&entry.id);
            if let Some(key) = &entry.entity_key {
                if blocked.contains(key) {
                    if eligible {
                        deferred.insert(entry.id.clone());
                    }
                    continue;
                }
                if !eligible {
                    blocked.insert(key.clone());
                    continue;
                }
            }
            if eligible {
                batch.push(entry);
                if batch.len() >= self.inner.config.batch_size {
                    break;
                }
            }
        }
        Ok(batch)
    }

    /// Sends one entry and records the outcome. Returns `None` when the
    /// entry vanished (discarded) before it could be marked in flight.
    async fn replay(
        &self,
        remote: &dyn RemoteClient,
        entry: &OutboxEntry,
    ) -> AppResult<Option<Disposition>> {
        let Some(mut entry) = self.mark_syncing(&entry.id).await? else {
            return Ok(None);
        };

        let request = RemoteRequest {
            method: entry.payload.method,
            url: entry.payload.url.clone(),
            body: entry.payload.body.clone(),
            idempotency_key: entry.idempotency_key.clone(),
        };
        let result = remote.send(&request).await;
        let disposition = classify(&result);

        let mut tx = self.inner.db.begin(&[Table::Outbox], TxMode::ReadWrite).await?;
        let outcome = async {
            match &disposition {
                Disposition::Delivered { replayed } => {
                    tx.delete(Table::Outbox, &entry.id).await?;
                    if *replayed {
                        info!(
                            target: "handreceipt",
                            event = "outbox_entry_delivered",
                            id = %entry.id,
                            code = IDEMPOTENCY_CONFLICT
                        );
                    } else {
                        info!(target: "handreceipt", event = "outbox_entry_delivered", id = %entry.id);
                    }
                }
                Disposition::Retry(err) => {
                    entry.retry_count += 1;
                    entry.last_error = Some(err.to_string());
                    if entry.retry_count >= self.inner.config.max_retries {
                        entry.status = EntryStatus::Failed;
                        entry.next_attempt_at = None;
                        warn!(
                            target: "handreceipt",
                            event = "outbox_entry_failed",
                            id = %entry.id,
                            retry_count = entry.retry_count,
                            error = %err
                        );
                    } else {
                        let delay = backoff_delay(
                            entry.retry_count,
                            self.inner.config.backoff_base,
                            self.inner.config.backoff_max,
                        );
                        entry.status = EntryStatus::Pending;
                        entry.next_attempt_at = Some(now_ms() + delay.as_millis() as i64);
                        info!(
                            target: "handreceipt",
                            event = "outbox_entry_retry",
                            id = %entry.id,
                            retry_count = entry.retry_count,
                            backoff_ms = delay.as_millis() as u64,
                            error = %err
                        );
                    }
                    tx.put(&entry).await?;
                }
                Disposition::Reject(err) => {
                    entry.status = EntryStatus::Failed;
                    entry.next_attempt_at = None;
                    entry.last_error = Some(err.to_string());
                    tx.put(&entry).await?;
                    warn!(
                        target: "handreceipt",
                        event = "outbox_entry_failed",
                        id = %entry.id,
                        error = %err
                    );
                }
                Disposition::AuthRequired => {
                    entry.status = EntryStatus::Pending;
                    entry.next_attempt_at = None;
                    entry.last_error = Some(
                        AppError::new(AUTH_REQUIRED, "Remote API requires sign-in.").to_string(),
                    );
                    tx.put(&entry).await?;
                    self.inner.auth_required.store(true, Ordering::SeqCst);
                    warn!(target: "handreceipt", event = "outbox_auth_required", id = %entry.id);
                }
            }
            Ok::<_, AppError>(())
        }
        .await;
        tx.finish(outcome).await?;
        Ok(Some(disposition))
    }

    async fn mark_syncing(&self, id: &str) -> AppResult<Option<OutboxEntry>> {
        let mut tx = self.inner.db.begin(&[Table::Outbox], TxMode::ReadWrite).await?;
        let result = async {
            let Some(mut entry) = tx.get::<OutboxEntry>(id).await? else {
                return Ok(None);
            };
            if entry.status != EntryStatus::Pending {
                return Ok(None);
            }
            entry.status = EntryStatus::Syncing;
            tx.put(&entry).await?;
            Ok::<_, AppError>(Some(entry))
        }
        .await;
        let entry = tx.finish(result).await?;
        if entry.is_some() {
            self.refresh_status().await?;
        }
        Ok(entry)
    }
}
