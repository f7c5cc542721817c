#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use handreceipt_lib::db::{OpenOptions, SchemaCoordinator};
use handreceipt_lib::model::{
    Consumable, MaintenanceItem, MaintenanceStatus, Priority, Property, PropertyStatus,
};
use handreceipt_lib::outbox::{RemoteClient, RemoteError, RemoteRequest, RemoteResponse};
use handreceipt_lib::{AppConfig, AppState, SyncConfig};

pub fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, d, 12, 0, 0).unwrap()
}

/// Config with no demo data and retries that are due immediately.
pub fn test_config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::for_data_dir(dir.path());
    config.seed_demo = false;
    config.sync = SyncConfig {
        max_retries: 3,
        backoff_base: Duration::ZERO,
        backoff_max: Duration::ZERO,
        batch_size: 100,
        interval: Duration::from_millis(50),
    };
    config
}

pub async fn open_state(dir: &TempDir) -> AppState {
    let (state, _) = AppState::init(&test_config(dir)).await.expect("open state");
    state
}

pub async fn memory_state(config: &AppConfig) -> AppState {
    let (state, _) = AppState::open(
        SchemaCoordinator::new(),
        &OpenOptions::memory("handreceipt-test"),
        config,
    )
    .await
    .expect("open in-memory state");
    state
}

pub fn property(id: &str) -> Property {
    Property {
        id: id.into(),
        name: format!("Rifle {id}"),
        serial_number: format!("SN-{id}"),
        nsn: Some("1005-01-231-0973".into()),
        category: "weapons".into(),
        status: PropertyStatus::Assigned,
        location: "Arms room".into(),
        assigned_to: Some("SPC Ortiz".into()),
        components: None,
    }
}

pub fn consumable(id: &str, current: i64, minimum: i64) -> Consumable {
    Consumable {
        id: id.into(),
        name: format!("Supply {id}"),
        nsn: "6135-01-214-6094".into(),
        category: "batteries".into(),
        unit: "each".into(),
        current_quantity: current,
        minimum_quantity: minimum,
        location: "Supply cage".into(),
        expiration_date: None,
        notes: None,
    }
}

pub fn maintenance_item(id: &str, item_id: Option<&str>) -> MaintenanceItem {
    MaintenanceItem {
        id: id.into(),
        item_id: item_id.map(str::to_string),
        title: format!("Service {id}"),
        description: None,
        status: MaintenanceStatus::Scheduled,
        priority: Priority::Medium,
        category: "weapons".into(),
        reported_by: "SGT Hale".into(),
        reported_date: day(1),
        scheduled_date: Some(day(10)),
        assigned_to: None,
        completed_date: None,
        parts_required: Vec::new(),
    }
}

/// What the scripted remote does with one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16),
    Network,
}

/// In-memory stand-in for the REST API. Replies come from the script in
/// order (200 once it runs dry); keys that already succeeded come back as
/// replayed, as the real server does.
#[derive(Default)]
pub struct MockRemote {
    script: Mutex<VecDeque<Reply>>,
    applied: Mutex<HashSet<String>>,
    requests: Mutex<Vec<RemoteRequest>>,
    delay: Option<Duration>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(replies: impl IntoIterator<Item = Reply>) -> Self {
        let remote = Self::default();
        remote.script.lock().unwrap().extend(replies);
        remote
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Marks `key` as already applied server-side.
    pub fn preapply(&self, key: &str) {
        self.applied.lock().unwrap().insert(key.to_string());
    }

    pub fn requests(&self) -> Vec<RemoteRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.url).collect()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteClient for MockRemote {
    async fn send(&self, request: &RemoteRequest) -> Result<RemoteResponse, RemoteError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.requests.lock().unwrap().push(request.clone());
        if self.applied.lock().unwrap().contains(&request.idempotency_key) {
            return Ok(RemoteResponse::replayed(409));
        }
        let reply = self.script.lock().unwrap().pop_front().unwrap_or(Reply::Status(200));
        match reply {
            Reply::Network => Err(RemoteError::Network("connection reset".into())),
            Reply::Status(status) => {
                if (200..300).contains(&status) {
                    self.applied
                        .lock()
                        .unwrap()
                        .insert(request.idempotency_key.clone());
                }
                Ok(RemoteResponse::status(status))
            }
        }
    }
}
