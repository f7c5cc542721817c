use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::StoreTx;
use crate::model::{
    Consumable, Entity, MaintenanceBulletin, MaintenanceItem, MaintenanceStatus, Priority,
};
use crate::table::Table;
use crate::AppResult;

/// Fixed key of the cached snapshot row.
pub const SNAPSHOT_ID: &str = "maintenance-stats";

/// Length of the next-due list.
pub const UPCOMING_LIMIT: usize = 5;

/// Tables a refresh reads from and writes to.
pub const TABLES: &[Table] = &[
    Table::Consumables,
    Table::MaintenanceItems,
    Table::MaintenanceBulletins,
    Table::StatsSnapshot,
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub scheduled: u64,
    pub in_progress: u64,
    pub awaiting_parts: u64,
    pub bn_level: u64,
    pub completed: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    fn bump(&mut self, status: MaintenanceStatus) {
        let slot = match status {
            MaintenanceStatus::Scheduled => &mut self.scheduled,
            MaintenanceStatus::InProgress => &mut self.in_progress,
            MaintenanceStatus::AwaitingParts => &mut self.awaiting_parts,
            MaintenanceStatus::BnLevel => &mut self.bn_level,
            MaintenanceStatus::Completed => &mut self.completed,
            MaintenanceStatus::Cancelled => &mut self.cancelled,
        };
        *slot += 1;
    }

    pub fn get(&self, status: MaintenanceStatus) -> u64 {
        match status {
            MaintenanceStatus::Scheduled => self.scheduled,
            MaintenanceStatus::InProgress => self.in_progress,
            MaintenanceStatus::AwaitingParts => self.awaiting_parts,
            MaintenanceStatus::BnLevel => self.bn_level,
            MaintenanceStatus::Completed => self.completed,
            MaintenanceStatus::Cancelled => self.cancelled,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityCounts {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
    pub critical: u64,
}

impl PriorityCounts {
    fn bump(&mut self, priority: Priority) {
        match priority {
            Priority::Low => self.low += 1,
            Priority::Medium => self.medium += 1,
            Priority::High => self.high += 1,
            Priority::Critical => self.critical += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpcomingItem {
    pub id: String,
    pub title: String,
    pub status: MaintenanceStatus,
    pub priority: Priority,
    pub scheduled_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumableCounts {
    pub total: u64,
    pub low_stock: u64,
}

/// Cached summary of the maintenance board. Every field is a function of the
/// current rows; two snapshots over the same rows compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub id: String,
    pub total: u64,
    pub by_status: StatusCounts,
    pub by_priority: PriorityCounts,
    pub by_category: BTreeMap<String, u64>,
    pub upcoming: Vec<UpcomingItem>,
    pub consumables: ConsumableCounts,
    pub open_bulletins: u64,
}

impl Default for StatsSnapshot {
    fn default() -> Self {
        Self {
            id: SNAPSHOT_ID.to_string(),
            total: 0,
            by_status: StatusCounts::default(),
            by_priority: PriorityCounts::default(),
            by_category: BTreeMap::new(),
            upcoming: Vec::new(),
            consumables: ConsumableCounts::default(),
            open_bulletins: 0,
        }
    }
}

impl Entity for StatsSnapshot {
    const TABLE: Table = Table::StatsSnapshot;

    fn id(&self) -> &str {
        &self.id
    }
}

pub fn compute(
    items: &[MaintenanceItem],
    consumables: &[Consumable],
    bulletins: &[MaintenanceBulletin],
) -> StatsSnapshot {
    let mut snapshot = StatsSnapshot::default();

    for item in items {
        snapshot.total += 1;
        snapshot.by_status.bump(item.status);
        snapshot.by_priority.bump(item.priority);
        *snapshot
            .by_category
            .entry(item.category.clone())
            .or_default() += 1;
    }

    let mut upcoming: Vec<UpcomingItem> = items
        .iter()
        .filter(|item| !item.status.is_terminal())
        .filter_map(|item| {
            item.scheduled_date.map(|scheduled_date| UpcomingItem {
                id: item.id.clone(),
                title: item.title.clone(),
                status: item.status,
                priority: item.priority,
                scheduled_date,
            })
        })
        .collect();
    upcoming.sort_by(|a, b| {
        a.scheduled_date
            .cmp(&b.scheduled_date)
            .then_with(|| a.id.cmp(&b.id))
    });
    upcoming.truncate(UPCOMING_LIMIT);
    snapshot.upcoming = upcoming;

    snapshot.consumables = ConsumableCounts {
        total: consumables.len() as u64,
        low_stock: consumables.iter().filter(|c| c.is_low_stock()).count() as u64,
    };
    snapshot.open_bulletins = bulletins.iter().filter(|b| !b.resolved).count() as u64;

    snapshot
}

/// Recounts the source rows visible to `tx` without writing anything.
pub async fn recount(tx: &mut StoreTx) -> AppResult<StatsSnapshot> {
    let items = tx.get_all::<MaintenanceItem>().await?;
    let consumables = tx.get_all::<Consumable>().await?;
    let bulletins = tx.get_all::<MaintenanceBulletin>().await?;
    Ok(compute(&items, &consumables, &bulletins))
}

/// Recomputes the snapshot and stores it in the same transaction as the
/// write that changed its inputs.
pub async fn refresh(tx: &mut StoreTx) -> AppResult<StatsSnapshot> {
    let snapshot = recount(tx).await?;
    tx.put(&snapshot).await?;
    debug!(
        target: "handreceipt",
        event = "stats_refresh",
        total = snapshot.total,
        upcoming = snapshot.upcoming.len()
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item(id: &str, status: MaintenanceStatus, day: Option<u32>) -> MaintenanceItem {
        MaintenanceItem {
            id: id.into(),
            item_id: None,
            title: format!("Job {id}"),
            description: None,
            status,
            priority: Priority::Medium,
            category: if id.starts_with('w') { "weapons" } else { "vehicles" }.into(),
            reported_by: "SGT Smith".into(),
            reported_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            scheduled_date: day.map(|d| Utc.with_ymd_and_hms(2024, 2, d, 0, 0, 0).unwrap()),
            assigned_to: None,
            completed_date: (status == MaintenanceStatus::Completed)
                .then(|| Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
            parts_required: Vec::new(),
        }
    }

    #[test]
    fn empty_input_yields_zeroes() {
        let snapshot = compute(&[], &[], &[]);
        assert_eq!(snapshot, StatsSnapshot::default());
        assert!(snapshot.upcoming.is_empty());
    }

    #[test]
    fn counts_by_status_priority_and_category() {
        let items = vec![
            item("w1", MaintenanceStatus::Scheduled, Some(3)),
            item("w2", MaintenanceStatus::Completed, None),
            item("v1", MaintenanceStatus::InProgress, None),
        ];
        let snapshot = compute(&items, &[], &[]);
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.by_status.scheduled, 1);
        assert_eq!(snapshot.by_status.completed, 1);
        assert_eq!(snapshot.by_status.in_progress, 1);
        assert_eq!(snapshot.by_priority.medium, 3);
        assert_eq!(snapshot.by_category.get("weapons"), Some(&2));
        assert_eq!(snapshot.by_category.get("vehicles"), Some(&1));
    }

    #[test]
    fn upcoming_is_sorted_by_date_then_id_and_capped() {
        let items = vec![
            item("v9", MaintenanceStatus::Scheduled, Some(2)),
            item("v1", MaintenanceStatus::Scheduled, Some(2)),
            item("v2", MaintenanceStatus::AwaitingParts, Some(1)),
            item("v3", MaintenanceStatus::Scheduled, Some(5)),
            item("v4", MaintenanceStatus::Scheduled, Some(6)),
            item("v5", MaintenanceStatus::Scheduled, Some(7)),
            item("v6", MaintenanceStatus::Cancelled, Some(1)),
            item("v7", MaintenanceStatus::Scheduled, None),
        ];
        let snapshot = compute(&items, &[], &[]);
        let ids: Vec<_> = snapshot.upcoming.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, ["v2", "v1", "v9", "v3", "v4"]);
    }

    #[test]
    fn snapshot_json_is_camel_case() {
        let value = serde_json::to_value(compute(&[], &[], &[])).expect("serialize");
        assert_eq!(value["id"], SNAPSHOT_ID);
        assert!(value["byStatus"].get("awaitingParts").is_some());
        assert!(value["consumables"].get("lowStock").is_some());
    }
}
