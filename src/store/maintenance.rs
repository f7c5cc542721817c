use chrono::{DateTime, Utc};
use tracing::info;

use super::{write_scope, EntityStore};
use crate::db::StoreTx;
use crate::error::INVALID_TRANSITION;
use crate::id::new_uuid_v7;
use crate::model::{
    Entity, LogAction, MaintenanceBulletin, MaintenanceItem, MaintenanceLog, MaintenanceStatus, Priority,
};
use crate::stats;
use crate::table::Table;
use crate::{AppError, AppResult};

fn log_entry(
    maintenance_id: &str,
    action: LogAction,
    performed_by: &str,
    notes: Option<String>,
) -> MaintenanceLog {
    MaintenanceLog {
        id: new_uuid_v7(),
        maintenance_id: maintenance_id.to_string(),
        timestamp: Utc::now(),
        action,
        performed_by: performed_by.to_string(),
        notes,
    }
}

fn maintenance_scope() -> Vec<Table> {
    write_scope::<MaintenanceItem>(&[Table::Properties])
}

async fn load_item(tx: &mut StoreTx, id: &str) -> AppResult<MaintenanceItem> {
    tx.get::<MaintenanceItem>(id)
        .await?
        .ok_or_else(|| AppError::not_found(Table::MaintenanceItems.name(), id))
}

/// Moves `item` to `next`, keeping `completedDate` in step with the status.
fn apply_status(item: &mut MaintenanceItem, next: MaintenanceStatus) -> AppResult<()> {
    item.status.ensure_transition(next)?;
    item.status = next;
    item.completed_date = (next == MaintenanceStatus::Completed).then(Utc::now);
    Ok(())
}

/// Writes a changed item directly; `update_in` refuses status changes.
async fn store_item(tx: &mut StoreTx, item: &MaintenanceItem) -> AppResult<()> {
    item.validate()?;
    tx.put(item).await
}

impl EntityStore {
    /// Creates the request together with its `created` log row.
    pub async fn create_maintenance_item_in(
        tx: &mut StoreTx,
        item: &MaintenanceItem,
        performed_by: &str,
    ) -> AppResult<MaintenanceLog> {
        Self::create_in(tx, item).await?;
        let log = log_entry(&item.id, LogAction::Created, performed_by, None);
        Self::create_in(tx, &log).await?;
        Ok(log)
    }

    pub async fn create_maintenance_item(
        &self,
        item: &MaintenanceItem,
        performed_by: &str,
    ) -> AppResult<MaintenanceLog> {
        let mut tx = self.begin(&maintenance_scope()).await?;
        let result = Self::create_maintenance_item_in(&mut tx, item, performed_by).await;
        tx.finish(result).await
    }

    /// Moves a request along the status workflow and records the change.
    /// An illegal edge fails with `InvalidTransition` and writes nothing.
    pub async fn update_status_in(
        tx: &mut StoreTx,
        id: &str,
        next: MaintenanceStatus,
        performed_by: &str,
        notes: Option<String>,
    ) -> AppResult<MaintenanceItem> {
        let mut item = load_item(tx, id).await?;
        let previous = item.status;
        apply_status(&mut item, next)?;
        store_item(tx, &item).await?;

        let action = if next == MaintenanceStatus::Completed {
            LogAction::Completed
        } else {
            LogAction::StatusChange
        };
        let notes = notes.or_else(|| {
            Some(format!(
                "Status changed from {} to {}",
                previous.as_str(),
                next.as_str()
            ))
        });
        Self::create_in(tx, &log_entry(id, action, performed_by, notes)).await?;
        stats::refresh(tx).await?;

        info!(
            target: "handreceipt",
            event = "maintenance_status_change",
            id = %id,
            from = previous.as_str(),
            to = next.as_str()
        );
        Ok(item)
    }

    pub async fn update_status(
        &self,
        id: &str,
        next: MaintenanceStatus,
        performed_by: &str,
        notes: Option<String>,
    ) -> AppResult<MaintenanceItem> {
        let mut tx = self.begin(&maintenance_scope()).await?;
        let result = Self::update_status_in(&mut tx, id, next, performed_by, notes).await;
        tx.finish(result).await
    }

    /// Adds `parts` to the request. An in-progress request starts waiting on
    /// them.
    pub async fn order_parts(
        &self,
        id: &str,
        parts: &[String],
        performed_by: &str,
    ) -> AppResult<MaintenanceItem> {
        let mut tx = self.begin(&maintenance_scope()).await?;
        let result = async {
            if parts.iter().all(|p| p.trim().is_empty()) {
                return Err(AppError::validation("No parts to order.").with_context("id", id));
            }
            let mut item = load_item(&mut tx, id).await?;
            if item.status.is_terminal() {
                return Err(AppError::new(
                    INVALID_TRANSITION,
                    "Cannot order parts for a closed maintenance request.",
                )
                .with_context("id", id)
                .with_context("status", item.status.as_str()));
            }
            let ordered: Vec<String> = parts
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            item.parts_required.extend(ordered.iter().cloned());
            if item.status == MaintenanceStatus::InProgress {
                apply_status(&mut item, MaintenanceStatus::AwaitingParts)?;
            }
            store_item(&mut tx, &item).await?;
            let log = log_entry(id, LogAction::PartsOrdered, performed_by, Some(ordered.join(", ")));
            Self::create_in(&mut tx, &log).await?;
            stats::refresh(&mut tx).await?;
            Ok::<_, AppError>(item)
        }
        .await;
        tx.finish(result).await
    }

    /// Records delivery of the ordered parts and resumes work.
    pub async fn receive_parts(&self, id: &str, performed_by: &str) -> AppResult<MaintenanceItem> {
        let mut tx = self.begin(&maintenance_scope()).await?;
        let result = async {
            let mut item = load_item(&mut tx, id).await?;
            if item.status != MaintenanceStatus::AwaitingParts {
                return Err(AppError::new(
                    INVALID_TRANSITION,
                    "Request is not waiting on parts.",
                )
                .with_context("id", id)
                .with_context("status", item.status.as_str()));
            }
            apply_status(&mut item, MaintenanceStatus::InProgress)?;
            store_item(&mut tx, &item).await?;
            let log = log_entry(id, LogAction::PartsReceived, performed_by, None);
            Self::create_in(&mut tx, &log).await?;
            stats::refresh(&mut tx).await?;
            Ok::<_, AppError>(item)
        }
        .await;
        tx.finish(result).await
    }

    pub async fn maintenance_by_status(
        &self,
        status: MaintenanceStatus,
    ) -> AppResult<Vec<MaintenanceItem>> {
        self.get_all_by_index("by-status", status.as_str()).await
    }

    pub async fn maintenance_by_priority(&self, priority: Priority) -> AppResult<Vec<MaintenanceItem>> {
        self.get_all_by_index("by-priority", priority.as_str()).await
    }

    pub async fn maintenance_for_property(&self, property_id: &str) -> AppResult<Vec<MaintenanceItem>> {
        self.get_all_by_index("by-itemId", property_id).await
    }

    /// Audit trail of one request, oldest first.
    pub async fn maintenance_logs(&self, maintenance_id: &str) -> AppResult<Vec<MaintenanceLog>> {
        let mut logs: Vec<MaintenanceLog> =
            self.get_all_by_index("by-maintenanceId", maintenance_id).await?;
        logs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(logs)
    }

    pub async fn unresolved_bulletins(&self) -> AppResult<Vec<MaintenanceBulletin>> {
        self.get_all_by_index("by-resolved", false).await
    }

    pub async fn resolve_bulletin(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> AppResult<MaintenanceBulletin> {
        let mut tx = self.begin(stats::TABLES).await?;
        let result = async {
            let mut bulletin = tx
                .get::<MaintenanceBulletin>(id)
                .await?
                .ok_or_else(|| AppError::not_found(Table::MaintenanceBulletins.name(), id))?;
            if !bulletin.resolved {
                bulletin.resolved = true;
                bulletin.resolved_date = Some(at);
                Self::update_in(&mut tx, &bulletin).await?;
            }
            Ok::<_, AppError>(bulletin)
        }
        .await;
        tx.finish(result).await
    }
}
