use chrono::{DateTime, Utc};

use super::{write_scope, EntityStore};
use crate::db::{IndexRange, StoreTx};
use crate::error::{FOREIGN_KEY_VIOLATION, INSUFFICIENT_QUANTITY};
use crate::model::{Consumable, ConsumptionHistoryEntry, Entity, Notification, Property};
use crate::table::Table;
use crate::{AppError, AppResult};

impl EntityStore {
    pub async fn properties_by_category(&self, category: &str) -> AppResult<Vec<Property>> {
        self.get_all_by_index("by-category", category).await
    }

    pub async fn property_by_serial(&self, serial_number: &str) -> AppResult<Option<Property>> {
        let mut found: Vec<Property> = self.get_all_by_index("by-serialNumber", serial_number).await?;
        Ok(found.pop())
    }

    pub async fn consumables_by_category(&self, category: &str) -> AppResult<Vec<Consumable>> {
        self.get_all_by_index("by-category", category).await
    }

    /// Consumables at or below their minimum quantity.
    ///
    /// O(n): the comparison is between two fields of the same row, which no
    /// single-column index answers.
    pub async fn low_stock_consumables(&self) -> AppResult<Vec<Consumable>> {
        let all: Vec<Consumable> = self.get_all().await?;
        Ok(all.into_iter().filter(Consumable::is_low_stock).collect())
    }

    /// Consumables whose expiration date falls before `before`, soonest first.
    /// Items without an expiration date are never returned.
    pub async fn consumables_expiring_before(
        &self,
        before: DateTime<Utc>,
    ) -> AppResult<Vec<Consumable>> {
        self.db()
            .get_all_by_index_range("by-expirationDate", IndexRange::below(before))
            .await
    }

    /// Issue history of one consumable, oldest first.
    pub async fn consumption_history(&self, item_id: &str) -> AppResult<Vec<ConsumptionHistoryEntry>> {
        let mut entries: Vec<ConsumptionHistoryEntry> =
            self.get_all_by_index("by-itemId", item_id).await?;
        entries.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    /// Issues stock: decrements the consumable and records the history row.
    /// Issuing more than is on hand is rejected.
    pub async fn record_consumption_in(
        tx: &mut StoreTx,
        entry: &ConsumptionHistoryEntry,
    ) -> AppResult<Consumable> {
        entry.validate()?;
        let mut consumable = tx
            .get::<Consumable>(&entry.item_id)
            .await?
            .ok_or_else(|| {
                AppError::new(FOREIGN_KEY_VIOLATION, "Referenced record does not exist.")
                    .with_context("table", Table::ConsumptionHistory.name())
                    .with_context("field", "itemId")
                    .with_context("id", entry.item_id.clone())
            })?;
        if entry.quantity > consumable.current_quantity {
            return Err(AppError::new(
                INSUFFICIENT_QUANTITY,
                "Not enough stock on hand to issue this quantity.",
            )
            .with_context("id", consumable.id.clone())
            .with_context("requested", entry.quantity.to_string())
            .with_context("on_hand", consumable.current_quantity.to_string()));
        }
        consumable.current_quantity -= entry.quantity;
        Self::create_in(tx, entry).await?;
        Self::update_in(tx, &consumable).await?;
        Ok(consumable)
    }

    pub async fn record_consumption(&self, entry: &ConsumptionHistoryEntry) -> AppResult<Consumable> {
        let mut tx = self
            .begin(&write_scope::<Consumable>(&[Table::ConsumptionHistory]))
            .await?;
        let result = Self::record_consumption_in(&mut tx, entry).await;
        tx.finish(result).await
    }

    pub async fn unread_notifications(&self) -> AppResult<Vec<Notification>> {
        let mut unread: Vec<Notification> = self.get_all_by_index("by-read", false).await?;
        unread.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(unread)
    }

    pub async fn mark_notification_read(&self, id: &str) -> AppResult<Notification> {
        let mut tx = self.begin(&[Table::Notifications]).await?;
        let result = async {
            let mut notification = tx
                .get::<Notification>(id)
                .await?
                .ok_or_else(|| AppError::not_found(Table::Notifications.name(), id))?;
            if !notification.read {
                notification.read = true;
                Self::update_in(&mut tx, &notification).await?;
            }
            Ok::<_, AppError>(notification)
        }
        .await;
        tx.finish(result).await
    }
}
