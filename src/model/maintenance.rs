use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Dependent, Entity, OnDelete, Reference};
use crate::error::{COMPLETED_DATE_MISMATCH, INVALID_TRANSITION};
use crate::table::{IndexValue, Table};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MaintenanceStatus {
    Scheduled,
    InProgress,
    AwaitingParts,
    BnLevel,
    Completed,
    Cancelled,
}

impl MaintenanceStatus {
    pub const ALL: [MaintenanceStatus; 6] = [
        MaintenanceStatus::Scheduled,
        MaintenanceStatus::InProgress,
        MaintenanceStatus::AwaitingParts,
        MaintenanceStatus::BnLevel,
        MaintenanceStatus::Completed,
        MaintenanceStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MaintenanceStatus::Scheduled => "scheduled",
            MaintenanceStatus::InProgress => "in-progress",
            MaintenanceStatus::AwaitingParts => "awaiting-parts",
            MaintenanceStatus::BnLevel => "bn-level",
            MaintenanceStatus::Completed => "completed",
            MaintenanceStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        MaintenanceStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MaintenanceStatus::Completed | MaintenanceStatus::Cancelled
        )
    }

    /// Edges of the maintenance workflow. Completed and cancelled are terminal;
    /// every other state may be cancelled.
    pub fn can_transition_to(self, next: MaintenanceStatus) -> bool {
        use MaintenanceStatus::*;
        match (self, next) {
            (Scheduled, InProgress) => true,
            (InProgress, AwaitingParts | BnLevel | Completed) => true,
            (AwaitingParts | BnLevel, InProgress | Completed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn ensure_transition(self, next: MaintenanceStatus) -> AppResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(AppError::new(
                INVALID_TRANSITION,
                format!(
                    "Cannot move a maintenance request from {} to {}.",
                    self.as_str(),
                    next.as_str()
                ),
            )
            .with_context("from", self.as_str())
            .with_context("to", next.as_str()))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogAction {
    Created,
    Updated,
    StatusChange,
    PartsOrdered,
    PartsReceived,
    Completed,
}

impl LogAction {
    pub fn as_str(self) -> &'static str {
        match self {
            LogAction::Created => "created",
            LogAction::Updated => "updated",
            LogAction::StatusChange => "status-change",
            LogAction::PartsOrdered => "parts-ordered",
            LogAction::PartsReceived => "parts-received",
            LogAction::Completed => "completed",
        }
    }
}

/// A maintenance request against (optionally) one property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: MaintenanceStatus,
    pub priority: Priority,
    pub category: String,
    pub reported_by: String,
    pub reported_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parts_required: Vec<String>,
}

impl Entity for MaintenanceItem {
    const TABLE: Table = Table::MaintenanceItems;
    const DEPENDENTS: &'static [Dependent] = &[Dependent {
        table: Table::MaintenanceLogs,
        index: "by-maintenanceId",
        on_delete: OnDelete::Cascade,
    }];
    const AFFECTS_STATS: bool = true;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_value(&self, column: &str) -> IndexValue {
        match column {
            "item_id" => self.item_id.as_deref().into(),
            "status" => self.status.as_str().into(),
            "priority" => self.priority.as_str().into(),
            "category" => (&self.category).into(),
            "scheduled_date" => self.scheduled_date.into(),
            _ => IndexValue::Null,
        }
    }

    fn references(&self) -> Vec<Reference> {
        self.item_id
            .iter()
            .map(|id| Reference {
                table: Table::Properties,
                id: id.clone(),
                field: "itemId",
            })
            .collect()
    }

    fn validate(&self) -> AppResult<()> {
        let completed = self.status == MaintenanceStatus::Completed;
        if completed != self.completed_date.is_some() {
            return Err(AppError::new(
                COMPLETED_DATE_MISMATCH,
                "Completed date must be set exactly when the request is completed.",
            )
            .with_context("id", self.id.clone())
            .with_context("status", self.status.as_str()));
        }
        if self.title.trim().is_empty() {
            return Err(AppError::validation("Maintenance request needs a title.")
                .with_context("id", self.id.clone()));
        }
        Ok(())
    }

    fn check_update(&self, previous: &Self) -> AppResult<()> {
        if self.status != previous.status {
            return Err(AppError::new(
                INVALID_TRANSITION,
                "Status changes must go through the status workflow.",
            )
            .with_context("id", self.id.clone())
            .with_context("from", previous.status.as_str())
            .with_context("to", self.status.as_str()));
        }
        Ok(())
    }
}

/// Audit row for one change to a maintenance request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceLog {
    pub id: String,
    pub maintenance_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: LogAction,
    pub performed_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Entity for MaintenanceLog {
    const TABLE: Table = Table::MaintenanceLogs;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_value(&self, column: &str) -> IndexValue {
        match column {
            "maintenance_id" => (&self.maintenance_id).into(),
            "timestamp" => self.timestamp.into(),
            "action" => self.action.as_str().into(),
            _ => IndexValue::Null,
        }
    }

    fn references(&self) -> Vec<Reference> {
        vec![Reference {
            table: Table::MaintenanceItems,
            id: self.maintenance_id.clone(),
            field: "maintenanceId",
        }]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceBulletin {
    pub id: String,
    pub title: String,
    pub message: String,
    pub category: String,
    #[serde(default)]
    pub affected_items: Vec<String>,
    pub posted_by: String,
    pub posted_date: DateTime<Utc>,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_date: Option<DateTime<Utc>>,
}

impl Entity for MaintenanceBulletin {
    const TABLE: Table = Table::MaintenanceBulletins;
    const AFFECTS_STATS: bool = true;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_value(&self, column: &str) -> IndexValue {
        match column {
            "category" => (&self.category).into(),
            "posted_date" => self.posted_date.into(),
            "resolved" => self.resolved.into(),
            _ => IndexValue::Null,
        }
    }
}
