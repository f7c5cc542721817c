use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::table::{IndexValue, Table};
use crate::AppResult;

pub mod inventory;
pub mod maintenance;

pub use inventory::{Component, Consumable, ConsumptionHistoryEntry, Notification, Property, PropertyStatus};
pub use maintenance::{
    LogAction, MaintenanceBulletin, MaintenanceItem, MaintenanceLog, MaintenanceStatus, Priority,
};

/// A row another row points at, checked before the pointing row is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub table: Table,
    pub id: String,
    pub field: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    /// Children are owned by the parent and go with it.
    Cascade,
    /// The parent cannot be deleted while children point at it.
    Restrict,
}

/// Rows in `table` whose `index` column holds the parent's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependent {
    pub table: Table,
    pub index: &'static str,
    pub on_delete: OnDelete,
}

/// A record persisted in one logical table.
///
/// The full value is stored as JSON; `index_value` supplies the indexed
/// columns declared for [`Entity::TABLE`]. The remaining hooks describe the
/// integrity rules the entity store enforces on every write.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TABLE: Table;

    /// Rows that reference this entity and what happens to them on delete.
    const DEPENDENTS: &'static [Dependent] = &[];

    /// Whether writes to this entity change the cached stats snapshot.
    const AFFECTS_STATS: bool = false;

    fn id(&self) -> &str;

    fn index_value(&self, _column: &str) -> IndexValue {
        IndexValue::Null
    }

    fn references(&self) -> Vec<Reference> {
        Vec::new()
    }

    /// Field-level invariants.
    fn validate(&self) -> AppResult<()> {
        Ok(())
    }

    /// Invariants that depend on the stored version being replaced.
    fn check_update(&self, _previous: &Self) -> AppResult<()> {
        Ok(())
    }
}
