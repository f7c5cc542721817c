use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::Sqlite;

/// A secondary index over one column of a logical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDef {
    pub name: &'static str,
    pub column: &'static str,
    /// Schema version that introduced the column.
    pub since: i64,
}

const fn idx(name: &'static str, column: &'static str, since: i64) -> IndexDef {
    IndexDef {
        name,
        column,
        since,
    }
}

const PROPERTY_INDEXES: &[IndexDef] = &[
    idx("by-name", "name", 1),
    idx("by-serialNumber", "serial_number", 1),
    idx("by-category", "category", 1),
    idx("by-status", "status", 1),
    idx("by-location", "location", 1),
];

const CONSUMABLE_INDEXES: &[IndexDef] = &[
    idx("by-name", "name", 1),
    idx("by-nsn", "nsn", 1),
    idx("by-category", "category", 1),
    idx("by-quantity", "current_quantity", 1),
    idx("by-expirationDate", "expiration_date", 4),
];

const CONSUMPTION_INDEXES: &[IndexDef] = &[idx("by-itemId", "item_id", 1), idx("by-date", "date", 1)];

const NOTIFICATION_INDEXES: &[IndexDef] = &[
    idx("by-type", "type", 1),
    idx("by-timestamp", "timestamp", 1),
    idx("by-read", "read", 1),
];

const MAINTENANCE_ITEM_INDEXES: &[IndexDef] = &[
    idx("by-itemId", "item_id", 2),
    idx("by-status", "status", 2),
    idx("by-priority", "priority", 2),
    idx("by-category", "category", 2),
    idx("by-scheduledDate", "scheduled_date", 2),
];

const MAINTENANCE_LOG_INDEXES: &[IndexDef] = &[
    idx("by-maintenanceId", "maintenance_id", 2),
    idx("by-timestamp", "timestamp", 2),
    idx("by-action", "action", 2),
];

const BULLETIN_INDEXES: &[IndexDef] = &[
    idx("by-category", "category", 2),
    idx("by-postedDate", "posted_date", 2),
    idx("by-resolved", "resolved", 2),
];

const OUTBOX_INDEXES: &[IndexDef] = &[
    idx("by-timestamp", "timestamp", 3),
    idx("by-status", "status", 3),
    idx("by-idempotencyKey", "idempotency_key", 3),
    idx("by-entityKey", "entity_key", 3),
];

/// Logical tables of the local store. Each maps onto one physical SQLite
/// table holding `id`, the JSON `data` column and one column per index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Properties,
    Consumables,
    ConsumptionHistory,
    Notifications,
    MaintenanceItems,
    MaintenanceLogs,
    MaintenanceBulletins,
    StatsSnapshot,
    Outbox,
}

impl Table {
    pub const ALL: [Table; 9] = [
        Table::Properties,
        Table::Consumables,
        Table::ConsumptionHistory,
        Table::Notifications,
        Table::MaintenanceItems,
        Table::MaintenanceLogs,
        Table::MaintenanceBulletins,
        Table::StatsSnapshot,
        Table::Outbox,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Table::Properties => "properties",
            Table::Consumables => "consumables",
            Table::ConsumptionHistory => "consumption_history",
            Table::Notifications => "notifications",
            Table::MaintenanceItems => "maintenance_items",
            Table::MaintenanceLogs => "maintenance_logs",
            Table::MaintenanceBulletins => "maintenance_bulletins",
            Table::StatsSnapshot => "stats_snapshot",
            Table::Outbox => "outbox",
        }
    }

    /// Schema version whose migration creates the table.
    pub const fn since(self) -> i64 {
        match self {
            Table::Properties
            | Table::Consumables
            | Table::ConsumptionHistory
            | Table::Notifications => 1,
            Table::MaintenanceItems
            | Table::MaintenanceLogs
            | Table::MaintenanceBulletins
            | Table::StatsSnapshot => 2,
            Table::Outbox => 3,
        }
    }

    pub const fn indexes(self) -> &'static [IndexDef] {
        match self {
            Table::Properties => PROPERTY_INDEXES,
            Table::Consumables => CONSUMABLE_INDEXES,
            Table::ConsumptionHistory => CONSUMPTION_INDEXES,
            Table::Notifications => NOTIFICATION_INDEXES,
            Table::MaintenanceItems => MAINTENANCE_ITEM_INDEXES,
            Table::MaintenanceLogs => MAINTENANCE_LOG_INDEXES,
            Table::MaintenanceBulletins => BULLETIN_INDEXES,
            Table::StatsSnapshot => &[],
            Table::Outbox => OUTBOX_INDEXES,
        }
    }

    pub fn index(self, name: &str) -> Option<&'static IndexDef> {
        self.indexes().iter().find(|def| def.name == name)
    }

    /// Index columns present in a database at `version`.
    pub fn indexes_at(self, version: i64) -> impl Iterator<Item = &'static IndexDef> {
        self.indexes().iter().filter(move |def| def.since <= version)
    }

    pub fn parse(name: &str) -> Option<Table> {
        let normalized = name.trim().replace('-', "_");
        Table::ALL
            .into_iter()
            .find(|table| table.name() == normalized)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value stored in an index column. Dates are epoch milliseconds and flags
/// are 0/1 so that SQLite orders and compares them natively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexValue {
    Null,
    Text(String),
    Integer(i64),
}

impl From<&str> for IndexValue {
    fn from(value: &str) -> Self {
        IndexValue::Text(value.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(value: String) -> Self {
        IndexValue::Text(value)
    }
}

impl From<&String> for IndexValue {
    fn from(value: &String) -> Self {
        IndexValue::Text(value.clone())
    }
}

impl From<i64> for IndexValue {
    fn from(value: i64) -> Self {
        IndexValue::Integer(value)
    }
}

impl From<bool> for IndexValue {
    fn from(value: bool) -> Self {
        IndexValue::Integer(i64::from(value))
    }
}

impl From<DateTime<Utc>> for IndexValue {
    fn from(value: DateTime<Utc>) -> Self {
        IndexValue::Integer(value.timestamp_millis())
    }
}

impl From<&DateTime<Utc>> for IndexValue {
    fn from(value: &DateTime<Utc>) -> Self {
        IndexValue::Integer(value.timestamp_millis())
    }
}

impl<T: Into<IndexValue>> From<Option<T>> for IndexValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(IndexValue::Null)
    }
}

pub(crate) fn bind_index<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &IndexValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        IndexValue::Null => query.bind(None::<String>),
        IndexValue::Text(text) => query.bind(text.clone()),
        IndexValue::Integer(n) => query.bind(*n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_dashed_names() {
        assert_eq!(Table::parse("maintenance-items"), Some(Table::MaintenanceItems));
        assert_eq!(Table::parse("outbox"), Some(Table::Outbox));
        assert_eq!(Table::parse("households"), None);
    }

    #[test]
    fn expiration_index_arrives_in_v4() {
        let at_v3: Vec<_> = Table::Consumables.indexes_at(3).map(|d| d.name).collect();
        assert!(!at_v3.contains(&"by-expirationDate"));
        let at_v4: Vec<_> = Table::Consumables.indexes_at(4).map(|d| d.name).collect();
        assert!(at_v4.contains(&"by-expirationDate"));
    }

    #[test]
    fn index_columns_never_predate_their_table() {
        for table in Table::ALL {
            for def in table.indexes() {
                assert!(def.since >= table.since(), "{table}.{}", def.name);
            }
        }
    }
}
