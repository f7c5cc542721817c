use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::StoreTx;
use crate::model::{
    Consumable, ConsumptionHistoryEntry, Entity, MaintenanceBulletin, MaintenanceItem,
    MaintenanceLog, Notification, Property,
};
use crate::stats;
use crate::store::EntityStore;
use crate::table::Table;
use crate::AppResult;

const DEMO_JSON: &str = include_str!("../seed/demo.json");

/// Tables the seeder may write, parents before children.
const SEED_TABLES: &[Table] = &[
    Table::Properties,
    Table::Consumables,
    Table::ConsumptionHistory,
    Table::Notifications,
    Table::MaintenanceItems,
    Table::MaintenanceLogs,
    Table::MaintenanceBulletins,
    Table::StatsSnapshot,
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SeedData {
    pub properties: Vec<Property>,
    pub consumables: Vec<Consumable>,
    pub consumption_history: Vec<ConsumptionHistoryEntry>,
    pub notifications: Vec<Notification>,
    pub maintenance_items: Vec<MaintenanceItem>,
    pub maintenance_logs: Vec<MaintenanceLog>,
    pub maintenance_bulletins: Vec<MaintenanceBulletin>,
}

pub fn demo_data() -> AppResult<SeedData> {
    Ok(serde_json::from_str(DEMO_JSON)?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSeed {
    pub table: String,
    pub inserted: usize,
    /// Rows dropped because the record they reference is absent.
    pub skipped: usize,
    /// The table already held rows, so it was left alone.
    pub already_populated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedReport {
    pub tables: Vec<TableSeed>,
}

impl SeedReport {
    pub fn inserted(&self) -> usize {
        self.tables.iter().map(|t| t.inserted).sum()
    }

    pub fn table(&self, table: Table) -> Option<&TableSeed> {
        self.tables.iter().find(|t| t.table == table.name())
    }
}

async fn seed_table<E: Entity>(tx: &mut StoreTx, rows: &[E]) -> AppResult<TableSeed> {
    let table = E::TABLE;
    let mut outcome = TableSeed {
        table: table.name().to_string(),
        inserted: 0,
        skipped: 0,
        already_populated: false,
    };
    if tx.count(table).await? > 0 {
        outcome.already_populated = true;
        info!(target: "handreceipt", event = "seed_table", table = %table, skipped_table = true);
        return Ok(outcome);
    }

    'rows: for row in rows {
        row.validate()?;
        for reference in row.references() {
            if !tx.exists(reference.table, &reference.id).await? {
                warn!(
                    target: "handreceipt",
                    event = "seed_row_orphaned",
                    table = %table,
                    id = %row.id(),
                    field = reference.field,
                    missing = %reference.id
                );
                outcome.skipped += 1;
                continue 'rows;
            }
        }
        tx.insert(row).await?;
        outcome.inserted += 1;
    }
    info!(
        target: "handreceipt",
        event = "seed_table",
        table = %table,
        inserted = outcome.inserted,
        skipped = outcome.skipped
    );
    Ok(outcome)
}

async fn seed_all(tx: &mut StoreTx, data: &SeedData) -> AppResult<SeedReport> {
    let mut report = SeedReport::default();
    report.tables.push(seed_table(tx, &data.properties).await?);
    report.tables.push(seed_table(tx, &data.consumables).await?);
    report.tables.push(seed_table(tx, &data.consumption_history).await?);
    report.tables.push(seed_table(tx, &data.notifications).await?);
    report.tables.push(seed_table(tx, &data.maintenance_items).await?);
    report.tables.push(seed_table(tx, &data.maintenance_logs).await?);
    report.tables.push(seed_table(tx, &data.maintenance_bulletins).await?);
    if report.inserted() > 0 {
        stats::refresh(tx).await?;
    }
    Ok(report)
}

/// Populates every empty table from `data` in one transaction. Tables that
/// already hold rows are untouched, so running it on every start is a no-op
/// after the first.
pub async fn seed(store: &EntityStore, data: &SeedData) -> AppResult<SeedReport> {
    let mut tx = store.begin(SEED_TABLES).await?;
    let result = seed_all(&mut tx, data).await;
    tx.finish(result).await
}

pub async fn seed_demo(store: &EntityStore) -> AppResult<SeedReport> {
    seed(store, &demo_data()?).await
}
