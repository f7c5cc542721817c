#![allow(clippy::unwrap_used, clippy::expect_used)]

use tempfile::TempDir;

use handreceipt_lib::model::{MaintenanceItem, Property};
use handreceipt_lib::seed::{self, SeedData};
use handreceipt_lib::{AppState, Table};

#[path = "util.rs"]
mod util;

#[tokio::test]
async fn demo_seed_fills_empty_tables_once() {
    let dir = TempDir::new().unwrap();
    let state = util::open_state(&dir).await;

    let first = seed::seed_demo(&state.store).await.unwrap();
    assert_eq!(first.table(Table::Properties).unwrap().inserted, 4);
    assert_eq!(first.table(Table::MaintenanceItems).unwrap().inserted, 4);
    assert_eq!(first.table(Table::MaintenanceLogs).unwrap().inserted, 4);
    assert!(first.tables.iter().all(|t| t.skipped == 0));

    let second = seed::seed_demo(&state.store).await.unwrap();
    assert_eq!(second.inserted(), 0);
    assert!(second.tables.iter().all(|t| t.already_populated));
    assert_eq!(state.db.count(Table::Properties).await.unwrap(), 4);

    let stats = state.store.stats_snapshot().await.unwrap();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.by_status.completed, 1);
    assert_eq!(stats.by_status.awaiting_parts, 1);
    assert_eq!(stats.consumables.total, 4);
    assert_eq!(stats.consumables.low_stock, 2);
    assert_eq!(stats.open_bulletins, 1);
    assert_eq!(stats.upcoming.first().map(|u| u.id.as_str()), Some("mx-003"));
    assert_eq!(stats, state.store.recount_stats().await.unwrap());
    state.shutdown().await;
}

#[tokio::test]
async fn startup_seed_runs_only_against_an_empty_database() {
    let dir = TempDir::new().unwrap();
    let mut config = util::test_config(&dir);
    config.seed_demo = true;

    let (state, report) = AppState::init(&config).await.unwrap();
    assert!(report.unwrap().inserted() > 0);
    state.shutdown().await;

    let (state, report) = AppState::init(&config).await.unwrap();
    assert_eq!(report.unwrap().inserted(), 0);
    state.shutdown().await;
}

#[tokio::test]
async fn populated_tables_are_left_alone() {
    let dir = TempDir::new().unwrap();
    let state = util::open_state(&dir).await;
    state.store.create(&util::property("p_local")).await.unwrap();

    let report = seed::seed_demo(&state.store).await.unwrap();
    let properties = report.table(Table::Properties).unwrap();
    assert!(properties.already_populated);
    assert_eq!(properties.inserted, 0);

    // Requests pointing at demo properties that were never inserted are dropped.
    let items = report.table(Table::MaintenanceItems).unwrap();
    let linked = seed::demo_data()
        .unwrap()
        .maintenance_items
        .iter()
        .filter(|m| m.item_id.is_some())
        .count();
    assert_eq!(items.skipped, linked);
    assert_eq!(
        state.store.get_all::<Property>().await.unwrap().len(),
        1
    );
    assert_eq!(
        state.store.count::<MaintenanceItem>().await.unwrap() as usize,
        items.inserted
    );
    state.shutdown().await;
}

#[tokio::test]
async fn custom_seed_data_is_accepted() {
    let dir = TempDir::new().unwrap();
    let state = util::open_state(&dir).await;
    let data = SeedData {
        properties: vec![util::property("p_1")],
        maintenance_items: vec![util::maintenance_item("m_1", Some("p_1"))],
        ..SeedData::default()
    };
    let report = seed::seed(&state.store, &data).await.unwrap();
    assert_eq!(report.inserted(), 2);
    assert_eq!(state.store.stats_snapshot().await.unwrap().total, 1);
    state.shutdown().await;
}
