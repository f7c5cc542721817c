#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use tempfile::TempDir;

use handreceipt_lib::db::{Database, OpenOptions, SchemaCoordinator};
use handreceipt_lib::error::STORAGE_UNAVAILABLE;
use handreceipt_lib::migrate::{Migration, LATEST_VERSION, MIGRATIONS};
use handreceipt_lib::{AppState, Table};

#[path = "util.rs"]
mod util;

fn options(dir: &TempDir) -> OpenOptions {
    OpenOptions::file(dir.path().join("handreceipt.sqlite3"))
}

#[tokio::test]
async fn upgrade_waits_for_older_handle_to_close() {
    let dir = TempDir::new().unwrap();
    let coordinator = SchemaCoordinator::new();
    let old = Database::open(&coordinator, &options(&dir), 3, MIGRATIONS)
        .await
        .unwrap();
    let mut version_change = old.version_change();

    let upgrade = {
        let coordinator = coordinator.clone();
        let options = options(&dir).with_open_timeout(Duration::from_secs(5));
        tokio::spawn(async move { Database::open(&coordinator, &options, 4, MIGRATIONS).await })
    };

    version_change.changed().await.expect("version change announced");
    assert_eq!(*version_change.borrow(), Some(4));
    assert!(!upgrade.is_finished());
    old.close().await;

    let new = upgrade.await.unwrap().expect("upgrade after close");
    assert_eq!(new.version(), 4);
    assert_eq!(coordinator.live_versions(new.name()), vec![4]);
    new.close().await;
}

#[tokio::test]
async fn upgrade_times_out_while_old_handle_stays_open() {
    let dir = TempDir::new().unwrap();
    let coordinator = SchemaCoordinator::new();
    let old = Database::open(&coordinator, &options(&dir), 3, MIGRATIONS)
        .await
        .unwrap();

    let blocked = options(&dir).with_open_timeout(Duration::from_millis(100));
    let err = Database::open(&coordinator, &blocked, 4, MIGRATIONS)
        .await
        .err()
        .expect("open blocked");
    assert_eq!(err.code(), STORAGE_UNAVAILABLE);

    // The old handle keeps working at its version.
    assert_eq!(old.count(Table::Outbox).await.unwrap(), 0);
    old.close().await;
}

#[tokio::test]
async fn closed_handle_refuses_operations() {
    let dir = TempDir::new().unwrap();
    let coordinator = SchemaCoordinator::new();
    let db = Database::open(&coordinator, &options(&dir), 4, MIGRATIONS)
        .await
        .unwrap();
    let clone = db.clone();
    db.close().await;
    assert!(clone.is_closed());
    let err = clone.count(Table::Properties).await.unwrap_err();
    assert_eq!(err.code(), STORAGE_UNAVAILABLE);
}

#[tokio::test]
async fn app_state_steps_aside_for_a_newer_schema() {
    let dir = TempDir::new().unwrap();
    let coordinator = SchemaCoordinator::new();
    let (state, _) = AppState::open(coordinator.clone(), &options(&dir), &util::test_config(&dir))
        .await
        .unwrap();
    let listener = state.close_on_version_change();

    let mut plan: Vec<Migration> = MIGRATIONS.to_vec();
    plan.push(Migration {
        version: LATEST_VERSION + 1,
        name: "audit_marks",
        sql: "CREATE TABLE IF NOT EXISTS audit_marks (id TEXT PRIMARY KEY NOT NULL);",
    });
    let upgraded = Database::open(
        &coordinator,
        &options(&dir).with_open_timeout(Duration::from_secs(5)),
        LATEST_VERSION + 1,
        &plan,
    )
    .await
    .expect("upgrade once the app state closes");

    listener.await.unwrap();
    assert!(state.db.is_closed());
    assert_eq!(coordinator.live_versions(upgraded.name()), vec![LATEST_VERSION + 1]);
    upgraded.close().await;
}

#[tokio::test]
async fn version_change_listener_ends_on_normal_shutdown() {
    let dir = TempDir::new().unwrap();
    let state = util::open_state(&dir).await;
    let listener = state.close_on_version_change();
    state.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .expect("listener exits")
        .unwrap();
}
