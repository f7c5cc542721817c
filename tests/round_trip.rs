#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;
use serde_json::json;
use tempfile::TempDir;

use handreceipt_lib::error::NOT_FOUND;
use handreceipt_lib::model::{
    Component, Consumable, ConsumptionHistoryEntry, LogAction, MaintenanceBulletin,
    MaintenanceItem, MaintenanceLog, Notification, Property, PropertyStatus,
};
use handreceipt_lib::outbox::{EntryStatus, HttpMethod, RemotePayload};
use handreceipt_lib::{AppState, OutboxEntry};

#[path = "util.rs"]
mod util;

/// Optional and variable fields shared by one generated record set.
#[derive(Debug, Clone)]
struct Extras {
    text: Option<String>,
    name: String,
    when: Option<i64>,
    components: Option<Vec<(String, Option<String>, i64)>>,
    parts: Vec<String>,
    status: PropertyStatus,
    flag: bool,
    quantity: i64,
}

fn name() -> impl Strategy<Value = String> {
    "[A-Za-z0-9][A-Za-z0-9 ,.'/-]{0,15}"
}

fn property_status() -> impl Strategy<Value = PropertyStatus> {
    prop::sample::select(vec![
        PropertyStatus::Available,
        PropertyStatus::Assigned,
        PropertyStatus::InTransit,
        PropertyStatus::Maintenance,
        PropertyStatus::Retired,
        PropertyStatus::Lost,
        PropertyStatus::Damaged,
    ])
}

fn extras() -> impl Strategy<Value = Extras> {
    (
        prop::option::of("\\PC{0,24}"),
        name(),
        prop::option::of(0i64..86_400_000),
        prop::option::of(prop::collection::vec(
            (name(), prop::option::of("[0-9]{4}-[0-9]{2}-[0-9]{3}-[0-9]{4}"), 0i64..50),
            0..4,
        )),
        prop::collection::vec(name(), 0..4),
        property_status(),
        any::<bool>(),
        1i64..500,
    )
        .prop_map(
            |(text, name, when, components, parts, status, flag, quantity)| Extras {
                text,
                name,
                when,
                components,
                parts,
                status,
                flag,
                quantity,
            },
        )
}

fn at(offset_ms: Option<i64>) -> Option<DateTime<Utc>> {
    offset_ms.map(|ms| util::day(3) + Duration::milliseconds(ms))
}

async fn write_and_read_back(state: &AppState, x: &Extras) {
    let store = &state.store;
    let stamp = at(x.when).unwrap_or_else(|| util::day(4));

    let mut property = util::property("p_1");
    property.name = x.name.clone();
    property.nsn = x.text.clone();
    property.status = x.status;
    property.assigned_to = x.text.clone();
    property.components = x.components.as_ref().map(|list| {
        list.iter()
            .map(|(name, nsn, quantity)| Component {
                name: name.clone(),
                nsn: nsn.clone(),
                quantity: *quantity,
            })
            .collect()
    });
    store.create(&property).await.unwrap();
    assert_eq!(store.get::<Property>("p_1").await.unwrap(), property);

    let mut supply = util::consumable("c_1", x.quantity, x.quantity / 2);
    supply.expiration_date = at(x.when);
    supply.notes = x.text.clone();
    store.create(&supply).await.unwrap();
    assert_eq!(store.get::<Consumable>(&supply.id).await.unwrap(), supply);

    let issue = ConsumptionHistoryEntry {
        id: "h_1".into(),
        item_id: "c_1".into(),
        quantity: x.quantity,
        date: stamp,
        issued_to: x.name.clone(),
        issued_by: "SSG Reyes".into(),
        notes: x.text.clone(),
    };
    store.create(&issue).await.unwrap();
    assert_eq!(store.get::<ConsumptionHistoryEntry>("h_1").await.unwrap(), issue);

    let mut request = util::maintenance_item("m_1", Some("p_1"));
    request.description = x.text.clone();
    request.scheduled_date = at(x.when);
    request.assigned_to = x.text.clone();
    request.parts_required = x.parts.clone();
    store.create(&request).await.unwrap();
    assert_eq!(store.get::<MaintenanceItem>(&request.id).await.unwrap(), request);

    let log = MaintenanceLog {
        id: "l_1".into(),
        maintenance_id: "m_1".into(),
        timestamp: stamp,
        action: if x.flag { LogAction::PartsOrdered } else { LogAction::Updated },
        performed_by: x.name.clone(),
        notes: x.text.clone(),
    };
    store.create(&log).await.unwrap();
    assert_eq!(store.get::<MaintenanceLog>("l_1").await.unwrap(), log);

    let bulletin = MaintenanceBulletin {
        id: "b_1".into(),
        title: x.name.clone(),
        message: x.text.clone().unwrap_or_default(),
        category: "weapons".into(),
        affected_items: x.parts.clone(),
        posted_by: "CW2 Lang".into(),
        posted_date: stamp,
        resolved: x.flag,
        resolved_date: if x.flag { Some(stamp) } else { None },
    };
    store.create(&bulletin).await.unwrap();
    assert_eq!(store.get::<MaintenanceBulletin>("b_1").await.unwrap(), bulletin);

    let notification = Notification {
        id: "n_1".into(),
        kind: "low-stock".into(),
        message: x.name.clone(),
        timestamp: stamp,
        read: x.flag,
    };
    store.create(&notification).await.unwrap();
    assert_eq!(store.get::<Notification>("n_1").await.unwrap(), notification);

    let entry = OutboxEntry {
        id: "o_1".into(),
        kind: "property.update".into(),
        entity_key: x.flag.then(|| "properties:p_1".to_string()),
        payload: RemotePayload {
            method: HttpMethod::Patch,
            url: "/api/property/p_1".into(),
            body: x.text.as_ref().map(|t| json!({ "notes": t, "qty": x.quantity })),
        },
        idempotency_key: format!("key-{}", x.quantity),
        timestamp: 1_700_000_000_000 + x.quantity,
        status: if x.flag { EntryStatus::Failed } else { EntryStatus::Pending },
        retry_count: (x.quantity % 4) as u32,
        next_attempt_at: x.when,
        last_error: x.text.clone(),
    };
    state.db.put(&entry).await.unwrap();
    assert_eq!(state.db.get::<OutboxEntry>("o_1").await.unwrap(), Some(entry));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn every_entity_reads_back_as_written(x in extras()) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let dir = TempDir::new().unwrap();
            let state = util::open_state(&dir).await;
            write_and_read_back(&state, &x).await;
            state.shutdown().await;
        });
    }
}

fn notice(id: &str, hour: i64) -> Notification {
    Notification {
        id: id.into(),
        kind: "maintenance-due".into(),
        message: format!("Notice {id}"),
        timestamp: util::day(2) + Duration::hours(hour),
        read: false,
    }
}

#[tokio::test]
async fn notifications_move_from_unread_to_read() {
    let dir = TempDir::new().unwrap();
    let state = util::open_state(&dir).await;
    let store = &state.store;
    store.create(&notice("n_1", 1)).await.unwrap();
    store.create(&notice("n_2", 3)).await.unwrap();
    let mut seen = notice("n_3", 2);
    seen.read = true;
    store.create(&seen).await.unwrap();

    let unread: Vec<String> = store
        .unread_notifications()
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect();
    assert_eq!(unread, vec!["n_2", "n_1"]);

    let marked = store.mark_notification_read("n_2").await.unwrap();
    assert!(marked.read);
    assert!(store.get::<Notification>("n_2").await.unwrap().read);
    let again = store.mark_notification_read("n_2").await.unwrap();
    assert_eq!(again, marked);

    let unread = store.unread_notifications().await.unwrap();
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0].id, "n_1");

    let err = store.mark_notification_read("n_missing").await.unwrap_err();
    assert_eq!(err.code(), NOT_FOUND);
    state.shutdown().await;
}
