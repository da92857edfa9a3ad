//! History queries: total time-descending order, field filters, inclusive
//! time bounds and window clamping.

use chrono::Utc;
use serde_json::json;
use sovd_db::{CommandFilter, CommandStore, MemoryStore, NewCommand};
use sovd_schemas::{CommandStatus, ConnectionStatus, VehicleRow};
use std::time::Duration;
use uuid::Uuid;

async fn seed_vehicle(store: &MemoryStore) -> Uuid {
    let v = VehicleRow {
        vehicle_id: Uuid::new_v4(),
        vin: format!("{:0>17}", Uuid::new_v4().as_u128() % 99_999_999),
        make: "BMW".to_string(),
        model: "i4".to_string(),
        year: 2023,
        connection_status: ConnectionStatus::Connected,
        last_seen_at: Some(Utc::now()),
        metadata: json!({}),
    };
    store.upsert_vehicle(v.clone()).await.unwrap();
    v.vehicle_id
}

async fn submit(store: &MemoryStore, user_id: Uuid, vehicle_id: Uuid) -> Uuid {
    let row = store
        .insert_command(NewCommand {
            user_id,
            vehicle_id,
            command_name: "ReadDTC".to_string(),
            command_params: json!({"ecuAddress": "0x10"}),
        })
        .await
        .unwrap();
    // Keep submitted_at strictly increasing so the expected order is exact.
    tokio::time::sleep(Duration::from_millis(2)).await;
    row.command_id
}

#[tokio::test]
async fn list_is_time_descending_and_appends_at_head() {
    let store = MemoryStore::new();
    let vehicle = seed_vehicle(&store).await;
    let user = Uuid::new_v4();

    let first = submit(&store, user, vehicle).await;
    let second = submit(&store, user, vehicle).await;

    let page = store.list_commands(&CommandFilter::default()).await.unwrap();
    let ids: Vec<Uuid> = page.iter().map(|c| c.command_id).collect();
    assert_eq!(ids, vec![second, first]);

    // History monotonicity: a new command only appends to the head.
    let third = submit(&store, user, vehicle).await;
    let page = store.list_commands(&CommandFilter::default()).await.unwrap();
    let ids: Vec<Uuid> = page.iter().map(|c| c.command_id).collect();
    assert_eq!(ids, vec![third, second, first]);
}

#[tokio::test]
async fn owner_and_vehicle_filters_restrict_rows() {
    let store = MemoryStore::new();
    let vehicle_a = seed_vehicle(&store).await;
    let vehicle_b = seed_vehicle(&store).await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let a1 = submit(&store, alice, vehicle_a).await;
    let _b1 = submit(&store, bob, vehicle_a).await;
    let a2 = submit(&store, alice, vehicle_b).await;

    let by_owner = store
        .list_commands(&CommandFilter {
            user_id: Some(alice),
            ..Default::default()
        })
        .await
        .unwrap();
    let ids: Vec<Uuid> = by_owner.iter().map(|c| c.command_id).collect();
    assert_eq!(ids, vec![a2, a1]);

    let by_both = store
        .list_commands(&CommandFilter {
            user_id: Some(alice),
            vehicle_id: Some(vehicle_a),
            ..Default::default()
        })
        .await
        .unwrap();
    let ids: Vec<Uuid> = by_both.iter().map(|c| c.command_id).collect();
    assert_eq!(ids, vec![a1]);
}

#[tokio::test]
async fn status_filter_matches_current_state() {
    let store = MemoryStore::new();
    let vehicle = seed_vehicle(&store).await;
    let user = Uuid::new_v4();

    let done = submit(&store, user, vehicle).await;
    let _pending = submit(&store, user, vehicle).await;

    store
        .update_command_status(done, CommandStatus::InProgress, None, None)
        .await
        .unwrap();
    store
        .update_command_status(done, CommandStatus::Completed, None, None)
        .await
        .unwrap();

    let completed = store
        .list_commands(&CommandFilter {
            status: Some(CommandStatus::Completed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].command_id, done);
}

#[tokio::test]
async fn time_bounds_are_inclusive() {
    let store = MemoryStore::new();
    let vehicle = seed_vehicle(&store).await;
    let user = Uuid::new_v4();

    let early = submit(&store, user, vehicle).await;
    let mid = submit(&store, user, vehicle).await;
    let late = submit(&store, user, vehicle).await;

    let rows = store.list_commands(&CommandFilter::default()).await.unwrap();
    let ts = |id: Uuid| {
        rows.iter()
            .find(|c| c.command_id == id)
            .unwrap()
            .submitted_at
    };

    let page = store
        .list_commands(&CommandFilter {
            submitted_after: Some(ts(early)),
            submitted_before: Some(ts(mid)),
            ..Default::default()
        })
        .await
        .unwrap();
    let ids: Vec<Uuid> = page.iter().map(|c| c.command_id).collect();
    assert_eq!(ids, vec![mid, early], "bounds include both endpoints");
    assert!(!ids.contains(&late));
}

#[tokio::test]
async fn window_paginates_without_overlap() {
    let store = MemoryStore::new();
    let vehicle = seed_vehicle(&store).await;
    let user = Uuid::new_v4();

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(submit(&store, user, vehicle).await);
    }
    ids.reverse(); // expected head-first order

    let first_page = store
        .list_commands(&CommandFilter {
            limit: Some(2),
            offset: Some(0),
            ..Default::default()
        })
        .await
        .unwrap();
    let second_page = store
        .list_commands(&CommandFilter {
            limit: Some(2),
            offset: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();

    let got: Vec<Uuid> = first_page
        .iter()
        .chain(second_page.iter())
        .map(|c| c.command_id)
        .collect();
    assert_eq!(got, ids[..4].to_vec());
}

#[tokio::test]
async fn window_is_clamped_defensively() {
    let store = MemoryStore::new();
    let vehicle = seed_vehicle(&store).await;
    let user = Uuid::new_v4();
    submit(&store, user, vehicle).await;

    // Out-of-range values are clamped rather than exploding.
    let page = store
        .list_commands(&CommandFilter {
            limit: Some(10_000),
            offset: Some(-5),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
}
