//! Lifecycle enforcement at the persistence gateway: legal transitions
//! succeed, terminal states lock, and the error/completion columns track the
//! status invariants.

use chrono::Utc;
use serde_json::json;
use sovd_db::{CommandStore, MemoryStore, NewCommand, StoreError};
use sovd_schemas::{CommandStatus, ConnectionStatus, VehicleRow};
use uuid::Uuid;

fn vehicle(status: ConnectionStatus) -> VehicleRow {
    VehicleRow {
        vehicle_id: Uuid::new_v4(),
        vin: format!("{:0>17}", Uuid::new_v4().as_u128() % 99_999_999),
        make: "Audi".to_string(),
        model: "Q5".to_string(),
        year: 2022,
        connection_status: status,
        last_seen_at: Some(Utc::now()),
        metadata: json!({}),
    }
}

async fn seeded_command(store: &MemoryStore) -> Uuid {
    let v = vehicle(ConnectionStatus::Connected);
    store.upsert_vehicle(v.clone()).await.unwrap();

    let row = store
        .insert_command(NewCommand {
            user_id: Uuid::new_v4(),
            vehicle_id: v.vehicle_id,
            command_name: "ReadDTC".to_string(),
            command_params: json!({"ecuAddress": "0x10"}),
        })
        .await
        .unwrap();

    assert_eq!(row.status, CommandStatus::Pending);
    assert!(row.completed_at.is_none());
    row.command_id
}

#[tokio::test]
async fn insert_requires_existing_vehicle() {
    let store = MemoryStore::new();
    let err = store
        .insert_command(NewCommand {
            user_id: Uuid::new_v4(),
            vehicle_id: Uuid::new_v4(),
            command_name: "ReadDTC".to_string(),
            command_params: json!({"ecuAddress": "0x10"}),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn happy_path_reaches_completed_with_completed_at() {
    let store = MemoryStore::new();
    let id = seeded_command(&store).await;

    store
        .update_command_status(id, CommandStatus::InProgress, None, None)
        .await
        .unwrap();

    let row = store
        .update_command_status(id, CommandStatus::Completed, None, None)
        .await
        .unwrap();

    assert_eq!(row.status, CommandStatus::Completed);
    assert!(row.error_message.is_none());
    let completed_at = row.completed_at.expect("terminal state sets completed_at");
    assert!(completed_at >= row.submitted_at);
}

#[tokio::test]
async fn in_progress_transition_is_idempotent() {
    let store = MemoryStore::new();
    let id = seeded_command(&store).await;

    store
        .update_command_status(id, CommandStatus::InProgress, None, None)
        .await
        .unwrap();
    // A second begin-work call observes in_progress and succeeds unchanged.
    let row = store
        .update_command_status(id, CommandStatus::InProgress, None, None)
        .await
        .unwrap();
    assert_eq!(row.status, CommandStatus::InProgress);
}

#[tokio::test]
async fn pending_to_failed_is_legal_for_dispatch_errors() {
    let store = MemoryStore::new();
    let id = seeded_command(&store).await;

    let row = store
        .update_command_status(
            id,
            CommandStatus::Failed,
            Some("dispatch error before first chunk".to_string()),
            None,
        )
        .await
        .unwrap();

    assert_eq!(row.status, CommandStatus::Failed);
    assert_eq!(
        row.error_message.as_deref(),
        Some("dispatch error before first chunk")
    );
    assert!(row.completed_at.is_some());
}

#[tokio::test]
async fn terminal_states_reject_every_further_transition() {
    let store = MemoryStore::new();
    let id = seeded_command(&store).await;

    store
        .update_command_status(id, CommandStatus::InProgress, None, None)
        .await
        .unwrap();
    store
        .update_command_status(id, CommandStatus::Completed, None, None)
        .await
        .unwrap();

    for next in [
        CommandStatus::Pending,
        CommandStatus::InProgress,
        CommandStatus::Completed,
        CommandStatus::Failed,
    ] {
        let err = store
            .update_command_status(id, next, None, None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, StoreError::IllegalTransition { .. }),
            "transition to {next:?} must be illegal"
        );
    }

    // The row itself is untouched by the refused attempts.
    let row = store.get_command(id).await.unwrap();
    assert_eq!(row.status, CommandStatus::Completed);
}

#[tokio::test]
async fn pending_cannot_jump_straight_to_completed() {
    let store = MemoryStore::new();
    let id = seeded_command(&store).await;

    let err = store
        .update_command_status(id, CommandStatus::Completed, None, None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        StoreError::IllegalTransition {
            from: CommandStatus::Pending,
            to: CommandStatus::Completed,
        }
    );
}

#[tokio::test]
async fn error_message_is_dropped_on_non_failed_targets() {
    let store = MemoryStore::new();
    let id = seeded_command(&store).await;

    let row = store
        .update_command_status(
            id,
            CommandStatus::InProgress,
            Some("stray message".to_string()),
            None,
        )
        .await
        .unwrap();
    assert!(row.error_message.is_none());
}

#[tokio::test]
async fn unknown_command_is_not_found() {
    let store = MemoryStore::new();
    let err = store
        .update_command_status(Uuid::new_v4(), CommandStatus::InProgress, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}
