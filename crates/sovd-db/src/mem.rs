//! Deterministic in-memory persistence gateway.
//!
//! Observable semantics are identical to the Postgres gateway: the same
//! lifecycle enforcement, the same sequence-conflict detection, the same
//! history order. Scenario tests and dev mode run against this store; no
//! randomness beyond freshly minted row ids.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use sovd_schemas::{
    AuditEventRow, CommandRow, CommandStatus, ResponseRow, UserRow, VehicleRow,
};

use crate::store::{
    page_in_history_order, CommandFilter, CommandStore, EntityKind, NewAuditEvent, NewCommand,
    StoreError,
};

#[derive(Default)]
struct Inner {
    users: BTreeMap<Uuid, UserRow>,
    vehicles: BTreeMap<Uuid, VehicleRow>,
    commands: BTreeMap<Uuid, CommandRow>,
    /// Per command, in insertion order.
    responses: BTreeMap<Uuid, Vec<ResponseRow>>,
    audit: Vec<AuditEventRow>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Default::default()
    }

    /// Snapshot of the audit trail, for assertions in scenario tests.
    pub async fn audit_events(&self) -> Vec<AuditEventRow> {
        self.inner.lock().await.audit.clone()
    }
}

#[async_trait]
impl CommandStore for MemoryStore {
    async fn insert_command(&self, new: NewCommand) -> Result<CommandRow, StoreError> {
        let mut inner = self.inner.lock().await;

        if !inner.vehicles.contains_key(&new.vehicle_id) {
            return Err(StoreError::NotFound(EntityKind::Vehicle));
        }

        let row = CommandRow {
            command_id: Uuid::new_v4(),
            user_id: new.user_id,
            vehicle_id: new.vehicle_id,
            command_name: new.command_name,
            command_params: new.command_params,
            status: CommandStatus::Pending,
            error_message: None,
            submitted_at: Utc::now(),
            completed_at: None,
        };
        inner.commands.insert(row.command_id, row.clone());
        Ok(row)
    }

    async fn update_command_status(
        &self,
        command_id: Uuid,
        new_status: CommandStatus,
        error_message: Option<String>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<CommandRow, StoreError> {
        let mut inner = self.inner.lock().await;

        let row = inner
            .commands
            .get_mut(&command_id)
            .ok_or(StoreError::NotFound(EntityKind::Command))?;

        if !row.status.can_transition_to(new_status) {
            return Err(StoreError::IllegalTransition {
                from: row.status,
                to: new_status,
            });
        }

        row.status = new_status;
        row.completed_at = if new_status.is_terminal() {
            Some(completed_at.unwrap_or_else(Utc::now))
        } else {
            None
        };
        row.error_message = if new_status == CommandStatus::Failed {
            error_message
        } else {
            None
        };

        Ok(row.clone())
    }

    async fn insert_response(
        &self,
        command_id: Uuid,
        payload: Value,
        sequence_number: i32,
        is_final: bool,
    ) -> Result<ResponseRow, StoreError> {
        let mut inner = self.inner.lock().await;

        if !inner.commands.contains_key(&command_id) {
            return Err(StoreError::NotFound(EntityKind::Command));
        }

        let rows = inner.responses.entry(command_id).or_default();
        if rows.iter().any(|r| r.sequence_number == sequence_number) {
            return Err(StoreError::SequenceConflict {
                command_id,
                sequence_number,
            });
        }

        let row = ResponseRow {
            response_id: Uuid::new_v4(),
            command_id,
            response_payload: payload,
            sequence_number,
            is_final,
            received_at: Utc::now(),
        };
        rows.push(row.clone());
        Ok(row)
    }

    async fn get_command(&self, command_id: Uuid) -> Result<CommandRow, StoreError> {
        self.inner
            .lock()
            .await
            .commands
            .get(&command_id)
            .cloned()
            .ok_or(StoreError::NotFound(EntityKind::Command))
    }

    async fn list_responses(&self, command_id: Uuid) -> Result<Vec<ResponseRow>, StoreError> {
        let inner = self.inner.lock().await;
        let mut rows = inner
            .responses
            .get(&command_id)
            .cloned()
            .unwrap_or_default();
        rows.sort_by_key(|r| r.sequence_number);
        Ok(rows)
    }

    async fn list_commands(&self, filter: &CommandFilter) -> Result<Vec<CommandRow>, StoreError> {
        let inner = self.inner.lock().await;
        let rows: Vec<CommandRow> = inner
            .commands
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();
        Ok(page_in_history_order(rows, filter))
    }

    async fn log_audit(&self, event: NewAuditEvent) {
        let mut inner = self.inner.lock().await;
        inner.audit.push(AuditEventRow {
            audit_id: Uuid::new_v4(),
            actor_user_id: event.actor_user_id,
            entity_type: event.entity_type,
            entity_id: event.entity_id,
            action: event.action,
            details: event.details,
            created_at: Utc::now(),
        });
    }

    async fn get_vehicle(&self, vehicle_id: Uuid) -> Result<VehicleRow, StoreError> {
        self.inner
            .lock()
            .await
            .vehicles
            .get(&vehicle_id)
            .cloned()
            .ok_or(StoreError::NotFound(EntityKind::Vehicle))
    }

    async fn upsert_vehicle(&self, vehicle: VehicleRow) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .vehicles
            .insert(vehicle.vehicle_id, vehicle);
        Ok(())
    }

    async fn list_vehicles(&self) -> Result<Vec<VehicleRow>, StoreError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<VehicleRow> = inner.vehicles.values().cloned().collect();
        rows.sort_by(|a, b| a.vin.cmp(&b.vin));
        Ok(rows)
    }

    async fn get_user(&self, user_id: Uuid) -> Result<UserRow, StoreError> {
        self.inner
            .lock()
            .await
            .users
            .get(&user_id)
            .cloned()
            .ok_or(StoreError::NotFound(EntityKind::User))
    }

    async fn get_user_by_username(&self, username: &str) -> Result<UserRow, StoreError> {
        self.inner
            .lock()
            .await
            .users
            .values()
            .find(|u| u.username == username)
            .cloned()
            .ok_or(StoreError::NotFound(EntityKind::User))
    }

    async fn upsert_user(&self, user: UserRow) -> Result<(), StoreError> {
        self.inner.lock().await.users.insert(user.user_id, user);
        Ok(())
    }
}
