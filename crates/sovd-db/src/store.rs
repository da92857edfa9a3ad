//! The persistence gateway contract.
//!
//! Every other component reaches persistent rows only through
//! [`CommandStore`]. Two implementations exist: [`crate::PgStore`] (the
//! production Postgres gateway) and [`crate::MemoryStore`] (a deterministic
//! in-memory gateway with identical observable semantics, used by scenario
//! tests and dev mode).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sovd_schemas::{
    CommandRow, CommandStatus, ResponseRow, UserRow, VehicleRow,
};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    User,
    Vehicle,
    Command,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Vehicle => "vehicle",
            EntityKind::Command => "command",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(EntityKind),
    /// The `(command_id, sequence_number)` pair already exists.
    SequenceConflict {
        command_id: Uuid,
        sequence_number: i32,
    },
    /// The requested status change violates the lifecycle machine.
    IllegalTransition {
        from: CommandStatus,
        to: CommandStatus,
    },
    /// The backing storage could not serve the request.
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(kind) => write!(f, "{} not found", kind.as_str()),
            StoreError::SequenceConflict {
                command_id,
                sequence_number,
            } => write!(
                f,
                "response sequence {sequence_number} already exists for command {command_id}"
            ),
            StoreError::IllegalTransition { from, to } => write!(
                f,
                "illegal status transition {} -> {}",
                from.as_str(),
                to.as_str()
            ),
            StoreError::Unavailable(msg) => write!(f, "storage unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewCommand {
    pub user_id: Uuid,
    pub vehicle_id: Uuid,
    pub command_name: String,
    pub command_params: Value,
}

#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    pub actor_user_id: Option<Uuid>,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub action: String,
    pub details: Value,
}

/// History filter. The result order is total on
/// `(submitted_at desc, command_id desc)`; the time bounds are inclusive.
#[derive(Debug, Clone, Default)]
pub struct CommandFilter {
    pub user_id: Option<Uuid>,
    pub vehicle_id: Option<Uuid>,
    pub status: Option<CommandStatus>,
    pub submitted_after: Option<DateTime<Utc>>,
    pub submitted_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl CommandFilter {
    pub const DEFAULT_LIMIT: i64 = 50;
    pub const MAX_LIMIT: i64 = 100;

    /// Effective limit/offset. The REST layer rejects out-of-range values;
    /// the store clamps anyway so no caller can blow up a query.
    pub fn window(&self) -> (i64, i64) {
        let limit = self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, Self::MAX_LIMIT);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }

    /// True when `row` matches every set field (window excluded).
    pub fn matches(&self, row: &CommandRow) -> bool {
        if let Some(user_id) = self.user_id {
            if row.user_id != user_id {
                return false;
            }
        }
        if let Some(vehicle_id) = self.vehicle_id {
            if row.vehicle_id != vehicle_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if row.status != status {
                return false;
            }
        }
        if let Some(after) = self.submitted_after {
            if row.submitted_at < after {
                return false;
            }
        }
        if let Some(before) = self.submitted_before {
            if row.submitted_at > before {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// CommandStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Insert a new command in state `pending`, assigning `command_id` and
    /// `submitted_at`. Fails with `NotFound(Vehicle)` when the target row is
    /// absent. Connection-status policy belongs to the orchestrator, not
    /// here.
    async fn insert_command(&self, new: NewCommand) -> Result<CommandRow, StoreError>;

    /// Apply one lifecycle transition. `completed_at` defaults to now when
    /// the target status is terminal. Concurrent callers are serialised; the
    /// later one observes the earlier state and may see `IllegalTransition`.
    async fn update_command_status(
        &self,
        command_id: Uuid,
        new_status: CommandStatus,
        error_message: Option<String>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<CommandRow, StoreError>;

    /// Append one response chunk. Fails with `NotFound(Command)` or
    /// `SequenceConflict` when the `(command_id, sequence_number)` pair
    /// already exists.
    async fn insert_response(
        &self,
        command_id: Uuid,
        payload: Value,
        sequence_number: i32,
        is_final: bool,
    ) -> Result<ResponseRow, StoreError>;

    async fn get_command(&self, command_id: Uuid) -> Result<CommandRow, StoreError>;

    /// All responses of a command, ascending by `sequence_number`.
    async fn list_responses(&self, command_id: Uuid) -> Result<Vec<ResponseRow>, StoreError>;

    /// Filtered history page, `(submitted_at desc, command_id desc)`.
    async fn list_commands(&self, filter: &CommandFilter) -> Result<Vec<CommandRow>, StoreError>;

    /// Append-only audit trail. Fire-and-forget: failures are logged inside
    /// the gateway and never surfaced to the caller.
    async fn log_audit(&self, event: NewAuditEvent);

    async fn get_vehicle(&self, vehicle_id: Uuid) -> Result<VehicleRow, StoreError>;

    async fn upsert_vehicle(&self, vehicle: VehicleRow) -> Result<(), StoreError>;

    async fn list_vehicles(&self) -> Result<Vec<VehicleRow>, StoreError>;

    async fn get_user(&self, user_id: Uuid) -> Result<UserRow, StoreError>;

    async fn get_user_by_username(&self, username: &str) -> Result<UserRow, StoreError>;

    async fn upsert_user(&self, user: UserRow) -> Result<(), StoreError>;
}

/// Sort a full result set into the canonical history order and apply the
/// filter window. Shared by the in-memory gateway and tests that need to
/// mirror the SQL ordering.
pub fn page_in_history_order(mut rows: Vec<CommandRow>, filter: &CommandFilter) -> Vec<CommandRow> {
    rows.sort_by(|a, b| {
        b.submitted_at
            .cmp(&a.submitted_at)
            .then(b.command_id.cmp(&a.command_id))
    });
    let (limit, offset) = filter.window();
    rows.into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .collect()
}
