//! Shared row types, status enums and the stream-event wire schema.
//!
//! These types are `Serialize + Deserialize` so they can cross the REST,
//! pub/sub and WebSocket boundaries unchanged. No business logic lives here;
//! lifecycle rules are expressed only as predicates (`is_terminal`,
//! `can_transition_to`) that the store and orchestrator enforce.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Roles & identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Engineer,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Engineer => "engineer",
            UserRole::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "engineer" => Some(UserRole::Engineer),
            "admin" => Some(UserRole::Admin),
            _ => None,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, UserRole::Admin)
    }
}

/// Resolved caller identity, produced by the auth collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: UserRole,
}

impl Identity {
    /// Owner-or-admin check used by history reads and the stream gateway.
    pub fn may_access(&self, owner: Uuid) -> bool {
        self.role.is_admin() || self.user_id == owner
    }
}

// ---------------------------------------------------------------------------
// Vehicle connectivity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connected" => Some(ConnectionStatus::Connected),
            "disconnected" => Some(ConnectionStatus::Disconnected),
            "error" => Some(ConnectionStatus::Error),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Command lifecycle
// ---------------------------------------------------------------------------

/// Command state machine: `pending → in_progress → {completed, failed}`,
/// with `pending → failed` for dispatch errors before the first chunk.
/// Terminal states have no outbound transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::InProgress => "in_progress",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CommandStatus::Pending),
            "in_progress" => Some(CommandStatus::InProgress),
            "completed" => Some(CommandStatus::Completed),
            "failed" => Some(CommandStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }

    /// Legal transitions only. Self-transition to `in_progress` is allowed so
    /// the executor's begin-work step stays idempotent.
    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        use CommandStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Failed)
                | (InProgress, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
        )
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRow {
    pub user_id: Uuid,
    pub username: String,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleRow {
    pub vehicle_id: Uuid,
    pub vin: String,
    pub make: String,
    pub model: String,
    pub year: i32,
    pub connection_status: ConnectionStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRow {
    pub command_id: Uuid,
    pub user_id: Uuid,
    pub vehicle_id: Uuid,
    pub command_name: String,
    pub command_params: Value,
    pub status: CommandStatus,
    /// Set iff `status = failed`.
    pub error_message: Option<String>,
    pub submitted_at: DateTime<Utc>,
    /// Set iff the status is terminal.
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRow {
    pub response_id: Uuid,
    pub command_id: Uuid,
    pub response_payload: Value,
    /// Positive, unique per command, strictly increasing in insertion order.
    pub sequence_number: i32,
    pub is_final: bool,
    pub received_at: DateTime<Utc>,
}

/// Append-only audit record. Foreign keys are nullable so history survives
/// referent deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEventRow {
    pub audit_id: Uuid,
    pub actor_user_id: Option<Uuid>,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub action: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Stream events — the wire schema shared by the bus and the WebSocket layer
// ---------------------------------------------------------------------------

/// Channel name for a command's response stream.
pub fn response_channel(command_id: Uuid) -> String {
    format!("response:{command_id}")
}

/// One server→client stream message. The same JSON shape is published on
/// `response:{command_id}` and forwarded over the WebSocket, so the stream
/// gateway never transforms payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Response {
        response_id: Uuid,
        response_payload: Value,
        sequence_number: i32,
        is_final: bool,
        received_at: DateTime<Utc>,
    },
    Status {
        status: CommandStatus,
        completed_at: Option<DateTime<Utc>>,
    },
    Error {
        error_message: String,
    },
}

impl StreamEvent {
    pub fn from_response(row: &ResponseRow) -> Self {
        StreamEvent::Response {
            response_id: row.response_id,
            response_payload: row.response_payload.clone(),
            sequence_number: row.sequence_number,
            is_final: row.is_final,
            received_at: row.received_at,
        }
    }

    /// Sequence number for dedup; `None` for status/error events.
    pub fn sequence_number(&self) -> Option<i32> {
        match self {
            StreamEvent::Response {
                sequence_number, ..
            } => Some(*sequence_number),
            _ => None,
        }
    }

    /// True for the events after which the stream gateway closes the socket.
    pub fn is_terminal(&self) -> bool {
        match self {
            StreamEvent::Status { status, .. } => status.is_terminal(),
            StreamEvent::Error { .. } => true,
            StreamEvent::Response { .. } => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
