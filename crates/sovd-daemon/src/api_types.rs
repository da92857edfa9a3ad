//! Request and response types for all sovd-daemon HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded by
//! Axum and decoded by tests. No business logic lives here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sovd_schemas::{CommandRow, CommandStatus, ResponseRow};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// GET /api/v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// POST /api/v1/commands
// ---------------------------------------------------------------------------

// The submission request body is parsed field-by-field in `routes.rs` so
// missing fields and malformed values map onto distinct error codes.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitCommandResponse {
    pub command_id: Uuid,
    pub status: CommandStatus,
    pub submitted_at: DateTime<Utc>,
    /// Where to subscribe for the response stream.
    pub stream_url: String,
}

// ---------------------------------------------------------------------------
// GET /api/v1/commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListCommandsResponse {
    pub commands: Vec<CommandRow>,
    pub limit: i64,
    pub offset: i64,
    /// Rows in this page (not the total matching count).
    pub count: usize,
}

// ---------------------------------------------------------------------------
// GET /api/v1/commands/{id}/responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponsesBody {
    pub command_id: Uuid,
    pub responses: Vec<ResponseRow>,
    pub count: usize,
}
