//! Background command execution.
//!
//! Exactly one detached task exists per submitted command, from `pending`
//! until a terminal status. The task drives the connector under the hard
//! timeout with a sink that persists each chunk and only then publishes the
//! matching event — every event observed on the channel corresponds to a row
//! already committed in storage, which is what makes stream catch-up
//! correct.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{error, warn};

use sovd_connector::{
    execute_with_deadline, ConnectorOutcome, ExecuteRequest, ResponseChunk, ResponseSink,
};
use sovd_db::{NewAuditEvent, StoreError};
use sovd_schemas::{response_channel, CommandRow, CommandStatus, StreamEvent};

use crate::state::AppState;

/// Detach the execution task for a freshly inserted command. The caller has
/// already produced the 202 response body by the time this task first runs.
pub fn spawn_execution(state: Arc<AppState>, command: CommandRow) {
    tokio::spawn(async move {
        run(state, command).await;
    });
}

async fn run(state: Arc<AppState>, command: CommandRow) {
    let command_id = command.command_id;

    // Begin work. Idempotent against a concurrent begin; a terminal row
    // means another path already finished this command and there is nothing
    // left to do.
    match state
        .store
        .update_command_status(command_id, CommandStatus::InProgress, None, None)
        .await
    {
        Ok(_) => {}
        Err(StoreError::IllegalTransition { from, .. }) if from.is_terminal() => {
            warn!(%command_id, from = from.as_str(), "command already terminal before dispatch");
            return;
        }
        Err(err) => {
            error!(%command_id, %err, "failed to begin command execution");
            finish_failed(&state, command_id, format!("dispatch error: {err}")).await;
            return;
        }
    }

    let request = ExecuteRequest {
        command_id,
        vehicle_id: command.vehicle_id,
        command_name: command.command_name.clone(),
        command_params: command.command_params.clone(),
    };
    let mut sink = StoreSink {
        state: Arc::clone(&state),
        command_id,
    };

    let outcome = execute_with_deadline(
        state.connector.as_ref(),
        &request,
        &mut sink,
        state.config.execute_timeout,
    )
    .await;

    match outcome {
        ConnectorOutcome::Completed => finish_completed(&state, command_id).await,
        ConnectorOutcome::Failed(err) => {
            finish_failed(&state, command_id, err.to_string()).await
        }
    }
}

// ---------------------------------------------------------------------------
// Terminal transitions
// ---------------------------------------------------------------------------

async fn finish_completed(state: &AppState, command_id: uuid::Uuid) {
    match state
        .store
        .update_command_status(command_id, CommandStatus::Completed, None, None)
        .await
    {
        Ok(row) => {
            state.bus.publish(
                &response_channel(command_id),
                StreamEvent::Status {
                    status: CommandStatus::Completed,
                    completed_at: row.completed_at,
                },
            );
            state
                .store
                .log_audit(NewAuditEvent {
                    actor_user_id: None,
                    entity_type: "command".to_string(),
                    entity_id: Some(command_id),
                    action: "command.completed".to_string(),
                    details: json!({}),
                })
                .await;
        }
        Err(err) => error!(%command_id, %err, "failed to mark command completed"),
    }
}

async fn finish_failed(state: &AppState, command_id: uuid::Uuid, reason: String) {
    match state
        .store
        .update_command_status(
            command_id,
            CommandStatus::Failed,
            Some(reason.clone()),
            None,
        )
        .await
    {
        Ok(_) => {
            state.bus.publish(
                &response_channel(command_id),
                StreamEvent::Error {
                    error_message: reason.clone(),
                },
            );
            state
                .store
                .log_audit(NewAuditEvent {
                    actor_user_id: None,
                    entity_type: "command".to_string(),
                    entity_id: Some(command_id),
                    action: "command.failed".to_string(),
                    details: json!({ "errorMessage": reason }),
                })
                .await;
        }
        Err(err) => error!(%command_id, %err, "failed to mark command failed"),
    }
}

// ---------------------------------------------------------------------------
// StoreSink — persist, then publish
// ---------------------------------------------------------------------------

struct StoreSink {
    state: Arc<AppState>,
    command_id: uuid::Uuid,
}

#[async_trait]
impl ResponseSink for StoreSink {
    async fn deliver(&mut self, chunk: ResponseChunk) -> anyhow::Result<()> {
        let row = self
            .state
            .store
            .insert_response(
                self.command_id,
                chunk.payload,
                chunk.sequence_number,
                chunk.is_final,
            )
            .await?;

        // Only after the committed insert. The in-process bus cannot fail;
        // a lost event is recovered by subscribers through catch-up anyway.
        self.state.bus.publish(
            &response_channel(self.command_id),
            StreamEvent::from_response(&row),
        );
        Ok(())
    }
}
