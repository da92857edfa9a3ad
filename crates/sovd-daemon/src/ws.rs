//! Stream gateway: WebSocket delivery of a command's response stream.
//!
//! Protocol, per socket:
//! 1. verify the `token` query parameter; failures close with 1008;
//! 2. load the command and enforce owner-or-admin access (1008 otherwise);
//! 3. subscribe to `response:{command_id}`, **then** catch up from the store
//!    so chunks persisted before the subscription was live are not lost;
//! 4. forward live events, skipping any sequence number already sent — a
//!    chunk is delivered at most once per socket;
//! 5. after the terminal `status`/`error` event, close with 1000.
//!
//! A lagged broadcast receiver means the socket could not keep up with its
//! bounded buffer; the server closes it with 1013 and the client re-syncs
//! from history. Client disconnects release the subscription but never
//! cancel the execution.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, warn};
use uuid::Uuid;

use sovd_schemas::{response_channel, CommandRow, CommandStatus, StreamEvent};

use crate::state::AppState;

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_INTERNAL_ERROR: u16 = 1011;
const CLOSE_OVERFLOW: u16 = 1013;

#[derive(Debug, Deserialize)]
pub(crate) struct StreamQuery {
    token: Option<String>,
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// GET /ws/responses/{command_id}?token={jwt} (WebSocket upgrade)
pub(crate) async fn ws_responses(
    ws: WebSocketUpgrade,
    State(st): State<Arc<AppState>>,
    Path(command_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(st, socket, command_id, query.token))
}

async fn handle_socket(
    st: Arc<AppState>,
    socket: WebSocket,
    command_id_raw: String,
    token: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();

    // Handshake: the socket is accepted first so the client observes a
    // proper close code instead of a failed upgrade.
    let identity = match token.as_deref().map(|t| st.verifier.verify(t)) {
        Some(Ok(identity)) => identity,
        _ => {
            close(&mut sender, CLOSE_POLICY_VIOLATION, "authentication failed").await;
            return;
        }
    };

    // Absent rows and unparseable ids look identical to the subscriber.
    let Ok(command_id) = command_id_raw.parse::<Uuid>() else {
        close(&mut sender, CLOSE_POLICY_VIOLATION, "unknown command").await;
        return;
    };
    let command = match st.store.get_command(command_id).await {
        Ok(row) => row,
        Err(sovd_db::StoreError::NotFound(_)) => {
            close(&mut sender, CLOSE_POLICY_VIOLATION, "unknown command").await;
            return;
        }
        Err(err) => {
            error!(%command_id, %err, "command lookup failed during handshake");
            close(&mut sender, CLOSE_INTERNAL_ERROR, "internal error").await;
            return;
        }
    };

    if !identity.may_access(command.user_id) {
        debug!(%command_id, subscriber = %identity.user_id, "stream access refused");
        close(&mut sender, CLOSE_POLICY_VIOLATION, "not authorized for this command").await;
        return;
    }

    // Subscribe before reading history: anything published from here on is
    // buffered in `rx`, anything earlier is in the store. Dedup bridges the
    // overlap.
    let channel = response_channel(command_id);
    let mut rx = st.bus.subscribe(&channel);
    let mut highest_sent: i32 = 0;

    if catch_up(&st, &mut sender, command_id, &mut highest_sent)
        .await
        .is_err()
    {
        return;
    }

    // The command may have finished before (or while) we caught up, in which
    // case no further live event is guaranteed to arrive. Responses are
    // always persisted before the terminal transition, so one more store
    // read is a complete picture.
    match st.store.get_command(command_id).await {
        Ok(row) if row.status.is_terminal() => {
            if catch_up(&st, &mut sender, command_id, &mut highest_sent)
                .await
                .is_ok()
            {
                let _ = send_event(&mut sender, &terminal_event(&row)).await;
                close(&mut sender, CLOSE_NORMAL, "end of stream").await;
            }
            return;
        }
        Ok(_) => {}
        Err(err) => {
            error!(%command_id, %err, "command re-read failed after catch-up");
            close(&mut sender, CLOSE_INTERNAL_ERROR, "internal error").await;
            return;
        }
    }

    // Live loop: forward bus events, watch for client departure, cut idle
    // sockets. The sleep restarts each iteration, so it fires only after a
    // full idle window with no traffic at all.
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Ok(event) => {
                    if let Some(seq) = event.sequence_number() {
                        if seq <= highest_sent {
                            continue;
                        }
                        highest_sent = seq;
                    }
                    if send_event(&mut sender, &event).await.is_err() {
                        return;
                    }
                    if event.is_terminal() {
                        close(&mut sender, CLOSE_NORMAL, "end of stream").await;
                        return;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(%command_id, missed, "slow subscriber overflowed its send buffer");
                    close(
                        &mut sender,
                        CLOSE_OVERFLOW,
                        "subscriber too slow; re-sync from history",
                    )
                    .await;
                    return;
                }
                Err(RecvError::Closed) => return,
            },
            incoming = receiver.next() => match incoming {
                // Client went away; the execution continues and stays
                // observable through catch-up on a future subscription.
                None | Some(Ok(Message::Close(_))) | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            },
            _ = tokio::time::sleep(st.config.ws_idle_timeout) => {
                close(&mut sender, CLOSE_NORMAL, "idle timeout").await;
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Send every persisted chunk above the watermark, ascending. Advances the
/// watermark as it goes; safe to call repeatedly.
async fn catch_up(
    st: &AppState,
    sender: &mut SplitSink<WebSocket, Message>,
    command_id: Uuid,
    highest_sent: &mut i32,
) -> Result<(), ()> {
    let rows = match st.store.list_responses(command_id).await {
        Ok(rows) => rows,
        Err(err) => {
            error!(%command_id, %err, "history read failed during catch-up");
            close(sender, CLOSE_INTERNAL_ERROR, "internal error").await;
            return Err(());
        }
    };

    for row in rows {
        if row.sequence_number <= *highest_sent {
            continue;
        }
        if send_event(sender, &StreamEvent::from_response(&row))
            .await
            .is_err()
        {
            return Err(());
        }
        *highest_sent = row.sequence_number;
    }
    Ok(())
}

fn terminal_event(row: &CommandRow) -> StreamEvent {
    match row.status {
        CommandStatus::Failed => StreamEvent::Error {
            error_message: row
                .error_message
                .clone()
                .unwrap_or_else(|| "command failed".to_string()),
        },
        status => StreamEvent::Status {
            status,
            completed_at: row.completed_at,
        },
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &StreamEvent,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).expect("stream events always serialize");
    sender.send(Message::Text(text)).await
}

async fn close(sender: &mut SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
