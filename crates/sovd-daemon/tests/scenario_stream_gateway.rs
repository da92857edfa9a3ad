//! Stream gateway scenarios over a real socket.
//!
//! The router is served on an ephemeral 127.0.0.1 listener and driven with a
//! tokio-tungstenite client, so handshake behaviour and close codes are
//! observed exactly as a production client would see them. Submissions are
//! driven in-process via `oneshot` against the same shared state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use futures_util::StreamExt;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tower::ServiceExt; // oneshot
use uuid::Uuid;

use sovd_connector::{ScriptedConnector, SilentConnector, VehicleConnector};
use sovd_daemon::{auth::StaticTokenVerifier, config::DaemonConfig, routes, state::AppState};
use sovd_db::{CommandStore, MemoryStore, NewCommand};
use sovd_schemas::{
    CommandRow, CommandStatus, ConnectionStatus, Identity, UserRole, VehicleRow,
};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const ADMIN_TOKEN: &str = "admin-token";
const ALICE_TOKEN: &str = "alice-token";
const BOB_TOKEN: &str = "bob-token";

fn alice_id() -> Uuid {
    Uuid::from_u128(0xE1)
}

fn bob_id() -> Uuid {
    Uuid::from_u128(0xE2)
}

fn vehicle_id() -> Uuid {
    Uuid::from_u128(0x101)
}

async fn make_state(
    connector: Arc<dyn VehicleConnector>,
    config: DaemonConfig,
) -> (Arc<AppState>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_vehicle(VehicleRow {
            vehicle_id: vehicle_id(),
            vin: "WAUZZZ8R0DA000101".to_string(),
            make: "Audi".to_string(),
            model: "Q5".to_string(),
            year: 2022,
            connection_status: ConnectionStatus::Connected,
            last_seen_at: Some(chrono::Utc::now()),
            metadata: json!({}),
        })
        .await
        .unwrap();

    let verifier = StaticTokenVerifier::new()
        .with_token(
            ADMIN_TOKEN,
            Identity {
                user_id: Uuid::from_u128(0xA1),
                role: UserRole::Admin,
            },
        )
        .with_token(
            ALICE_TOKEN,
            Identity {
                user_id: alice_id(),
                role: UserRole::Engineer,
            },
        )
        .with_token(
            BOB_TOKEN,
            Identity {
                user_id: bob_id(),
                role: UserRole::Engineer,
            },
        );

    let state = AppState::new(
        Arc::clone(&store) as Arc<dyn CommandStore>,
        connector,
        Arc::new(verifier),
        config,
    );
    (Arc::new(state), store)
}

/// Serve the router on an ephemeral port; returns the bound address.
async fn spawn_server(state: Arc<AppState>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral listener");
    let addr = listener.local_addr().unwrap();
    let router = routes::build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve failed");
    });
    addr
}

async fn connect(addr: SocketAddr, command_id: impl std::fmt::Display, token: &str) -> WsClient {
    let url = format!("ws://{addr}/ws/responses/{command_id}?token={token}");
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("websocket handshake");
    ws
}

async fn next_message(ws: &mut WsClient) -> Message {
    tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended unexpectedly")
        .expect("websocket error")
}

/// Read frames until the next text event, skipping ping/pong noise.
async fn next_event(ws: &mut WsClient) -> Value {
    loop {
        match next_message(ws).await {
            Message::Text(text) => return serde_json::from_str(&text).expect("event is JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a text event, got {other:?}"),
        }
    }
}

async fn expect_close(ws: &mut WsClient, code: CloseCode) {
    loop {
        match next_message(ws).await {
            Message::Close(frame) => {
                let frame = frame.expect("close frame should carry a code");
                assert_eq!(frame.code, code, "close reason: {}", frame.reason);
                return;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected close, got {other:?}"),
        }
    }
}

/// Submit via the REST surface sharing this state; returns the command id.
async fn submit(state: &Arc<AppState>, token: &str) -> Uuid {
    let body = json!({
        "vehicle_id": vehicle_id(),
        "command_name": "ReadDTC",
        "command_params": {"ecuAddress": "0x10"},
    });
    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/commands")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = routes::build_router(Arc::clone(state))
        .oneshot(req)
        .await
        .unwrap();
    assert_eq!(resp.status(), axum::http::StatusCode::ACCEPTED);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    body["command_id"].as_str().unwrap().parse().unwrap()
}

async fn wait_for_responses(store: &MemoryStore, command_id: Uuid, at_least: usize) {
    for _ in 0..500 {
        if store.list_responses(command_id).await.unwrap().len() >= at_least {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("command {command_id} never reached {at_least} persisted responses");
}

async fn wait_until_terminal(store: &MemoryStore, command_id: Uuid) -> CommandRow {
    for _ in 0..500 {
        if let Ok(row) = store.get_command(command_id).await {
            if row.status.is_terminal() {
                return row;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("command {command_id} did not reach a terminal state in time");
}

/// Seed a command that is already completed with one final chunk, bypassing
/// the executor entirely.
async fn seed_completed_command(store: &MemoryStore, owner: Uuid) -> Uuid {
    let row = store
        .insert_command(NewCommand {
            user_id: owner,
            vehicle_id: vehicle_id(),
            command_name: "ClearDTC".to_string(),
            command_params: json!({"ecuAddress": "0x7E"}),
        })
        .await
        .unwrap();
    store
        .insert_response(row.command_id, json!({"status": "complete"}), 1, true)
        .await
        .unwrap();
    store
        .update_command_status(row.command_id, CommandStatus::InProgress, None, None)
        .await
        .unwrap();
    store
        .update_command_status(row.command_id, CommandStatus::Completed, None, None)
        .await
        .unwrap();
    row.command_id
}

fn scripted_chunks() -> Vec<Value> {
    vec![
        json!({"dtcCode": "P0420"}),
        json!({"dtcCode": "P0171"}),
        json!({"status": "complete"}),
    ]
}

// ---------------------------------------------------------------------------
// Handshake & authorization
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_or_invalid_token_closes_1008() {
    let (state, store) = make_state(
        Arc::new(ScriptedConnector::completing(scripted_chunks())),
        DaemonConfig::default(),
    )
    .await;
    let command_id = seed_completed_command(&store, alice_id()).await;
    let addr = spawn_server(Arc::clone(&state)).await;

    // Invalid token.
    let mut ws = connect(addr, command_id, "forged-token").await;
    expect_close(&mut ws, CloseCode::Policy).await;

    // Missing token entirely.
    let url = format!("ws://{addr}/ws/responses/{command_id}");
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    expect_close(&mut ws, CloseCode::Policy).await;
}

#[tokio::test]
async fn foreign_engineer_is_closed_1008_admin_and_owner_proceed() {
    let (state, store) = make_state(
        Arc::new(ScriptedConnector::completing(scripted_chunks())),
        DaemonConfig::default(),
    )
    .await;
    let command_id = seed_completed_command(&store, alice_id()).await;
    let addr = spawn_server(Arc::clone(&state)).await;

    // Bob owns nothing here: policy close.
    let mut ws = connect(addr, command_id, BOB_TOKEN).await;
    expect_close(&mut ws, CloseCode::Policy).await;

    // The owner replays history and gets a clean end of stream.
    let mut ws = connect(addr, command_id, ALICE_TOKEN).await;
    let ev = next_event(&mut ws).await;
    assert_eq!(ev["event"], "response");
    assert_eq!(ev["sequence_number"], 1);
    let status = next_event(&mut ws).await;
    assert_eq!(status["event"], "status");
    assert_eq!(status["status"], "completed");
    expect_close(&mut ws, CloseCode::Normal).await;

    // Admins may subscribe to anyone's stream.
    let mut ws = connect(addr, command_id, ADMIN_TOKEN).await;
    let ev = next_event(&mut ws).await;
    assert_eq!(ev["event"], "response");
    let status = next_event(&mut ws).await;
    assert_eq!(status["event"], "status");
    expect_close(&mut ws, CloseCode::Normal).await;
}

#[tokio::test]
async fn unknown_command_id_closes_1008() {
    let (state, _) = make_state(
        Arc::new(ScriptedConnector::completing(scripted_chunks())),
        DaemonConfig::default(),
    )
    .await;
    let addr = spawn_server(Arc::clone(&state)).await;

    let mut ws = connect(addr, Uuid::new_v4(), ADMIN_TOKEN).await;
    expect_close(&mut ws, CloseCode::Policy).await;

    let mut ws = connect(addr, "not-a-uuid", ADMIN_TOKEN).await;
    expect_close(&mut ws, CloseCode::Policy).await;
}

// ---------------------------------------------------------------------------
// Catch-up + live delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn catch_up_precedes_live_events_with_no_duplicates() {
    let connector = ScriptedConnector::completing(scripted_chunks()).paused_after(2);
    let gate = connector.release_handle();
    let (state, store) = make_state(Arc::new(connector), DaemonConfig::default()).await;
    let addr = spawn_server(Arc::clone(&state)).await;

    let command_id = submit(&state, ALICE_TOKEN).await;

    // Let the first two chunks land in the store while nobody is subscribed.
    wait_for_responses(&store, command_id, 2).await;

    let mut ws = connect(addr, command_id, ALICE_TOKEN).await;

    // Catch-up: persisted chunks arrive first, in ascending order.
    let ev1 = next_event(&mut ws).await;
    assert_eq!(ev1["event"], "response");
    assert_eq!(ev1["sequence_number"], 1);
    assert_eq!(ev1["response_payload"]["dtcCode"], "P0420");
    let ev2 = next_event(&mut ws).await;
    assert_eq!(ev2["sequence_number"], 2);
    assert_eq!(ev2["response_payload"]["dtcCode"], "P0171");

    // Release the connector: the final chunk arrives live.
    gate.notify_one();
    let ev3 = next_event(&mut ws).await;
    assert_eq!(ev3["event"], "response");
    assert_eq!(ev3["sequence_number"], 3);
    assert_eq!(ev3["is_final"], true);

    let status = next_event(&mut ws).await;
    assert_eq!(status["event"], "status");
    assert_eq!(status["status"], "completed");
    assert!(!status["completed_at"].is_null());

    expect_close(&mut ws, CloseCode::Normal).await;

    // No sequence number was delivered twice.
    let seqs = [ev1, ev2, ev3]
        .iter()
        .map(|e| e["sequence_number"].as_i64().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[tokio::test]
async fn subscription_after_completion_replays_the_full_stream() {
    let (state, store) = make_state(
        Arc::new(ScriptedConnector::completing(scripted_chunks())),
        DaemonConfig::default(),
    )
    .await;
    let addr = spawn_server(Arc::clone(&state)).await;

    let command_id = submit(&state, ALICE_TOKEN).await;
    wait_until_terminal(&store, command_id).await;

    let mut ws = connect(addr, command_id, ALICE_TOKEN).await;
    for expected_seq in 1..=3 {
        let ev = next_event(&mut ws).await;
        assert_eq!(ev["event"], "response");
        assert_eq!(ev["sequence_number"], expected_seq);
    }
    let status = next_event(&mut ws).await;
    assert_eq!(status["event"], "status");
    assert_eq!(status["status"], "completed");
    expect_close(&mut ws, CloseCode::Normal).await;
}

// ---------------------------------------------------------------------------
// Failure propagation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connector_timeout_reaches_subscribers_as_error_event() {
    let config = DaemonConfig {
        execute_timeout: Duration::from_millis(100),
        ..DaemonConfig::default()
    };
    let (state, store) = make_state(Arc::new(SilentConnector), config).await;
    let addr = spawn_server(Arc::clone(&state)).await;

    let command_id = submit(&state, ALICE_TOKEN).await;
    let row = wait_until_terminal(&store, command_id).await;
    assert_eq!(row.status, CommandStatus::Failed);
    assert!(
        row.error_message.as_deref().unwrap_or("").contains("timeout"),
        "error_message: {:?}",
        row.error_message
    );

    let mut ws = connect(addr, command_id, ALICE_TOKEN).await;
    let ev = next_event(&mut ws).await;
    assert_eq!(ev["event"], "error");
    assert!(ev["error_message"].as_str().unwrap().contains("timeout"));
    expect_close(&mut ws, CloseCode::Normal).await;
}

#[tokio::test]
async fn connector_reported_failure_preserves_partial_chunks() {
    let (state, store) = make_state(
        Arc::new(ScriptedConnector::failing(
            vec![json!({"dtcCode": "P0420"})],
            "ECU did not respond",
        )),
        DaemonConfig::default(),
    )
    .await;
    let addr = spawn_server(Arc::clone(&state)).await;

    let command_id = submit(&state, ALICE_TOKEN).await;
    let row = wait_until_terminal(&store, command_id).await;
    assert_eq!(row.status, CommandStatus::Failed);

    // The chunk delivered before the failure stays persisted and replays.
    let mut ws = connect(addr, command_id, ALICE_TOKEN).await;
    let ev = next_event(&mut ws).await;
    assert_eq!(ev["event"], "response");
    assert_eq!(ev["sequence_number"], 1);
    let err = next_event(&mut ws).await;
    assert_eq!(err["event"], "error");
    assert_eq!(err["error_message"], "ECU did not respond");
    expect_close(&mut ws, CloseCode::Normal).await;
}

// ---------------------------------------------------------------------------
// Disconnect semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn client_disconnect_does_not_cancel_execution() {
    let connector = ScriptedConnector::completing(scripted_chunks()).paused_after(1);
    let gate = connector.release_handle();
    let (state, store) = make_state(Arc::new(connector), DaemonConfig::default()).await;
    let addr = spawn_server(Arc::clone(&state)).await;

    let command_id = submit(&state, ALICE_TOKEN).await;
    wait_for_responses(&store, command_id, 1).await;

    // Subscribe, read one chunk, then walk away mid-stream.
    let mut ws = connect(addr, command_id, ALICE_TOKEN).await;
    let ev = next_event(&mut ws).await;
    assert_eq!(ev["sequence_number"], 1);
    drop(ws);

    // The execution keeps running to completion regardless.
    gate.notify_one();
    let row = wait_until_terminal(&store, command_id).await;
    assert_eq!(row.status, CommandStatus::Completed);

    // A later subscription replays everything.
    let mut ws = connect(addr, command_id, ALICE_TOKEN).await;
    for expected_seq in 1..=3 {
        let ev = next_event(&mut ws).await;
        assert_eq!(ev["sequence_number"], expected_seq);
    }
    let status = next_event(&mut ws).await;
    assert_eq!(status["event"], "status");
    expect_close(&mut ws, CloseCode::Normal).await;
}
