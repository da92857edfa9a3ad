//! Vehicle connector boundary: the asynchronous driver that executes one
//! diagnostic command against a target and streams response chunks back.
//!
//! # Contract
//!
//! A connector invokes the sink once per chunk with sequence numbers that
//! start at 1 and strictly increase; exactly one invocation carries
//! `is_final = true` and it is the last one. The wall-clock budget is owned
//! by [`execute_with_deadline`]; on expiry the connector future is dropped
//! and the outcome is `Failed` with a timeout reason. Chunks the sink has
//! already accepted stay accepted.
//!
//! Connector substitution is a supported extension point: the orchestrator
//! holds a `dyn VehicleConnector` and never assumes the mock.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;
use uuid::Uuid;

/// Default hard budget for one command execution.
pub const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Everything a connector needs to know about the command it executes.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub command_id: Uuid,
    pub vehicle_id: Uuid,
    pub command_name: String,
    pub command_params: Value,
}

/// One streamed unit of result.
#[derive(Debug, Clone)]
pub struct ResponseChunk {
    pub payload: Value,
    /// Starts at 1, strictly increasing per command.
    pub sequence_number: i32,
    pub is_final: bool,
}

/// Why a connector run failed. Rendered through `Display` into the command's
/// `error_message` and the stream `error` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// The wall-clock budget elapsed before a terminal chunk.
    Timeout { budget_secs: u64 },
    /// The sink refused a chunk (storage conflict or outage).
    SinkRejected { detail: String },
    /// The connector itself reported a failure against the vehicle.
    Execution { reason: String },
}

impl std::fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectorError::Timeout { budget_secs } => write!(
                f,
                "connector timeout after {budget_secs}s with no terminal chunk"
            ),
            ConnectorError::SinkRejected { detail } => {
                write!(f, "response sink rejected chunk: {detail}")
            }
            ConnectorError::Execution { reason } => write!(f, "{reason}"),
        }
    }
}

impl std::error::Error for ConnectorError {}

/// Terminal verdict of a connector run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorOutcome {
    Completed,
    Failed(ConnectorError),
}

impl ConnectorOutcome {
    /// Connector-reported failure with a human-readable reason.
    pub fn failed(reason: impl Into<String>) -> Self {
        ConnectorOutcome::Failed(ConnectorError::Execution {
            reason: reason.into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Receives chunks as the connector produces them. The orchestrator's sink
/// persists each chunk and fans it out; a sink error aborts the run.
#[async_trait]
pub trait ResponseSink: Send {
    async fn deliver(&mut self, chunk: ResponseChunk) -> anyhow::Result<()>;
}

/// Asynchronous driver executing one command against one target.
#[async_trait]
pub trait VehicleConnector: Send + Sync {
    async fn execute(
        &self,
        req: &ExecuteRequest,
        sink: &mut dyn ResponseSink,
    ) -> ConnectorOutcome;
}

/// Drive a connector under the hard wall-clock budget. On expiry the
/// in-flight future is dropped (no further sink invocations are possible)
/// and the run is reported failed with a reason containing `timeout`.
pub async fn execute_with_deadline(
    connector: &dyn VehicleConnector,
    req: &ExecuteRequest,
    sink: &mut dyn ResponseSink,
    budget: Duration,
) -> ConnectorOutcome {
    match tokio::time::timeout(budget, connector.execute(req, sink)).await {
        Ok(outcome) => outcome,
        Err(_elapsed) => {
            warn!(command_id = %req.command_id, budget_secs = budget.as_secs(), "connector timeout");
            ConnectorOutcome::Failed(ConnectorError::Timeout {
                budget_secs: budget.as_secs(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// MockConnector — deterministic reference implementation
// ---------------------------------------------------------------------------

/// Deterministic mock keyed on `command_name`. `ReadDTC` exercises the
/// multi-chunk model (two DTC records, then a final summary); the other
/// commands emit a single final chunk. No randomness; payloads derive only
/// from the request.
#[derive(Debug, Clone)]
pub struct MockConnector {
    /// Suspension between chunks, so subscribers observe real streaming.
    chunk_delay: Duration,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self {
            chunk_delay: Duration::from_millis(25),
        }
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_delay(chunk_delay: Duration) -> Self {
        Self { chunk_delay }
    }

    fn script(req: &ExecuteRequest) -> Vec<Value> {
        let ecu = req
            .command_params
            .get("ecuAddress")
            .cloned()
            .unwrap_or(Value::Null);

        match req.command_name.as_str() {
            "ReadDTC" => vec![
                json!({"ecuAddress": ecu, "dtcCode": "P0420", "description": "Catalyst system efficiency below threshold", "state": "confirmed"}),
                json!({"ecuAddress": ecu, "dtcCode": "P0171", "description": "System too lean (bank 1)", "state": "pending"}),
                json!({"ecuAddress": ecu, "status": "complete", "dtcCount": 2}),
            ],
            "ClearDTC" => {
                let scope = req
                    .command_params
                    .get("dtcCode")
                    .cloned()
                    .unwrap_or_else(|| Value::String("all".to_string()));
                vec![json!({"ecuAddress": ecu, "status": "complete", "cleared": scope})]
            }
            "ReadDataByID" => {
                let data_id = req
                    .command_params
                    .get("dataId")
                    .cloned()
                    .unwrap_or(Value::Null);
                vec![json!({"ecuAddress": ecu, "dataId": data_id, "value": "0x3A98", "unit": "raw", "status": "complete"})]
            }
            other => vec![json!({"status": "unsupported", "commandName": other})],
        }
    }
}

#[async_trait]
impl VehicleConnector for MockConnector {
    async fn execute(
        &self,
        req: &ExecuteRequest,
        sink: &mut dyn ResponseSink,
    ) -> ConnectorOutcome {
        let script = Self::script(req);
        let last = script.len();

        for (idx, payload) in script.into_iter().enumerate() {
            if idx > 0 && !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            let chunk = ResponseChunk {
                payload,
                sequence_number: (idx + 1) as i32,
                is_final: idx + 1 == last,
            };
            if let Err(err) = sink.deliver(chunk).await {
                return ConnectorOutcome::Failed(ConnectorError::SinkRejected {
                    detail: err.to_string(),
                });
            }
        }

        ConnectorOutcome::Completed
    }
}

// ---------------------------------------------------------------------------
// Scenario connectors
// ---------------------------------------------------------------------------

/// Emits a caller-provided chunk script; the last chunk is marked final
/// unless the run is scripted to fail. `pause_after` stalls the stream until
/// [`ScriptedConnector::release`] fires, which lets scenario tests pin down
/// catch-up behaviour deterministically.
pub struct ScriptedConnector {
    chunks: Vec<Value>,
    fail_reason: Option<String>,
    pause_after: Option<usize>,
    gate: Arc<Notify>,
}

impl ScriptedConnector {
    pub fn completing(chunks: Vec<Value>) -> Self {
        Self {
            chunks,
            fail_reason: None,
            pause_after: None,
            gate: Arc::new(Notify::new()),
        }
    }

    /// Emits the given chunks (none marked final), then reports failure.
    pub fn failing(chunks: Vec<Value>, reason: impl Into<String>) -> Self {
        Self {
            chunks,
            fail_reason: Some(reason.into()),
            pause_after: None,
            gate: Arc::new(Notify::new()),
        }
    }

    /// Stall after the first `n` chunks until `release` is called.
    pub fn paused_after(mut self, n: usize) -> Self {
        self.pause_after = Some(n);
        self
    }

    /// Handle for the test side of the gate.
    pub fn release_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.gate)
    }
}

#[async_trait]
impl VehicleConnector for ScriptedConnector {
    async fn execute(
        &self,
        _req: &ExecuteRequest,
        sink: &mut dyn ResponseSink,
    ) -> ConnectorOutcome {
        let last = self.chunks.len();

        for (idx, payload) in self.chunks.iter().cloned().enumerate() {
            if self.pause_after == Some(idx) {
                self.gate.notified().await;
            }
            let chunk = ResponseChunk {
                payload,
                sequence_number: (idx + 1) as i32,
                is_final: self.fail_reason.is_none() && idx + 1 == last,
            };
            if let Err(err) = sink.deliver(chunk).await {
                return ConnectorOutcome::Failed(ConnectorError::SinkRejected {
                    detail: err.to_string(),
                });
            }
        }

        match &self.fail_reason {
            Some(reason) => ConnectorOutcome::failed(reason.clone()),
            None => ConnectorOutcome::Completed,
        }
    }
}

/// Never emits and never returns; exists to exercise the timeout path.
pub struct SilentConnector;

#[async_trait]
impl VehicleConnector for SilentConnector {
    async fn execute(
        &self,
        _req: &ExecuteRequest,
        _sink: &mut dyn ResponseSink,
    ) -> ConnectorOutcome {
        std::future::pending::<()>().await;
        unreachable!("pending future never resolves")
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
