//! Axum router and the REST handlers for sovd-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! the outer middleware stack (CORS, request tracing). All handlers are
//! `pub(crate)` so the scenario tests in `tests/` can compose the router
//! directly against the in-memory store.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use sovd_db::{CommandFilter, NewAuditEvent, NewCommand, StoreError};
use sovd_schemas::{CommandRow, CommandStatus, ConnectionStatus, Identity};

use crate::{
    api_types::{
        CommandResponsesBody, HealthResponse, ListCommandsResponse, SubmitCommandResponse,
    },
    auth::Caller,
    error::{self, ApiError, RequestContext},
    executor, ratelimit,
    state::AppState,
    ws,
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Outer middleware (CORS, HTTP tracing) is **not** applied here; `main.rs`
/// attaches it after this call so tests can use the bare router. The
/// correlation-id and rate-limit layers are part of the surface contract and
/// are always present.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/commands", post(submit_command).get(list_commands))
        .route("/api/v1/commands/:command_id", get(get_command))
        .route(
            "/api/v1/commands/:command_id/responses",
            get(list_command_responses),
        )
        .route("/ws/responses/:command_id", get(ws::ws_responses))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            ratelimit::enforce,
        ))
        .layer(middleware::from_fn(error::request_context))
        .with_state(state)
}

/// Reads retry once on a transient store failure before surfacing SYS_001.
/// Writes never retry; submission is not idempotent.
async fn retry_once<T, F, Fut>(op: F) -> Result<T, StoreError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    match op().await {
        Err(StoreError::Unavailable(msg)) => {
            warn!(%msg, "store read failed; retrying once");
            op().await
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// GET /api/v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /api/v1/commands
// ---------------------------------------------------------------------------

/// Submission pipeline, in contract order: vehicle lookup, validation,
/// connectivity policy, insert, dispatch. The 202 is produced before the
/// executor can emit its first chunk — clients subscribe to `stream_url`
/// after reading `command_id`.
pub(crate) async fn submit_command(
    State(st): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Caller(identity): Caller,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let vehicle_id = required_uuid(&ctx, &body, "vehicle_id")?;
    let command_name = required_string(&ctx, &body, "command_name")?;
    let command_params = body.get("command_params").cloned().unwrap_or(json!({}));

    let vehicle = retry_once(|| st.store.get_vehicle(vehicle_id))
        .await
        .map_err(|err| match err {
            StoreError::NotFound(_) => ApiError::vehicle_not_found(&ctx),
            other => ApiError::from_store(&ctx, other),
        })?;

    sovd_validator::validate(&command_name, &command_params)
        .map_err(|err| ApiError::validation(&ctx, err))?;

    if vehicle.connection_status != ConnectionStatus::Connected {
        return Err(ApiError::vehicle_not_connected(&ctx));
    }

    let row = st
        .store
        .insert_command(NewCommand {
            user_id: identity.user_id,
            vehicle_id,
            command_name: command_name.clone(),
            command_params,
        })
        .await
        .map_err(|err| ApiError::from_store(&ctx, err))?;

    st.store
        .log_audit(NewAuditEvent {
            actor_user_id: Some(identity.user_id),
            entity_type: "command".to_string(),
            entity_id: Some(row.command_id),
            action: "command.submitted".to_string(),
            details: json!({
                "commandName": command_name,
                "vehicleId": vehicle_id,
            }),
        })
        .await;

    info!(command_id = %row.command_id, command_name = %command_name, "command accepted");
    executor::spawn_execution(Arc::clone(&st), row.clone());

    let stream_url = format!(
        "{}/ws/responses/{}",
        st.config.public_ws_base, row.command_id
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitCommandResponse {
            command_id: row.command_id,
            status: row.status,
            submitted_at: row.submitted_at,
            stream_url,
        }),
    ))
}

fn required_string(
    ctx: &RequestContext,
    body: &Value,
    field: &str,
) -> Result<String, ApiError> {
    match body.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(_) => Err(ApiError::bad_request(
            ctx,
            format!("field {field} must be a non-empty string"),
        )),
        None => Err(ApiError::missing_field(ctx, field)),
    }
}

fn required_uuid(ctx: &RequestContext, body: &Value, field: &str) -> Result<Uuid, ApiError> {
    required_string(ctx, body, field)?
        .parse()
        .map_err(|_| ApiError::bad_request(ctx, format!("field {field} must be a UUID")))
}

// ---------------------------------------------------------------------------
// GET /api/v1/commands
// ---------------------------------------------------------------------------

pub(crate) async fn list_commands(
    State(st): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Caller(identity): Caller,
    Query(raw): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = parse_filter(&ctx, &raw, identity)?;
    let (limit, offset) = filter.window();

    let commands = retry_once(|| st.store.list_commands(&filter))
        .await
        .map_err(|err| ApiError::from_store(&ctx, err))?;

    Ok((
        StatusCode::OK,
        Json(ListCommandsResponse {
            count: commands.len(),
            commands,
            limit,
            offset,
        }),
    ))
}

/// Strict filter grammar: unknown keys and malformed values are a 400. The
/// `user_id` filter is admin-only; for engineers the owner filter is forced
/// to the caller so history stays scoped to their own commands.
fn parse_filter(
    ctx: &RequestContext,
    raw: &HashMap<String, String>,
    identity: Identity,
) -> Result<CommandFilter, ApiError> {
    let mut filter = CommandFilter::default();
    let mut requested_user: Option<Uuid> = None;

    for (key, value) in raw {
        match key.as_str() {
            "vehicle_id" => {
                filter.vehicle_id = Some(parse_uuid(ctx, key, value)?);
            }
            "status" => {
                filter.status = Some(CommandStatus::parse(value).ok_or_else(|| {
                    ApiError::bad_request(ctx, format!("unknown status filter: {value}"))
                })?);
            }
            "user_id" => {
                requested_user = Some(parse_uuid(ctx, key, value)?);
            }
            "start_date" => {
                filter.submitted_after = Some(parse_date(ctx, key, value)?);
            }
            "end_date" => {
                filter.submitted_before = Some(parse_date(ctx, key, value)?);
            }
            "limit" => {
                let limit: i64 = value.parse().map_err(|_| {
                    ApiError::bad_request(ctx, "limit must be an integer")
                })?;
                if !(1..=CommandFilter::MAX_LIMIT).contains(&limit) {
                    return Err(ApiError::bad_request(
                        ctx,
                        format!("limit must be between 1 and {}", CommandFilter::MAX_LIMIT),
                    ));
                }
                filter.limit = Some(limit);
            }
            "offset" => {
                let offset: i64 = value.parse().map_err(|_| {
                    ApiError::bad_request(ctx, "offset must be an integer")
                })?;
                if offset < 0 {
                    return Err(ApiError::bad_request(ctx, "offset must be >= 0"));
                }
                filter.offset = Some(offset);
            }
            unknown => {
                return Err(ApiError::bad_request(
                    ctx,
                    format!("unknown filter key: {unknown}"),
                ));
            }
        }
    }

    filter.user_id = if identity.role.is_admin() {
        requested_user
    } else {
        // Engineers always see only their own history.
        Some(identity.user_id)
    };

    Ok(filter)
}

fn parse_uuid(ctx: &RequestContext, key: &str, value: &str) -> Result<Uuid, ApiError> {
    value
        .parse()
        .map_err(|_| ApiError::bad_request(ctx, format!("{key} must be a UUID")))
}

fn parse_date(
    ctx: &RequestContext,
    key: &str,
    value: &str,
) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ApiError::bad_request(ctx, format!("{key} must be an RFC 3339 timestamp")))
}

// ---------------------------------------------------------------------------
// GET /api/v1/commands/{id}
// ---------------------------------------------------------------------------

/// Fetch the command row, enforcing owner-or-admin access. 404s for an
/// unparseable id as well, so unauthorized probing and absent rows look the
/// same to engineers.
async fn load_authorized_command(
    st: &AppState,
    ctx: &RequestContext,
    identity: Identity,
    command_id: &str,
) -> Result<CommandRow, ApiError> {
    let command_id: Uuid = command_id
        .parse()
        .map_err(|_| ApiError::command_not_found(ctx))?;

    let row = retry_once(|| st.store.get_command(command_id))
        .await
        .map_err(|err| ApiError::from_store(ctx, err))?;

    if !identity.may_access(row.user_id) {
        return Err(ApiError::forbidden(ctx));
    }
    Ok(row)
}

pub(crate) async fn get_command(
    State(st): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Caller(identity): Caller,
    Path(command_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let row = load_authorized_command(&st, &ctx, identity, &command_id).await?;
    Ok((StatusCode::OK, Json(row)))
}

// ---------------------------------------------------------------------------
// GET /api/v1/commands/{id}/responses
// ---------------------------------------------------------------------------

pub(crate) async fn list_command_responses(
    State(st): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Caller(identity): Caller,
    Path(command_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let row = load_authorized_command(&st, &ctx, identity, &command_id).await?;

    let responses = retry_once(|| st.store.list_responses(row.command_id))
        .await
        .map_err(|err| ApiError::from_store(&ctx, err))?;

    Ok((
        StatusCode::OK,
        Json(CommandResponsesBody {
            command_id: row.command_id,
            count: responses.len(),
            responses,
        }),
    ))
}
