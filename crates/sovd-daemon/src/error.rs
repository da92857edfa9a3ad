//! REST error envelope and per-request context.
//!
//! Every 4xx/5xx body has the shape
//! `{"error":{"code","message","correlation_id","timestamp","path"}}`.
//! The correlation id is minted by the [`request_context`] middleware,
//! attached to request extensions and echoed as the `x-correlation-id`
//! response header. Stack traces and sensitive values never reach the body.

use axum::{
    extract::Request,
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use sovd_db::{EntityKind, StoreError};
use sovd_validator::{ValidationError, ValidationErrorKind};

// ---------------------------------------------------------------------------
// RequestContext
// ---------------------------------------------------------------------------

/// Per-request metadata handlers need to build error envelopes.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: Uuid,
    pub path: String,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            path: String::new(),
        }
    }
}

/// Outermost middleware: mint a correlation id, expose it to handlers via
/// extensions, echo it on the response.
pub async fn request_context(mut req: Request, next: Next) -> Response {
    let ctx = RequestContext {
        correlation_id: Uuid::new_v4(),
        path: req.uri().path().to_string(),
    };
    let correlation_id = ctx.correlation_id;
    req.extensions_mut().insert(ctx);

    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
        resp.headers_mut().insert("x-correlation-id", value);
    }
    resp
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

pub mod codes {
    pub const VEHICLE_NOT_FOUND: &str = "VAL_001";
    pub const INVALID_COMMAND: &str = "VAL_002";
    pub const MISSING_FIELD: &str = "VAL_003";
    pub const BAD_FORMAT: &str = "VAL_004";
    pub const COMMAND_NOT_FOUND: &str = "VAL_005";
    pub const VEHICLE_NOT_CONNECTED: &str = "VEH_001";
    pub const VEHICLE_TIMEOUT: &str = "VEH_002";
    pub const RATE_LIMITED: &str = "RATE_001";
    pub const UNAUTHENTICATED: &str = "AUTH_001";
    pub const FORBIDDEN: &str = "AUTH_002";
    pub const STORAGE_UNAVAILABLE: &str = "SYS_001";
    pub const BROKER_UNAVAILABLE: &str = "SYS_002";
}

// ---------------------------------------------------------------------------
// ApiError
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    correlation_id: Uuid,
    timestamp: String,
    path: String,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    correlation_id: Uuid,
    path: String,
}

impl ApiError {
    pub fn new(
        ctx: &RequestContext,
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            correlation_id: ctx.correlation_id,
            path: ctx.path.clone(),
        }
    }

    pub fn vehicle_not_found(ctx: &RequestContext) -> Self {
        Self::new(
            ctx,
            StatusCode::NOT_FOUND,
            codes::VEHICLE_NOT_FOUND,
            "vehicle not found",
        )
    }

    pub fn command_not_found(ctx: &RequestContext) -> Self {
        Self::new(
            ctx,
            StatusCode::NOT_FOUND,
            codes::COMMAND_NOT_FOUND,
            "command not found",
        )
    }

    pub fn vehicle_not_connected(ctx: &RequestContext) -> Self {
        Self::new(
            ctx,
            StatusCode::CONFLICT,
            codes::VEHICLE_NOT_CONNECTED,
            "vehicle is not reachable",
        )
    }

    pub fn validation(ctx: &RequestContext, err: ValidationError) -> Self {
        let code = match err.kind {
            ValidationErrorKind::UnknownCommand => codes::INVALID_COMMAND,
            ValidationErrorKind::MissingField => codes::MISSING_FIELD,
            ValidationErrorKind::BadFormat => codes::BAD_FORMAT,
        };
        Self::new(ctx, StatusCode::BAD_REQUEST, code, err.to_string())
    }

    pub fn missing_field(ctx: &RequestContext, field: &str) -> Self {
        Self::new(
            ctx,
            StatusCode::BAD_REQUEST,
            codes::MISSING_FIELD,
            format!("required field {field} is missing"),
        )
    }

    pub fn bad_request(ctx: &RequestContext, message: impl Into<String>) -> Self {
        Self::new(ctx, StatusCode::BAD_REQUEST, codes::BAD_FORMAT, message)
    }

    pub fn unauthenticated(ctx: &RequestContext) -> Self {
        Self::new(
            ctx,
            StatusCode::UNAUTHORIZED,
            codes::UNAUTHENTICATED,
            "missing or invalid credentials",
        )
    }

    pub fn forbidden(ctx: &RequestContext) -> Self {
        Self::new(
            ctx,
            StatusCode::FORBIDDEN,
            codes::FORBIDDEN,
            "not the owner of this resource",
        )
    }

    /// Map a store failure onto the REST taxonomy.
    pub fn from_store(ctx: &RequestContext, err: StoreError) -> Self {
        match err {
            StoreError::NotFound(EntityKind::Vehicle) => Self::vehicle_not_found(ctx),
            StoreError::NotFound(EntityKind::Command) => Self::command_not_found(ctx),
            StoreError::NotFound(EntityKind::User) => Self::unauthenticated(ctx),
            StoreError::Unavailable(_) => Self::new(
                ctx,
                StatusCode::SERVICE_UNAVAILABLE,
                codes::STORAGE_UNAVAILABLE,
                "storage temporarily unavailable",
            ),
            // Invariant violations surfaced through REST collapse to SYS_001.
            StoreError::SequenceConflict { .. } | StoreError::IllegalTransition { .. } => {
                Self::new(
                    ctx,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    codes::STORAGE_UNAVAILABLE,
                    "internal state error",
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: self.code,
                message: self.message,
                correlation_id: self.correlation_id,
                timestamp: Utc::now().to_rfc3339(),
                path: self.path,
            },
        };
        (self.status, Json(envelope)).into_response()
    }
}
