//! sovd-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, connects the store,
//! builds the shared state, wires middleware, and starts the HTTP server.
//! Route handlers live in `routes.rs`; the stream gateway in `ws.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use sovd_daemon::{
    auth::HmacTokenVerifier,
    config::{self, DaemonConfig},
    ratelimit::FixedWindowLimiter,
    routes,
    state::AppState,
};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let config = DaemonConfig::from_env();

    let pool = sovd_db::connect_from_env().await?;
    sovd_db::migrate(&pool).await?;
    let store = Arc::new(sovd_db::PgStore::new(pool));

    let secret = std::env::var(config::ENV_TOKEN_SECRET)
        .with_context(|| format!("missing env var {}", config::ENV_TOKEN_SECRET))?;
    let verifier = Arc::new(HmacTokenVerifier::new(secret));

    let connector = Arc::new(sovd_connector::MockConnector::new());

    // 120 requests/min per engineer; admins are exempt in the middleware.
    let limiter = Arc::new(FixedWindowLimiter::new(120, Duration::from_secs(60)));

    let shared = Arc::new(
        AppState::new(store, connector, verifier, config).with_limiter(limiter),
    );

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr =
        config::bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8899)));
    info!("sovd-daemon listening on http://{}", addr);

    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// CORS: allow only localhost origins (the operations UI is served locally).
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
