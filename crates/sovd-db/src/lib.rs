//! Persistence gateway: durable CRUD over users, vehicles, commands,
//! responses and audit events, reached by every other component only through
//! the [`CommandStore`] trait.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub mod mem;
pub mod pg;
pub mod store;

pub use mem::MemoryStore;
pub use pg::PgStore;
pub use store::{
    page_in_history_order, CommandFilter, CommandStore, EntityKind, NewAuditEvent, NewCommand,
    StoreError,
};

pub const ENV_DB_URL: &str = "SOVD_DATABASE_URL";

/// Connect to Postgres using SOVD_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Test helper used by integration tests:
/// - Connect using SOVD_DATABASE_URL
/// - Ensure migrations are applied
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}
