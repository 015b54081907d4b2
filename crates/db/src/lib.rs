//! Relational persistence for sessions, identities and notifications.
//!
//! Repositories are zero-sized structs whose async methods take `&PgPool`.
//! [`directory::PgSessionDirectory`] adapts them to the
//! [`SessionDirectory`](ussdhub_core::directory::SessionDirectory) seam used
//! by the realtime session store.

use sqlx::postgres::PgPoolOptions;

pub mod directory;
pub mod models;
pub mod repositories;

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Run a trivial query to verify the pool can reach the database.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply all pending migrations from `crates/db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
