use crate::error::DbError;
use configuration::DatabaseConfig;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// Establishes a connection pool to the PostgreSQL database.
///
/// The URL comes from `[database] url` (or `APP__DATABASE__URL`). This pool can be
/// shared across the entire application for concurrent database access.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, DbError> {
    let database_url = config
        .url
        .as_deref()
        .ok_or_else(|| DbError::ConnectionConfigError("database.url must be set.".to_string()))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Applies the embedded migrations so the schema is up-to-date before workers start.
pub async fn run_migrations(pool: &PgPool) -> Result<(), DbError> {
    // Use a relative path from the crate root
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
