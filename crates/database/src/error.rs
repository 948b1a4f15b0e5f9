use portfolio::LedgerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection is not configured: {0}")]
    ConnectionConfigError(String),

    #[error("Failed to connect to the database: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Database migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("An error occurred during JSON serialization/deserialization: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Stored row is not valid: {0}")]
    InvalidRow(String),
}

impl From<DbError> for LedgerError {
    fn from(err: DbError) -> Self {
        LedgerError::Store(err.to_string())
    }
}
