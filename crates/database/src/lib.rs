//! # Database Crate
//!
//! PostgreSQL persistence for portfolio entries and the trade audit trail.
//!
//! ## Public API
//!
//! - `connect`: The async function to establish the database connection pool.
//! - `run_migrations`: A utility to apply database migrations, ensuring the schema is up-to-date.
//! - `PgTradeStore`: The `portfolio::TradeStore` implementation backed by the pool.
//! - `DbError`: The specific error types that can be returned from this crate.

// Declare the modules that constitute this crate.
pub mod connection;
pub mod error;
pub mod store;

// Re-export the key components to create a clean, public-facing API.
pub use connection::{connect, run_migrations};
pub use error::DbError;
pub use store::PgTradeStore;
