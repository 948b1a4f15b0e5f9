//! # Portfolio Crate
//!
//! Holdings arithmetic and trade persistence for the market workers.
//!
//! ## Architectural Principles
//!
//! - **State vs. Access Decoupling:** `Holdings` is a plain state machine that applies
//!   filled orders to per-market positions. It knows nothing about locking; the engine's
//!   ledger wraps it and decides who may call it.
//! - **Storage Abstraction:** The `TradeStore` trait lets the ledger persist entries and
//!   trade records without knowing whether they go to memory or PostgreSQL.
//!
//! ## Public API
//!
//! - `Holdings`: per-market quantity, average buy price and daily realized profit.
//! - `TradeStore`: the persistence seam, with `InMemoryTradeStore` as the default.
//! - `LedgerError`: the specific error types that can be returned from this crate.

pub mod error;
pub mod holdings;
pub mod store;

pub use error::LedgerError;
pub use holdings::{DailyProfit, Fill, Holdings};
pub use store::{InMemoryTradeStore, TradeStore};
