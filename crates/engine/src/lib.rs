//! The concurrent core of the trading bot.
//!
//! A [`WorkerPool`] runs one [`MarketWorker`](worker::MarketWorker) per market. All
//! workers share:
//!
//! - a [`RateGate`] that admits exchange calls under a rolling-window budget and retries
//!   transient failures,
//! - the [`OperationLocks`] (`candle_data`, `buy`, `sell`) that serialize the critical
//!   operations across markets,
//! - the [`PortfolioLedger`], which only accepts mutations from holders of a lock token.
//!
//! Stopping the pool fires a single [`Shutdown`] signal that every wait in the gate, the
//! locks and the worker loops observes.

pub mod error;
pub mod gate;
pub mod ledger;
pub mod locks;
pub mod pool;
pub mod shutdown;
pub mod worker;

pub use error::EngineError;
pub use gate::{CallCategory, GateError, RateBudget, RateGate, RatePermit, RetryPolicy};
pub use ledger::PortfolioLedger;
pub use locks::{LockCategory, LockError, LockMiss, LockStats, LockToken, OperationLocks};
pub use pool::{PoolSettings, WorkerPool};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use worker::{OrderOutcome, WorkerState, WorkerStatus};
