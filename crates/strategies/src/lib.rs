//! # Strategy Library
//!
//! Turns a candle series into a `TradeSignal` whose strength in `[0, 1]` the market
//! workers compare against their buy and sell thresholds.
//!
//! ## Architectural Principles
//!
//! - **Pure Logic:** This crate has no knowledge of exchanges, locks or persistence.
//!   It depends only on `core-types` and `configuration`.
//! - **Stateless Providers:** A `SignalProvider` recomputes its indicators from the full
//!   series on every call, so one instance can be shared by every worker.
//!
//! ## Public API
//!
//! - `SignalProvider`: The core trait all signal sources implement.
//! - `RsiTrend`: The default RSI and moving-average trend blend.

pub mod error;
pub mod rsi_trend;

pub use error::StrategyError;
pub use rsi_trend::RsiTrend;

use core_types::{Candle, Market, TradeSignal};

/// The core trait that all signal sources must implement.
///
/// The `Send + Sync` bounds are required because one provider is shared by
/// every market worker task.
pub trait SignalProvider: Send + Sync {
    /// Evaluates a candle series, oldest first, for one market.
    ///
    /// # Returns
    ///
    /// * `Ok(TradeSignal)` - with a strength in `[0, 1]`; higher means a stronger buy.
    /// * `Err(StrategyError)` - if the series is too short or an indicator fails.
    fn signal(&self, market: &Market, candles: &[Candle]) -> Result<TradeSignal, StrategyError>;
}
