use crate::error::ApiError;
use async_trait::async_trait;
use core_types::{Candle, Market, OrderRequest, OrderResult};

mod auth;
pub mod binance;
pub mod error;
pub mod paper;
pub mod responses;

// --- Public API ---
pub use binance::BinanceClient;
pub use paper::PaperExchange;

/// The generic, abstract interface for a trading exchange API client.
///
/// Every call goes through the engine's rate gate, which relies on
/// `ApiError::is_retryable` to decide whether a failure is worth another attempt.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Fetches the most recent `count` candles for a market, oldest first.
    async fn fetch_candles(
        &self,
        market: &Market,
        interval: &str,
        count: usize,
    ) -> Result<Vec<Candle>, ApiError>;

    /// Places a market order. (Authenticated)
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderResult, ApiError>;
}
