use rust_decimal::Decimal;
use serde::Deserialize;

// Using `#[serde(rename_all = "camelCase")]` to automatically map from JSON camelCase to Rust snake_case.

/// The response from a successful `POST /api/v3/order` request (`newOrderRespType=FULL`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub symbol: String,
    pub order_id: i64,
    pub client_order_id: String,
    pub executed_qty: Decimal,
    /// Total quote spent or received; the spelling is Binance's.
    pub cummulative_quote_qty: Decimal,
    pub status: String,
    #[serde(default)]
    pub fills: Vec<FillResponse>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FillResponse {
    pub price: Decimal,
    pub qty: Decimal,
}

/// Represents an error response from the Binance API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    pub code: i64,
    pub msg: String,
}
