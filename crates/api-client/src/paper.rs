use crate::error::ApiError;
use crate::ExchangeClient;
use async_trait::async_trait;
use core_types::{Candle, Market, OrderRequest, OrderResult, OrderSide};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// The "virtual exchange" for paper trading.
///
/// Market data is read from a real client while orders are filled locally at
/// the requested price, moved against us by a fixed slippage fraction.
pub struct PaperExchange {
    market_data: Arc<dyn ExchangeClient>,
    slippage_pct: Decimal,
    next_order_id: AtomicU64,
}

impl PaperExchange {
    pub fn new(market_data: Arc<dyn ExchangeClient>, slippage_pct: Decimal) -> Self {
        Self {
            market_data,
            slippage_pct,
            next_order_id: AtomicU64::new(1),
        }
    }

    fn fill_price(&self, side: OrderSide, price: Decimal) -> Decimal {
        let slippage = price * self.slippage_pct;
        match side {
            // For a buy, slippage makes the price HIGHER (worse).
            OrderSide::Buy => price + slippage,
            // For a sell, slippage makes the price LOWER (worse).
            OrderSide::Sell => price - slippage,
        }
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn fetch_candles(
        &self,
        market: &Market,
        interval: &str,
        count: usize,
    ) -> Result<Vec<Candle>, ApiError> {
        self.market_data.fetch_candles(market, interval, count).await
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderResult, ApiError> {
        if request.quantity <= Decimal::ZERO || request.price <= Decimal::ZERO {
            return Err(ApiError::Rejected {
                code: -1013,
                message: format!(
                    "invalid quantity {} or price {}",
                    request.quantity, request.price
                ),
            });
        }

        let id = self.next_order_id.fetch_add(1, Ordering::Relaxed);
        let filled_price = self.fill_price(request.side, request.price);
        tracing::debug!(
            market = %request.market,
            side = %request.side,
            quantity = %request.quantity,
            price = %filled_price,
            "Paper fill"
        );

        Ok(OrderResult {
            exchange_order_id: format!("paper-{}", id),
            filled_price,
            filled_quantity: request.quantity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    struct NoData;

    #[async_trait]
    impl ExchangeClient for NoData {
        async fn fetch_candles(&self, _: &Market, _: &str, _: usize) -> Result<Vec<Candle>, ApiError> {
            Ok(Vec::new())
        }

        async fn submit_order(&self, _: &OrderRequest) -> Result<OrderResult, ApiError> {
            unreachable!("paper exchange never forwards orders")
        }
    }

    fn request(side: OrderSide, quantity: Decimal) -> OrderRequest {
        OrderRequest {
            client_order_id: Uuid::new_v4(),
            market: "binance:BTCUSDT".parse().unwrap(),
            side,
            price: dec!(100),
            quantity,
        }
    }

    #[tokio::test]
    async fn fills_with_adverse_slippage() {
        let exchange = PaperExchange::new(Arc::new(NoData), dec!(0.01));

        let buy = exchange.submit_order(&request(OrderSide::Buy, dec!(2))).await.unwrap();
        assert_eq!(buy.filled_price, dec!(101));
        assert_eq!(buy.filled_quantity, dec!(2));

        let sell = exchange.submit_order(&request(OrderSide::Sell, dec!(2))).await.unwrap();
        assert_eq!(sell.filled_price, dec!(99));
        assert_ne!(buy.exchange_order_id, sell.exchange_order_id);
    }

    #[tokio::test]
    async fn rejects_empty_orders() {
        let exchange = PaperExchange::new(Arc::new(NoData), dec!(0));
        let err = exchange.submit_order(&request(OrderSide::Buy, dec!(0))).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
