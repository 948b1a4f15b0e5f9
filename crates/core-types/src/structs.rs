use crate::enums::{FailureKind, OrderSide, OrderStatus};
use crate::error::CoreError;
use crate::market::Market;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A single OHLCV bar for a market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: DateTime<Utc>,
    pub interval: String,
}

/// The output of a signal provider for one market at one point in time.
///
/// `strength` is a normalized score: values near 1 favour buying, values near 0
/// favour selling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub market: Market,
    pub strength: f64,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    /// Raw indicator values that produced the signal, kept for logging and alerts.
    pub strategy_data: BTreeMap<String, f64>,
}

impl TradeSignal {
    pub fn new(
        market: Market,
        strength: f64,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, CoreError> {
        if !(0.0..=1.0).contains(&strength) {
            return Err(CoreError::InvalidInput(
                "strength".to_string(),
                format!("{} is outside [0, 1]", strength),
            ));
        }
        if price <= Decimal::ZERO {
            return Err(CoreError::InvalidInput(
                "price".to_string(),
                format!("{} must be positive", price),
            ));
        }
        Ok(Self {
            market,
            strength,
            price,
            timestamp,
            strategy_data: BTreeMap::new(),
        })
    }

    pub fn with_data(mut self, key: &str, value: f64) -> Self {
        self.strategy_data.insert(key.to_string(), value);
        self
    }
}

/// The request handed to an exchange client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: Uuid,
    pub market: Market,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
}

/// What the exchange reported back for an accepted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub exchange_order_id: String,
    pub filled_price: Decimal,
    pub filled_quantity: Decimal,
}

/// An order created by a market worker. It is owned by that worker until it
/// reaches a terminal status, after which it is handed to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeOrder {
    pub id: Uuid,
    pub market: Market,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub status: OrderStatus,
    pub failure: Option<FailureKind>,
    pub exchange_order_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TradeOrder {
    pub fn new(market: Market, side: OrderSide, price: Decimal, quantity: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            market,
            side,
            price,
            quantity,
            status: OrderStatus::Pending,
            failure: None,
            exchange_order_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn to_request(&self) -> OrderRequest {
        OrderRequest {
            client_order_id: self.id,
            market: self.market.clone(),
            side: self.side,
            price: self.price,
            quantity: self.quantity,
        }
    }

    pub fn mark_submitted(&mut self) -> Result<(), CoreError> {
        self.transition(OrderStatus::Submitted, &[OrderStatus::Pending])
    }

    /// Records the exchange fill. The fill price and quantity replace the
    /// requested values since they are what the ledger must account for.
    pub fn mark_filled(&mut self, result: &OrderResult) -> Result<(), CoreError> {
        self.transition(OrderStatus::Filled, &[OrderStatus::Submitted])?;
        self.price = result.filled_price;
        self.quantity = result.filled_quantity;
        self.exchange_order_id = Some(result.exchange_order_id.clone());
        Ok(())
    }

    pub fn mark_failed(&mut self, kind: FailureKind) -> Result<(), CoreError> {
        self.transition(
            OrderStatus::Failed,
            &[OrderStatus::Pending, OrderStatus::Submitted],
        )?;
        self.failure = Some(kind);
        Ok(())
    }

    fn transition(&mut self, to: OrderStatus, allowed_from: &[OrderStatus]) -> Result<(), CoreError> {
        if !allowed_from.contains(&self.status) {
            return Err(CoreError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Current holdings for one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioEntry {
    pub market: Market,
    pub quantity_held: Decimal,
    pub average_buy_price: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl PortfolioEntry {
    pub fn empty(market: Market) -> Self {
        Self {
            market,
            quantity_held: Decimal::ZERO,
            average_buy_price: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity_held.is_zero()
    }

    /// Cost basis of the position.
    pub fn notional(&self) -> Decimal {
        self.quantity_held * self.average_buy_price
    }
}

/// An immutable audit entry for a terminal order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub record_id: Uuid,
    pub order: TradeOrder,
    /// Profit realized by a filled sell, zero otherwise.
    pub realized_pnl: Decimal,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn market() -> Market {
        "binance:BTCUSDT".parse().unwrap()
    }

    #[test]
    fn signal_strength_must_be_normalized() {
        assert!(TradeSignal::new(market(), 1.2, dec!(100), Utc::now()).is_err());
        assert!(TradeSignal::new(market(), f64::NAN, dec!(100), Utc::now()).is_err());
        assert!(TradeSignal::new(market(), 0.7, dec!(100), Utc::now()).is_ok());
    }

    #[test]
    fn order_follows_its_lifecycle() {
        let mut order = TradeOrder::new(market(), OrderSide::Buy, dec!(100), dec!(0.5));
        assert_eq!(order.status, OrderStatus::Pending);

        // A pending order cannot be filled without being submitted first.
        let result = OrderResult {
            exchange_order_id: "42".to_string(),
            filled_price: dec!(101),
            filled_quantity: dec!(0.5),
        };
        assert!(order.mark_filled(&result).is_err());

        order.mark_submitted().unwrap();
        order.mark_filled(&result).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.price, dec!(101));
        assert_eq!(order.exchange_order_id.as_deref(), Some("42"));

        // Terminal orders never change again.
        assert!(order.mark_failed(FailureKind::ApiExhausted).is_err());
    }

    #[test]
    fn failed_order_keeps_its_kind() {
        let mut order = TradeOrder::new(market(), OrderSide::Sell, dec!(100), dec!(1));
        order.mark_submitted().unwrap();
        order.mark_failed(FailureKind::NonRetryable).unwrap();
        assert_eq!(order.failure, Some(FailureKind::NonRetryable));
        assert!(order.status.is_terminal());
    }
}
