use crate::error::LedgerError;
use chrono::{DateTime, NaiveDate, Utc};
use core_types::{Market, OrderSide, OrderStatus, PortfolioEntry, TradeOrder};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// The outcome of applying one filled order.
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub entry: PortfolioEntry,
    /// `(fill price - average buy price) * quantity` for sells, zero for buys.
    pub realized_pnl: Decimal,
}

/// Realized profit accumulated over a single UTC day.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyProfit {
    day: NaiveDate,
    realized: Decimal,
}

impl DailyProfit {
    pub fn new(day: NaiveDate) -> Self {
        Self {
            day,
            realized: Decimal::ZERO,
        }
    }

    /// Adds a realized amount, starting over when `at` falls on a new day.
    pub fn add(&mut self, at: DateTime<Utc>, amount: Decimal) {
        let day = at.date_naive();
        if day != self.day {
            self.day = day;
            self.realized = Decimal::ZERO;
        }
        self.realized += amount;
    }

    pub fn on(&self, day: NaiveDate) -> Decimal {
        if day == self.day {
            self.realized
        } else {
            Decimal::ZERO
        }
    }
}

/// Manages the per-market holdings of a spot account.
/// Its sole responsibility is to accurately reflect the current state based on filled orders.
#[derive(Debug, Clone)]
pub struct Holdings {
    positions: HashMap<Market, PortfolioEntry>,
    daily: DailyProfit,
}

impl Default for Holdings {
    fn default() -> Self {
        Self::new()
    }
}

impl Holdings {
    pub fn new() -> Self {
        Self {
            positions: HashMap::new(),
            daily: DailyProfit::new(Utc::now().date_naive()),
        }
    }

    /// Restores holdings from previously persisted entries.
    pub fn from_entries(entries: impl IntoIterator<Item = PortfolioEntry>) -> Self {
        let mut holdings = Self::new();
        for entry in entries {
            holdings.positions.insert(entry.market.clone(), entry);
        }
        holdings
    }

    /// Snapshot of one market; flat markets yield an empty entry.
    pub fn entry(&self, market: &Market) -> PortfolioEntry {
        self.positions
            .get(market)
            .cloned()
            .unwrap_or_else(|| PortfolioEntry::empty(market.clone()))
    }

    pub fn entries(&self) -> Vec<PortfolioEntry> {
        let mut entries: Vec<_> = self.positions.values().cloned().collect();
        entries.sort_by(|a, b| a.market.cmp(&b.market));
        entries
    }

    pub fn daily_profit(&self, day: NaiveDate) -> Decimal {
        self.daily.on(day)
    }

    /// Updates the holdings with a filled order.
    ///
    /// Buys move the average price to the quantity weighted mean. Sells keep it and
    /// realize profit against it; a sell beyond the held quantity is refused and
    /// leaves the holdings untouched.
    pub fn apply_fill(
        &mut self,
        order: &TradeOrder,
        now: DateTime<Utc>,
    ) -> Result<Fill, LedgerError> {
        if order.status != OrderStatus::Filled {
            return Err(LedgerError::InvalidFill(
                order.id.to_string(),
                format!("status is {}", order.status.as_str()),
            ));
        }
        if order.quantity <= Decimal::ZERO || order.price <= Decimal::ZERO {
            return Err(LedgerError::InvalidFill(
                order.id.to_string(),
                "price and quantity must be positive".to_string(),
            ));
        }

        let position = self
            .positions
            .entry(order.market.clone())
            .or_insert_with(|| PortfolioEntry::empty(order.market.clone()));

        let realized_pnl = match order.side {
            OrderSide::Buy => {
                let existing_value = position.average_buy_price * position.quantity_held;
                let new_value = order.price * order.quantity;
                let total_quantity = position.quantity_held + order.quantity;

                position.average_buy_price = (existing_value + new_value) / total_quantity;
                position.quantity_held = total_quantity;
                Decimal::ZERO
            }
            OrderSide::Sell => {
                if order.quantity > position.quantity_held {
                    return Err(LedgerError::InsufficientHoldings {
                        market: order.market.clone(),
                        requested: order.quantity,
                        held: position.quantity_held,
                    });
                }
                let pnl = (order.price - position.average_buy_price) * order.quantity;
                position.quantity_held -= order.quantity;
                if position.quantity_held.is_zero() {
                    position.average_buy_price = Decimal::ZERO;
                }
                pnl
            }
        };
        position.updated_at = now;

        let entry = position.clone();
        if !realized_pnl.is_zero() {
            self.daily.add(now, realized_pnl);
        }

        Ok(Fill {
            entry,
            realized_pnl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use core_types::OrderResult;
    use rust_decimal_macros::dec;

    fn market() -> Market {
        "binance:BTCUSDT".parse().unwrap()
    }

    fn filled(side: OrderSide, price: Decimal, quantity: Decimal) -> TradeOrder {
        let mut order = TradeOrder::new(market(), side, price, quantity);
        order.mark_submitted().unwrap();
        order
            .mark_filled(&OrderResult {
                exchange_order_id: "1".to_string(),
                filled_price: price,
                filled_quantity: quantity,
            })
            .unwrap();
        order
    }

    #[test]
    fn buys_average_the_entry_price() {
        let mut holdings = Holdings::new();
        let now = Utc::now();
        holdings.apply_fill(&filled(OrderSide::Buy, dec!(100), dec!(1)), now).unwrap();
        let fill = holdings.apply_fill(&filled(OrderSide::Buy, dec!(200), dec!(1)), now).unwrap();

        assert_eq!(fill.entry.quantity_held, dec!(2));
        assert_eq!(fill.entry.average_buy_price, dec!(150));
        assert_eq!(fill.realized_pnl, Decimal::ZERO);
    }

    #[test]
    fn sells_realize_profit_against_the_average() {
        let mut holdings = Holdings::new();
        let now = Utc::now();
        holdings.apply_fill(&filled(OrderSide::Buy, dec!(100), dec!(2)), now).unwrap();
        let fill = holdings.apply_fill(&filled(OrderSide::Sell, dec!(110), dec!(1)), now).unwrap();

        assert_eq!(fill.realized_pnl, dec!(10));
        assert_eq!(fill.entry.quantity_held, dec!(1));
        assert_eq!(fill.entry.average_buy_price, dec!(100));
        assert_eq!(holdings.daily_profit(now.date_naive()), dec!(10));

        let closing = holdings.apply_fill(&filled(OrderSide::Sell, dec!(90), dec!(1)), now).unwrap();
        assert!(closing.entry.is_flat());
        assert_eq!(closing.entry.average_buy_price, Decimal::ZERO);
        assert_eq!(holdings.daily_profit(now.date_naive()), dec!(0));
    }

    #[test]
    fn overselling_is_refused_without_side_effects() {
        let mut holdings = Holdings::new();
        let now = Utc::now();
        holdings.apply_fill(&filled(OrderSide::Buy, dec!(100), dec!(1)), now).unwrap();

        let err = holdings
            .apply_fill(&filled(OrderSide::Sell, dec!(100), dec!(1.5)), now)
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientHoldings { .. }));
        assert_eq!(holdings.entry(&market()).quantity_held, dec!(1));
    }

    #[test]
    fn unfilled_orders_are_not_applied() {
        let mut holdings = Holdings::new();
        let order = TradeOrder::new(market(), OrderSide::Buy, dec!(100), dec!(1));
        assert!(matches!(
            holdings.apply_fill(&order, Utc::now()),
            Err(LedgerError::InvalidFill(..))
        ));
    }

    #[test]
    fn daily_profit_resets_on_a_new_day() {
        let monday = Utc.with_ymd_and_hms(2024, 3, 4, 23, 0, 0).unwrap();
        let tuesday = Utc.with_ymd_and_hms(2024, 3, 5, 1, 0, 0).unwrap();

        let mut daily = DailyProfit::new(monday.date_naive());
        daily.add(monday, dec!(5));
        daily.add(monday, dec!(-2));
        assert_eq!(daily.on(monday.date_naive()), dec!(3));

        daily.add(tuesday, dec!(1));
        assert_eq!(daily.on(tuesday.date_naive()), dec!(1));
        assert_eq!(daily.on(monday.date_naive()), Decimal::ZERO);
    }
}
