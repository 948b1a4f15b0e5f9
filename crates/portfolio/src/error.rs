use core_types::Market;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// A sell larger than the position. Treated as a fatal invariant violation.
    #[error("Sell of {requested} on {market} exceeds holdings of {held}")]
    InsufficientHoldings {
        market: Market,
        requested: Decimal,
        held: Decimal,
    },

    #[error("Order {0} cannot be applied to the portfolio: {1}")]
    InvalidFill(String, String),

    #[error("Trade store failure: {0}")]
    Store(String),
}
