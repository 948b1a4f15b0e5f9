pub mod enums;
pub mod error;
pub mod market;
pub mod structs;

// Re-export the core types to provide a clean public API.
pub use enums::{FailureKind, OrderSide, OrderStatus};
pub use error::CoreError;
pub use market::Market;
pub use structs::{
    Candle, OrderRequest, OrderResult, PortfolioEntry, TradeOrder, TradeRecord, TradeSignal,
};
