use crate::enums::OrderStatus;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Invalid input for {0}: {1}")]
    InvalidInput(String, String),

    #[error("Invalid market identifier '{0}', expected '<exchange>:<symbol>'")]
    InvalidMarket(String),

    #[error("Illegal order status transition from {from:?} to {to:?}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },
}
