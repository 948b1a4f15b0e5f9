use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StrategyError {
    #[error("Strategy received invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("An error occurred during indicator calculation: {0}")]
    IndicatorError(String),

    #[error("Not enough candles: need {needed}, got {got}")]
    InsufficientData { needed: usize, got: usize },
}
