use rust_decimal::Decimal;
use std::path::Path;

// Declare the modules that make up this crate.
#[cfg(feature = "clap")]
pub mod cli;
pub mod error;
pub mod settings;
pub mod telemetry;

// Re-export the core types to provide a clean public API.
#[cfg(feature = "clap")]
pub use cli::ConfigArgs;
pub use error::ConfigError;
pub use settings::{
    ApiConfig, Config, ApiKeys, DatabaseConfig, ExchangeConfig, ExchangeKind, LockConfig, LoggingConfig,
    PaperConfig, RateGateConfig, RetryConfig, StrategyConfig, TelegramConfig, WorkerConfig, RETRY_CATEGORIES,
};
pub use telemetry::init_tracing;

/// Loads the application configuration from a TOML file plus `APP__` environment overrides.
///
/// Values from a `.env` file in the working directory are exported first, so secrets
/// such as `APP__EXCHANGE__API__TESTNET__SECRET` never have to live in the TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let config = read_config(path)?;
    config.validate()?;
    Ok(config)
}

pub(crate) fn read_config(path: &Path) -> Result<Config, ConfigError> {
    // A missing .env is normal outside development.
    let _ = dotenvy::dotenv();

    let builder = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(config::Environment::with_prefix("APP").separator("__"))
        .build()?;

    Ok(builder.try_deserialize::<Config>()?)
}

impl Config {
    /// Rejects combinations the workers cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let worker = &self.worker;
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.markets.is_empty() {
            return invalid("at least one market must be configured".to_string());
        }
        for (name, value) in [
            ("buy_threshold", worker.buy_threshold),
            ("sell_threshold", worker.sell_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if worker.sell_threshold >= worker.buy_threshold {
            return invalid(format!(
                "sell_threshold ({}) must be below buy_threshold ({})",
                worker.sell_threshold, worker.buy_threshold
            ));
        }
        if worker.tick_interval_secs == 0 {
            return invalid("tick_interval_secs must be positive".to_string());
        }
        if worker.order_notional <= Decimal::ZERO {
            return invalid("order_notional must be positive".to_string());
        }
        if worker.stop_loss_pct < Decimal::ZERO || worker.stop_loss_pct >= Decimal::ONE {
            return invalid(format!("stop_loss_pct must be within [0, 1), got {}", worker.stop_loss_pct));
        }
        if worker.take_profit_pct <= Decimal::ZERO {
            return invalid(format!("take_profit_pct must be positive, got {}", worker.take_profit_pct));
        }
        if worker.min_candles > worker.candle_count {
            return invalid(format!(
                "min_candles ({}) cannot exceed candle_count ({})",
                worker.min_candles, worker.candle_count
            ));
        }

        let strategy = &self.strategy;
        if strategy.rsi_period == 0 || strategy.trend_period == 0 {
            return invalid("strategy periods must be positive".to_string());
        }
        if strategy.oversold >= strategy.overbought {
            return invalid("strategy.oversold must be below strategy.overbought".to_string());
        }
        if !(0.0..=1.0).contains(&strategy.trend_weight) {
            return invalid("strategy.trend_weight must be within [0, 1]".to_string());
        }
        if worker.min_candles <= strategy.rsi_period.max(strategy.trend_period) {
            return invalid(format!(
                "min_candles ({}) must exceed the longest indicator period",
                worker.min_candles
            ));
        }

        let gate = &self.rate_gate;
        if gate.max_calls_per_window == 0 || gate.window_ms == 0 || gate.max_in_flight == 0 {
            return invalid("rate_gate limits must all be positive".to_string());
        }
        if let Some(unknown) = gate
            .retry_overrides
            .keys()
            .find(|key| !RETRY_CATEGORIES.contains(&key.as_str()))
        {
            return invalid(format!(
                "unknown retry_overrides category '{}', expected one of {:?}",
                unknown, RETRY_CATEGORIES
            ));
        }
        for (category, retry) in
            std::iter::once(("default", &gate.retry)).chain(gate.retry_overrides.iter().map(|(k, v)| (k.as_str(), v)))
        {
            if retry.max_attempts == 0 {
                return invalid(format!("retry policy '{}' needs at least one attempt", category));
            }
        }

        Ok(())
    }
}
