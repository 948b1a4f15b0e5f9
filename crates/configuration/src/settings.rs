use core_types::Market;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// The root configuration structure for the entire application.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub rate_gate: RateGateConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// The markets to run one worker each for, as `exchange:SYMBOL`.
    #[serde(default)]
    pub markets: Vec<Market>,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// How often the binary prints the worker status table.
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

fn default_status_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Real market data, simulated fills.
    #[default]
    Paper,
    /// Signed orders against the Binance spot API.
    Binance,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ExchangeConfig {
    #[serde(default)]
    pub kind: ExchangeKind,
    /// Selects production endpoints and keys instead of the testnet.
    #[serde(default)]
    pub live_mode: bool,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub paper: PaperConfig,
}

/// API credentials for both environments. Usually supplied through
/// `APP__EXCHANGE__API__...` variables in `.env` rather than the TOML file.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApiConfig {
    #[serde(default)]
    pub production: ApiKeys,
    #[serde(default)]
    pub testnet: ApiKeys,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApiKeys {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    /// Price penalty applied to simulated fills, as a fraction of the price.
    pub slippage_pct: Decimal,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            slippage_pct: dec!(0.0005),
        }
    }
}

/// Call categories that `retry_overrides` may name.
pub const RETRY_CATEGORIES: [&str; 2] = ["candle_data", "place_order"];

/// Parameters of the process-wide API admission gate.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateGateConfig {
    /// Ceiling on admitted calls inside any rolling window.
    pub max_calls_per_window: u32,
    pub window_ms: u64,
    /// Ceiling on calls that are in flight at the same time.
    pub max_in_flight: usize,
    pub retry: RetryConfig,
    /// Per call category overrides, keyed by `candle_data` / `place_order`.
    pub retry_overrides: HashMap<String, RetryConfig>,
}

impl RateGateConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn retry_for(&self, category: &str) -> &RetryConfig {
        self.retry_overrides.get(category).unwrap_or(&self.retry)
    }
}

impl Default for RateGateConfig {
    fn default() -> Self {
        Self {
            max_calls_per_window: 8,
            window_ms: 1_000,
            max_in_flight: 4,
            retry: RetryConfig::default(),
            retry_overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, the first call included.
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub delay_ms: u64,
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LockConfig {
    /// Upper bound on waiting for an operation lock. Unbounded when absent.
    #[serde(default)]
    pub max_wait_ms: Option<u64>,
}

impl LockConfig {
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_ms.map(Duration::from_millis)
    }
}

/// Behaviour of every market worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub tick_interval_secs: u64,
    /// Delay between the first ticks of consecutive workers.
    pub stagger_ms: u64,
    pub candle_interval: String,
    pub candle_count: usize,
    /// Series shorter than this are skipped for the tick.
    pub min_candles: usize,
    pub buy_threshold: f64,
    pub sell_threshold: f64,
    /// Quote amount spent by a single buy.
    pub order_notional: Decimal,
    /// Cost basis at which a market stops accepting further buys.
    pub max_position_notional: Decimal,
    /// Loss fraction of the average buy price that forces a sell.
    pub stop_loss_pct: Decimal,
    /// Gain fraction over the average buy price that takes the profit.
    pub take_profit_pct: Decimal,
}

impl WorkerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            stagger_ms: 1_000,
            candle_interval: "1m".to_string(),
            candle_count: 200,
            min_candles: 30,
            buy_threshold: 0.65,
            sell_threshold: 0.45,
            order_notional: dec!(100),
            max_position_notional: dec!(1000),
            stop_loss_pct: dec!(0.03),
            take_profit_pct: dec!(0.01),
        }
    }
}

/// Parameters of the default RSI / trend signal provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub rsi_period: usize,
    /// RSI at or below this maps to full buy strength.
    pub oversold: f64,
    /// RSI at or above this maps to zero strength.
    pub overbought: f64,
    pub trend_period: usize,
    /// Share of the trend component in the blended strength.
    pub trend_weight: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            oversold: 30.0,
            overbought: 70.0,
            trend_period: 20,
            trend_weight: 0.3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub chat_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL URL. Trades are kept in memory when absent.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub filter: String,
    /// Directory for daily rolling log files. Console only when absent.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            directory: None,
            file_prefix: "conductor.log".to_string(),
        }
    }
}
