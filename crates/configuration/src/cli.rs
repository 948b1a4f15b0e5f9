use crate::error::ConfigError;
use crate::settings::{Config, ExchangeKind};
use clap::Args;
use core_types::Market;
use std::path::PathBuf;

/// Command-line flags that locate the configuration file and override parts of it.
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Path to the TOML configuration file.
    #[arg(long, short, default_value = "config.toml")]
    pub config: PathBuf,

    /// Force simulated order fills regardless of the configured exchange.
    #[arg(long)]
    pub paper: bool,

    /// Replace the configured market list (repeatable, `exchange:SYMBOL`).
    #[arg(long = "market")]
    pub markets: Vec<Market>,
}

impl ConfigArgs {
    /// Reads the file, applies the overrides and validates the result.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let mut config = crate::read_config(&self.config)?;
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Applies the overrides onto a loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        if self.paper {
            config.exchange.kind = ExchangeKind::Paper;
        }
        if !self.markets.is_empty() {
            config.markets = self.markets.clone();
        }
    }
}
