use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A tradable instrument on a specific exchange, written as `exchange:SYMBOL`.
///
/// Markets are configured once at startup and never change afterwards, so the
/// type only exposes read accessors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Market {
    exchange: String,
    symbol: String,
}

impl Market {
    pub fn new(exchange: &str, symbol: &str) -> Result<Self, CoreError> {
        let exchange = exchange.trim().to_lowercase();
        let symbol = symbol.trim().to_uppercase();
        if exchange.is_empty() || symbol.is_empty() || exchange.contains(':') || symbol.contains(':') {
            return Err(CoreError::InvalidMarket(format!("{}:{}", exchange, symbol)));
        }
        Ok(Self { exchange, symbol })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

impl FromStr for Market {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (exchange, symbol) = s
            .split_once(':')
            .ok_or_else(|| CoreError::InvalidMarket(s.to_string()))?;
        Market::new(exchange, symbol).map_err(|_| CoreError::InvalidMarket(s.to_string()))
    }
}

impl TryFrom<String> for Market {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Market> for String {
    fn from(market: Market) -> Self {
        market.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_normalizes() {
        let market: Market = "Binance:btcusdt".parse().unwrap();
        assert_eq!(market.exchange(), "binance");
        assert_eq!(market.symbol(), "BTCUSDT");
        assert_eq!(market.to_string(), "binance:BTCUSDT");
    }

    #[test]
    fn rejects_malformed_identifiers() {
        assert!("BTCUSDT".parse::<Market>().is_err());
        assert!(":BTCUSDT".parse::<Market>().is_err());
        assert!("binance:".parse::<Market>().is_err());
        assert!("a:b:c".parse::<Market>().is_err());
    }

    #[test]
    fn serializes_as_plain_string() {
        let market = Market::new("upbit", "krw-btc").unwrap();
        let json = serde_json::to_string(&market).unwrap();
        assert_eq!(json, "\"upbit:KRW-BTC\"");
        let back: Market = serde_json::from_str(&json).unwrap();
        assert_eq!(back, market);
    }
}
