use crate::error::StrategyError;
use crate::SignalProvider;
use configuration::StrategyConfig;
use core_types::{Candle, Market, TradeSignal};
use rust_decimal::prelude::*;
use ta::indicators::{RelativeStrengthIndex as Rsi, SimpleMovingAverage as Sma};
use ta::Next;

/// Relative deviation from the trend average that saturates the trend component.
const TREND_SATURATION: f64 = 0.05;

/// Blends an oversold/overbought RSI reading with the price's position against its
/// moving average.
///
/// RSI at `oversold` or below contributes full strength, RSI at `overbought` or
/// above contributes none. The trend component is 0.5 at the average and saturates
/// at `TREND_SATURATION` above or below it.
#[derive(Debug, Clone)]
pub struct RsiTrend {
    params: StrategyConfig,
}

impl RsiTrend {
    pub fn new(params: StrategyConfig) -> Result<Self, StrategyError> {
        if params.rsi_period == 0 || params.trend_period == 0 {
            return Err(StrategyError::InvalidParameters(
                "Indicator periods must be positive".to_string(),
            ));
        }
        if params.oversold >= params.overbought {
            return Err(StrategyError::InvalidParameters(
                "Oversold level must be below the overbought level".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&params.trend_weight) {
            return Err(StrategyError::InvalidParameters(
                "Trend weight must be within [0, 1]".to_string(),
            ));
        }
        Ok(Self { params })
    }

    /// Candles needed before the indicators are meaningful.
    pub fn warmup(&self) -> usize {
        self.params.rsi_period.max(self.params.trend_period) + 1
    }
}

impl SignalProvider for RsiTrend {
    fn signal(&self, market: &Market, candles: &[Candle]) -> Result<TradeSignal, StrategyError> {
        let needed = self.warmup();
        let last = match candles.last() {
            Some(last) if candles.len() >= needed => last,
            _ => {
                return Err(StrategyError::InsufficientData {
                    needed,
                    got: candles.len(),
                })
            }
        };

        let mut rsi = Rsi::new(self.params.rsi_period)
            .map_err(|e| StrategyError::IndicatorError(e.to_string()))?;
        let mut sma = Sma::new(self.params.trend_period)
            .map_err(|e| StrategyError::IndicatorError(e.to_string()))?;

        // The `ta` crate uses `f64`. We must convert from our high-precision `Decimal`.
        let (mut rsi_value, mut sma_value, mut close) = (0.0, 0.0, 0.0);
        for candle in candles {
            close = candle.close.to_f64().ok_or_else(|| {
                StrategyError::IndicatorError(format!("close {} is not representable", candle.close))
            })?;
            rsi_value = rsi.next(close);
            sma_value = sma.next(close);
        }
        // A series without any movement has no defined RSI.
        if !rsi_value.is_finite() {
            rsi_value = 50.0;
        }

        let p = &self.params;
        let rsi_strength = ((p.overbought - rsi_value) / (p.overbought - p.oversold)).clamp(0.0, 1.0);
        let deviation = if sma_value > 0.0 { (close - sma_value) / sma_value } else { 0.0 };
        let trend_strength = (0.5 + deviation / (2.0 * TREND_SATURATION)).clamp(0.0, 1.0);
        let strength = (1.0 - p.trend_weight) * rsi_strength + p.trend_weight * trend_strength;

        tracing::debug!(
            %market,
            rsi = rsi_value,
            sma = sma_value,
            strength,
            "RsiTrend evaluated"
        );

        let signal = TradeSignal::new(market.clone(), strength, last.close, last.close_time)
            .map_err(|e| StrategyError::IndicatorError(e.to_string()))?;
        Ok(signal
            .with_data("rsi", rsi_value)
            .with_data("rsi_signal", rsi_strength)
            .with_data("sma", sma_value)
            .with_data("trend_signal", trend_strength))
    }
}
