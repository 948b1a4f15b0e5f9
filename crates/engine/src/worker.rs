use crate::error::EngineError;
use crate::gate::{CallCategory, RateGate};
use crate::ledger::PortfolioLedger;
use crate::locks::{LockCategory, LockToken, OperationLocks};
use crate::shutdown::Shutdown;
use alerter::Alert;
use api_client::ExchangeClient;
use chrono::{DateTime, Utc};
use configuration::WorkerConfig;
use core_types::{
    Candle, FailureKind, Market, OrderSide, OrderStatus, PortfolioEntry, TradeOrder, TradeSignal,
};
use portfolio::LedgerError;
use rust_decimal::{Decimal, RoundingStrategy};
use std::fmt;
use std::sync::Arc;
use strategies::SignalProvider;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, Duration};

/// Decimal places kept on order quantities.
const QUANTITY_SCALE: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Analyzing,
    Deciding,
    Acting,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Analyzing => "analyzing",
            WorkerState::Deciding => "deciding",
            WorkerState::Acting => "acting",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the last order of a worker ended.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderOutcome {
    pub side: OrderSide,
    pub status: OrderStatus,
    pub failure: Option<FailureKind>,
    pub at: DateTime<Utc>,
}

impl From<&TradeOrder> for OrderOutcome {
    fn from(order: &TradeOrder) -> Self {
        Self {
            side: order.side,
            status: order.status,
            failure: order.failure,
            at: order.updated_at,
        }
    }
}

/// A point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub ticks: u64,
    pub last_signal: Option<f64>,
    pub last_order: Option<OrderOutcome>,
    /// Set when the worker was halted by an invariant violation.
    pub halt_reason: Option<String>,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self {
            state: WorkerState::Idle,
            ticks: 0,
            last_signal: None,
            last_order: None,
            halt_reason: None,
        }
    }
}

/// An invariant violation reported to the pool's supervisor.
#[derive(Debug, Clone)]
pub struct WorkerFault {
    pub market: Market,
    pub reason: String,
}

/// Everything a worker shares with the rest of the pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub gate: Arc<RateGate>,
    pub locks: Arc<OperationLocks>,
    pub ledger: Arc<PortfolioLedger>,
    pub exchange: Arc<dyn ExchangeClient>,
    pub signals: Arc<dyn SignalProvider>,
    pub alerts: broadcast::Sender<Alert>,
    pub config: WorkerConfig,
    pub shutdown: Shutdown,
}

/// Chooses the side to trade, if any.
///
/// Sells are considered first so a stop-loss or a take-profit wins over a
/// buy-strength signal.
pub(crate) fn decide(config: &WorkerConfig, signal: &TradeSignal, entry: &PortfolioEntry) -> Option<OrderSide> {
    if !entry.is_flat() {
        let stop_price = entry.average_buy_price * (Decimal::ONE - config.stop_loss_pct);
        let target_price = entry.average_buy_price * (Decimal::ONE + config.take_profit_pct);
        let stop_loss_hit = signal.price <= stop_price;
        let take_profit_hit = signal.price >= target_price;
        if signal.strength <= config.sell_threshold || stop_loss_hit || take_profit_hit {
            return Some(OrderSide::Sell);
        }
    }
    if signal.strength >= config.buy_threshold && entry.notional() < config.max_position_notional {
        return Some(OrderSide::Buy);
    }
    None
}

/// Quantity of the next order: one notional slice capped by the remaining budget for
/// buys, the whole position for sells.
pub(crate) fn order_quantity(
    config: &WorkerConfig,
    side: OrderSide,
    price: Decimal,
    entry: &PortfolioEntry,
) -> Decimal {
    match side {
        OrderSide::Buy => {
            let remaining = config.max_position_notional - entry.notional();
            let spend = config.order_notional.min(remaining);
            if spend <= Decimal::ZERO || price <= Decimal::ZERO {
                return Decimal::ZERO;
            }
            (spend / price).round_dp_with_strategy(QUANTITY_SCALE, RoundingStrategy::ToZero)
        }
        OrderSide::Sell => entry.quantity_held,
    }
}

/// One concurrent analyze, decide and act loop for a single market.
pub struct MarketWorker {
    market: Market,
    ctx: WorkerContext,
    status: watch::Sender<WorkerStatus>,
    faults: mpsc::UnboundedSender<WorkerFault>,
}

impl MarketWorker {
    pub fn new(
        market: Market,
        ctx: WorkerContext,
        faults: mpsc::UnboundedSender<WorkerFault>,
    ) -> (Self, watch::Receiver<WorkerStatus>) {
        let (status, status_rx) = watch::channel(WorkerStatus::default());
        (
            Self {
                market,
                ctx,
                status,
                faults,
            },
            status_rx,
        )
    }

    fn set_state(&self, state: WorkerState) {
        self.status.send_modify(|s| s.state = state);
    }

    /// Sleeps unless the stop signal fires first. Returns `false` when stopping.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.ctx.shutdown.wait() => false,
            _ = sleep(duration) => true,
        }
    }

    fn alert(&self, alert: Alert) {
        // No subscriber simply means alerts are not wanted.
        let _ = self.ctx.alerts.send(alert);
    }

    /// Runs until the pool stops or an invariant violation halts the worker.
    pub async fn run(self, initial_delay: Duration) {
        tracing::info!(market = %self.market, delay = ?initial_delay, "Worker started");

        let mut running = initial_delay.is_zero() || self.pause(initial_delay).await;
        while running && !self.ctx.shutdown.is_triggered() {
            let result = self.tick().await;
            self.status.send_modify(|s| s.ticks += 1);

            if let Err(fault) = result {
                tracing::error!(market = %self.market, reason = %fault.reason, "Worker halted");
                self.status.send_modify(|s| s.halt_reason = Some(fault.reason.clone()));
                let _ = self.faults.send(fault);
                break;
            }
            running = self.pause(self.ctx.config.tick_interval()).await;
        }

        self.set_state(WorkerState::Stopped);
        tracing::info!(market = %self.market, "Worker stopped");
    }

    async fn tick(&self) -> Result<(), WorkerFault> {
        self.set_state(WorkerState::Analyzing);
        let Some(candles) = self.fetch_candles().await else {
            self.set_state(WorkerState::Idle);
            return Ok(());
        };

        self.set_state(WorkerState::Deciding);
        let signal = match self.ctx.signals.signal(&self.market, &candles) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(market = %self.market, error = %e, "Signal evaluation failed");
                self.set_state(WorkerState::Idle);
                return Ok(());
            }
        };
        self.status.send_modify(|s| s.last_signal = Some(signal.strength));

        let entry = self.ctx.ledger.entry(&self.market).await;
        let Some(side) = decide(&self.ctx.config, &signal, &entry) else {
            tracing::debug!(market = %self.market, strength = signal.strength, "No action");
            self.set_state(WorkerState::Idle);
            return Ok(());
        };

        let quantity = order_quantity(&self.ctx.config, side, signal.price, &entry);
        if quantity <= Decimal::ZERO {
            tracing::debug!(market = %self.market, side = %side, "Order quantity rounds to zero, skipping");
            self.set_state(WorkerState::Idle);
            return Ok(());
        }

        self.set_state(WorkerState::Acting);
        let order = TradeOrder::new(self.market.clone(), side, signal.price, quantity);
        tracing::info!(
            market = %self.market,
            side = %side,
            order_id = %order.id,
            strength = signal.strength,
            price = %signal.price,
            quantity = %quantity,
            "Placing order"
        );
        let finished = self.act(order).await?;
        self.status.send_modify(|s| s.last_order = Some(OrderOutcome::from(&finished)));

        self.set_state(WorkerState::Idle);
        Ok(())
    }

    /// Fetches candles under the `candle_data` lock. Any failure skips the tick.
    async fn fetch_candles(&self) -> Option<Vec<Candle>> {
        let ctx = &self.ctx;
        let market = &self.market;
        let result = ctx
            .locks
            .with_lock(LockCategory::CandleData, |token| async move {
                let _token = token;
                ctx.gate
                    .execute(CallCategory::CandleData, move || {
                        ctx.exchange
                            .fetch_candles(market, &ctx.config.candle_interval, ctx.config.candle_count)
                    })
                    .await
            })
            .await;

        match result {
            Ok(Ok(candles)) if candles.len() >= ctx.config.min_candles => Some(candles),
            Ok(Ok(candles)) => {
                tracing::debug!(market = %market, got = candles.len(), "Not enough candles yet");
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(market = %market, error = %e, "Candle fetch failed");
                None
            }
            Err(e) => {
                tracing::warn!(market = %market, error = %e, "Candle lock unavailable");
                None
            }
        }
    }

    /// Submits the order under its side lock and settles the outcome.
    async fn act(&self, mut order: TradeOrder) -> Result<TradeOrder, WorkerFault> {
        let side = order.side;
        let id = order.id;
        let result = self
            .ctx
            .locks
            .with_lock(LockCategory::for_side(side), |token| {
                let order = order.clone();
                async move { self.submit_locked(&token, order).await }
            })
            .await;

        match result {
            Ok(settled) => settled,
            Err(miss) => {
                tracing::warn!(market = %self.market, order_id = %id, error = %miss, "Order lock unavailable");
                order
                    .mark_failed(miss.failure_kind())
                    .map_err(|e| self.fault(e.into()))?;
                if let Err(e) = self.ctx.ledger.record_lock_failure(&miss, order.clone()).await {
                    tracing::error!(market = %self.market, order_id = %id, error = %e, "Failed to record trade");
                }
                self.alert(Alert::OrderFailed {
                    market: self.market.clone(),
                    side,
                    kind: miss.failure_kind(),
                });
                Ok(order)
            }
        }
    }

    async fn submit_locked(&self, token: &LockToken, mut order: TradeOrder) -> Result<TradeOrder, WorkerFault> {
        order.mark_submitted().map_err(|e| self.fault(e.into()))?;
        let request = order.to_request();

        let result = self
            .ctx
            .gate
            .execute(CallCategory::PlaceOrder, || self.ctx.exchange.submit_order(&request))
            .await;

        let fill = match result {
            Ok(fill) if fill.filled_quantity <= Decimal::ZERO => {
                // Accepted but nothing executed, e.g. an expired IOC order.
                tracing::warn!(
                    market = %self.market,
                    order_id = %order.id,
                    exchange_order_id = %fill.exchange_order_id,
                    "Order accepted without any executed quantity"
                );
                return self.settle_failed(token, order, FailureKind::NonRetryable).await;
            }
            Ok(fill) => fill,
            Err(e) => {
                let kind = e.failure_kind();
                tracing::warn!(market = %self.market, order_id = %order.id, kind = kind.as_str(), error = %e, "Order failed");
                return self.settle_failed(token, order, kind).await;
            }
        };

        order.mark_filled(&fill).map_err(|e| self.fault(e.into()))?;
        let applied = self.ctx.ledger.apply_fill(token, &order).await;
        if let Err(EngineError::Ledger(LedgerError::InsufficientHoldings { .. })) = &applied {
            order.failure = Some(FailureKind::InsufficientHoldings);
        }
        // The exchange has filled the order either way, so it is recorded before
        // any fault is raised.
        self.record(token, &order).await;

        match applied {
            Ok(entry) => {
                tracing::info!(
                    market = %self.market,
                    side = %order.side,
                    order_id = %order.id,
                    price = %order.price,
                    quantity = %order.quantity,
                    quantity_held = %entry.quantity_held,
                    "Order filled"
                );
                self.alert(Alert::Filled {
                    market: self.market.clone(),
                    side: order.side,
                    price: order.price,
                    quantity: order.quantity,
                });
                Ok(order)
            }
            Err(EngineError::Ledger(LedgerError::Store(e))) => {
                tracing::error!(market = %self.market, order_id = %order.id, error = %e, "Fill applied but not persisted");
                Ok(order)
            }
            Err(e) => Err(self.fault(e)),
        }
    }

    async fn settle_failed(
        &self,
        token: &LockToken,
        mut order: TradeOrder,
        kind: FailureKind,
    ) -> Result<TradeOrder, WorkerFault> {
        order.mark_failed(kind).map_err(|e| self.fault(e.into()))?;
        self.record(token, &order).await;
        self.alert(Alert::OrderFailed {
            market: self.market.clone(),
            side: order.side,
            kind,
        });
        Ok(order)
    }

    async fn record(&self, token: &LockToken, order: &TradeOrder) {
        if let Err(e) = self.ctx.ledger.record_trade(token, order.clone()).await {
            tracing::error!(market = %self.market, order_id = %order.id, error = %e, "Failed to record trade");
        }
    }

    fn fault(&self, err: EngineError) -> WorkerFault {
        WorkerFault {
            market: self.market.clone(),
            reason: err.to_string(),
        }
    }
}
