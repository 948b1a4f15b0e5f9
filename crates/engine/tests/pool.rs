use alerter::Alert;
use api_client::error::ApiError;
use api_client::ExchangeClient;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use configuration::{LockConfig, WorkerConfig};
use core_types::{
    Candle, FailureKind, Market, OrderRequest, OrderResult, OrderSide, OrderStatus, PortfolioEntry, TradeSignal,
};
use engine::{EngineError, LockCategory, PoolSettings, PortfolioLedger, WorkerPool, WorkerState};
use portfolio::{InMemoryTradeStore, TradeStore};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use strategies::{SignalProvider, StrategyError};
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration, Instant};

#[derive(Debug, Clone, Copy)]
enum Mode {
    Fill,
    AlwaysUnavailable,
    Slow(Duration),
    /// Reports one unit more than was requested on sells.
    Overfill,
    /// Refuses every order with a client error.
    Reject,
    /// Accepts every order without executing any of it.
    EmptyFill,
}

struct MockExchange {
    mode: Mode,
    submits: AtomicUsize,
}

impl MockExchange {
    fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            submits: AtomicUsize::new(0),
        })
    }

    fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn fetch_candles(&self, _market: &Market, interval: &str, count: usize) -> Result<Vec<Candle>, ApiError> {
        let start = Utc::now() - ChronoDuration::minutes(count as i64);
        Ok((0..count)
            .map(|i| {
                let open_time = start + ChronoDuration::minutes(i as i64);
                Candle {
                    open_time,
                    open: dec!(100),
                    high: dec!(101),
                    low: dec!(99),
                    close: dec!(100),
                    volume: dec!(10),
                    close_time: open_time + ChronoDuration::seconds(59),
                    interval: interval.to_string(),
                }
            })
            .collect())
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderResult, ApiError> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        let mut filled_quantity = request.quantity;
        match self.mode {
            Mode::Fill => {}
            Mode::AlwaysUnavailable => {
                return Err(ApiError::Unavailable {
                    status: 503,
                    message: "maintenance".to_string(),
                });
            }
            Mode::Slow(duration) => sleep(duration).await,
            Mode::Overfill => {
                if request.side == OrderSide::Sell {
                    filled_quantity += Decimal::ONE;
                }
            }
            Mode::Reject => {
                return Err(ApiError::Rejected {
                    code: -1013,
                    message: "Filter failure: LOT_SIZE".to_string(),
                });
            }
            Mode::EmptyFill => filled_quantity = Decimal::ZERO,
        }
        Ok(OrderResult {
            exchange_order_id: format!("mock-{}", n),
            filled_price: request.price,
            filled_quantity,
        })
    }
}

/// Returns a configured strength per market, 0.5 (no action) otherwise.
struct FixedSignals(HashMap<Market, f64>);

impl SignalProvider for FixedSignals {
    fn signal(&self, market: &Market, candles: &[Candle]) -> Result<TradeSignal, StrategyError> {
        let last = candles.last().ok_or(StrategyError::InsufficientData { needed: 1, got: 0 })?;
        let strength = self.0.get(market).copied().unwrap_or(0.5);
        TradeSignal::new(market.clone(), strength, last.close, last.close_time)
            .map_err(|e| StrategyError::IndicatorError(e.to_string()))
    }
}

fn market(symbol: &str) -> Market {
    Market::new("binance", symbol).unwrap()
}

fn settings() -> PoolSettings {
    PoolSettings {
        worker: WorkerConfig {
            candle_count: 20,
            min_candles: 10,
            ..WorkerConfig::default()
        },
        ..PoolSettings::default()
    }
}

async fn ledger_holding(holdings: &[(&Market, Decimal)]) -> Arc<PortfolioLedger> {
    let store = Arc::new(InMemoryTradeStore::new());
    for (market, quantity) in holdings {
        let mut entry = PortfolioEntry::empty((*market).clone());
        entry.quantity_held = *quantity;
        entry.average_buy_price = dec!(100);
        store.save_entry(&entry).await.unwrap();
    }
    Arc::new(PortfolioLedger::open(store).await.unwrap())
}

fn pool(
    exchange: Arc<MockExchange>,
    signals: &[(&Market, f64)],
    ledger: Arc<PortfolioLedger>,
) -> (WorkerPool, broadcast::Receiver<Alert>) {
    pool_with(settings(), exchange, signals, ledger)
}

fn pool_with(
    settings: PoolSettings,
    exchange: Arc<MockExchange>,
    signals: &[(&Market, f64)],
    ledger: Arc<PortfolioLedger>,
) -> (WorkerPool, broadcast::Receiver<Alert>) {
    let (alerts, alert_rx) = broadcast::channel(64);
    let signals = FixedSignals(signals.iter().map(|(m, s)| ((*m).clone(), *s)).collect());
    let pool = WorkerPool::new(settings, exchange, Arc::new(signals), ledger, alerts);
    (pool, alert_rx)
}

fn drain(alerts: &mut broadcast::Receiver<Alert>) -> Vec<Alert> {
    let mut received = Vec::new();
    while let Ok(alert) = alerts.try_recv() {
        received.push(alert);
    }
    received
}

#[tokio::test(start_paused = true)]
async fn exhausted_order_is_recorded_as_failed_and_releases_the_buy_lock() {
    let btc = market("BTCUSDT");
    let exchange = MockExchange::new(Mode::AlwaysUnavailable);
    let (pool, _alerts) = pool(exchange.clone(), &[(&btc, 0.9)], ledger_holding(&[]).await);

    pool.start(&[btc.clone()]).await.unwrap();
    sleep(Duration::from_secs(5)).await;
    pool.stop().await;

    assert_eq!(exchange.submits(), 3);
    let trades = pool.ledger().trades().await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].order.status, OrderStatus::Failed);
    assert_eq!(trades[0].order.failure, Some(FailureKind::ApiExhausted));
    assert!(pool.ledger().entry(&btc).await.is_flat());

    assert!(!pool.locks().stats()[&LockCategory::Buy].held());
    let status = &pool.status().await[&btc];
    assert_eq!(status.state, WorkerState::Stopped);
    assert_eq!(status.last_order.as_ref().map(|o| o.failure), Some(Some(FailureKind::ApiExhausted)));
}

#[tokio::test(start_paused = true)]
async fn stop_waits_for_an_order_in_flight() {
    let eth = market("ETHUSDT");
    let call = Duration::from_secs(5);
    let exchange = MockExchange::new(Mode::Slow(call));
    let (pool, _alerts) = pool(exchange.clone(), &[(&eth, 0.1)], ledger_holding(&[(&eth, dec!(2))]).await);

    pool.start(&[eth.clone()]).await.unwrap();
    // The submit is admitted one gate interval after the candle fetch.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(exchange.submits(), 1);
    assert!(pool.locks().stats()[&LockCategory::Sell].held());

    let stopping = Instant::now();
    pool.stop().await;
    assert!(stopping.elapsed() >= call - Duration::from_millis(200));

    assert!(!pool.locks().stats()[&LockCategory::Sell].held());
    let trades = pool.ledger().trades().await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].order.side, OrderSide::Sell);
    assert_eq!(trades[0].order.status, OrderStatus::Filled);
    assert!(pool.ledger().entry(&eth).await.is_flat());
}

#[tokio::test(start_paused = true)]
async fn start_is_idempotent_per_market_and_refused_after_stop() {
    let (btc, eth, sol) = (market("BTCUSDT"), market("ETHUSDT"), market("SOLUSDT"));
    let (pool, _alerts) = pool(MockExchange::new(Mode::Fill), &[], ledger_holding(&[]).await);

    assert_eq!(pool.start(&[btc.clone(), eth.clone()]).await.unwrap(), 2);
    assert_eq!(pool.start(&[btc.clone()]).await.unwrap(), 0);
    assert_eq!(pool.start(&[btc.clone(), sol.clone()]).await.unwrap(), 1);
    assert_eq!(pool.status().await.len(), 3);

    pool.stop().await;
    assert!(pool.is_stopped().await);
    assert!(matches!(pool.start(&[btc]).await, Err(EngineError::PoolStopped)));
    assert!(pool.status().await.values().all(|s| s.state == WorkerState::Stopped));
}

#[tokio::test(start_paused = true)]
async fn oversell_halts_only_the_offending_worker() {
    let (btc, eth) = (market("BTCUSDT"), market("ETHUSDT"));
    let exchange = MockExchange::new(Mode::Overfill);
    let (pool, mut alerts) = pool(
        exchange.clone(),
        &[(&btc, 0.1), (&eth, 0.5)],
        ledger_holding(&[(&btc, dec!(1))]).await,
    );

    pool.start(&[btc.clone(), eth.clone()]).await.unwrap();
    sleep(Duration::from_secs(35)).await;

    let status = pool.status().await;
    assert_eq!(status[&btc].state, WorkerState::Stopped);
    assert!(status[&btc].halt_reason.is_some());
    assert_eq!(status[&btc].ticks, 1);
    assert_ne!(status[&eth].state, WorkerState::Stopped);
    assert!(status[&eth].ticks >= 3);

    // The fill happened on the exchange, so it is on record even though the
    // holdings refused it.
    assert_eq!(pool.ledger().entry(&btc).await.quantity_held, dec!(1));
    let trades = pool.ledger().trades().await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].order.quantity, dec!(2));
    assert_eq!(trades[0].order.status, OrderStatus::Filled);
    assert_eq!(trades[0].order.failure, Some(FailureKind::InsufficientHoldings));

    let halted: Vec<_> = drain(&mut alerts)
        .into_iter()
        .filter_map(|alert| match alert {
            Alert::WorkerHalted { market, .. } => Some(market),
            _ => None,
        })
        .collect();
    assert_eq!(halted, vec![btc]);

    pool.stop().await;
    assert_eq!(exchange.submits(), 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_order_is_submitted_once_and_the_worker_keeps_ticking() {
    let btc = market("BTCUSDT");
    let exchange = MockExchange::new(Mode::Reject);
    let (pool, mut alerts) = pool(exchange.clone(), &[(&btc, 0.9)], ledger_holding(&[]).await);

    pool.start(&[btc.clone()]).await.unwrap();
    sleep(Duration::from_secs(5)).await;

    assert_eq!(exchange.submits(), 1);
    let trades = pool.ledger().trades().await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].order.status, OrderStatus::Failed);
    assert_eq!(trades[0].order.failure, Some(FailureKind::NonRetryable));
    assert!(!pool.locks().stats()[&LockCategory::Buy].held());

    sleep(Duration::from_secs(20)).await;
    let status = &pool.status().await[&btc];
    assert_ne!(status.state, WorkerState::Stopped);
    assert!(status.halt_reason.is_none());
    assert!(status.ticks >= 3);
    // Every later tick places a fresh order, each tried exactly once.
    assert_eq!(exchange.submits(), pool.ledger().trades().await.unwrap().len());
    assert!(pool.ledger().entry(&btc).await.is_flat());

    let received = drain(&mut alerts);
    assert!(!received.iter().any(|alert| matches!(alert, Alert::WorkerHalted { .. } | Alert::Filled { .. })));
    assert!(received.iter().any(|alert| matches!(
        alert,
        Alert::OrderFailed { kind: FailureKind::NonRetryable, .. }
    )));
    pool.stop().await;
}

#[tokio::test(start_paused = true)]
async fn fill_without_executed_quantity_fails_the_order_but_not_the_worker() {
    let btc = market("BTCUSDT");
    let exchange = MockExchange::new(Mode::EmptyFill);
    let (pool, mut alerts) = pool(exchange.clone(), &[(&btc, 0.9)], ledger_holding(&[]).await);

    pool.start(&[btc.clone()]).await.unwrap();
    sleep(Duration::from_secs(25)).await;

    let status = &pool.status().await[&btc];
    assert_ne!(status.state, WorkerState::Stopped);
    assert!(status.halt_reason.is_none());
    assert!(status.ticks >= 3);
    assert_eq!(
        status.last_order.as_ref().map(|o| (o.status, o.failure)),
        Some((OrderStatus::Failed, Some(FailureKind::NonRetryable)))
    );

    let trades = pool.ledger().trades().await.unwrap();
    assert_eq!(trades.len(), exchange.submits());
    assert!(trades.iter().all(|t| t.order.failure == Some(FailureKind::NonRetryable)));
    assert!(pool.ledger().entry(&btc).await.is_flat());

    let received = drain(&mut alerts);
    assert!(!received.iter().any(|alert| matches!(alert, Alert::WorkerHalted { .. } | Alert::Filled { .. })));
    assert!(received.iter().any(|alert| matches!(
        alert,
        Alert::OrderFailed { side: OrderSide::Buy, kind: FailureKind::NonRetryable, .. }
    )));
    pool.stop().await;
}

#[tokio::test(start_paused = true)]
async fn held_order_lock_times_out_then_the_next_tick_trades() {
    let btc = market("BTCUSDT");
    let exchange = MockExchange::new(Mode::Fill);
    let settings = PoolSettings {
        locks: LockConfig { max_wait_ms: Some(500) },
        ..settings()
    };
    let (pool, mut alerts) = pool_with(settings, exchange.clone(), &[(&btc, 0.9)], ledger_holding(&[]).await);

    let held = pool.locks().acquire(LockCategory::Buy).await.unwrap();
    pool.start(&[btc.clone()]).await.unwrap();
    sleep(Duration::from_secs(5)).await;

    assert_eq!(exchange.submits(), 0);
    let trades = pool.ledger().trades().await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].order.status, OrderStatus::Failed);
    assert_eq!(trades[0].order.failure, Some(FailureKind::LockTimeout));
    let status = &pool.status().await[&btc];
    assert_ne!(status.state, WorkerState::Stopped);
    assert_eq!(status.last_order.as_ref().map(|o| o.failure), Some(Some(FailureKind::LockTimeout)));
    assert!(drain(&mut alerts).iter().any(|alert| matches!(
        alert,
        Alert::OrderFailed { side: OrderSide::Buy, kind: FailureKind::LockTimeout, .. }
    )));

    drop(held);
    sleep(Duration::from_secs(10)).await;

    assert_eq!(exchange.submits(), 1);
    let trades = pool.ledger().trades().await.unwrap();
    assert_eq!(trades.len(), 2);
    assert_eq!(trades[1].order.status, OrderStatus::Filled);
    assert_eq!(pool.ledger().entry(&btc).await.quantity_held, dec!(1));
    pool.stop().await;
}
