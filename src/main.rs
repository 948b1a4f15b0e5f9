use alerter::run_alerter_service;
use anyhow::Context;
use api_client::{BinanceClient, ExchangeClient, PaperExchange};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use configuration::{init_tracing, Config, ConfigArgs, DatabaseConfig, ExchangeKind};
use database::PgTradeStore;
use engine::{PoolSettings, PortfolioLedger, WorkerPool};
use portfolio::{InMemoryTradeStore, TradeStore};
use std::sync::Arc;
use std::time::Duration;
use strategies::RsiTrend;
use tokio::sync::broadcast;

/// The main entry point for the Conductor trading bot.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::CheckConfig(args) => check_config(args),
    }
}

// ==============================================================================
// CLI Structure
// ==============================================================================

/// Runs one trading worker per market against a shared, rate-limited exchange client.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the worker pool and trade until interrupted.
    Run(ConfigArgs),
    /// Load and validate the configuration, then print a summary.
    CheckConfig(ConfigArgs),
}

// ==============================================================================
// Run Command Logic
// ==============================================================================

async fn run(args: ConfigArgs) -> anyhow::Result<()> {
    let config = args.load().context("Failed to load configuration")?;
    let _log_guard = init_tracing(&config.logging)?;
    tracing::info!(
        markets = config.markets.len(),
        exchange = ?config.exchange.kind,
        live_mode = config.exchange.live_mode,
        "Starting conductor"
    );

    let store = open_store(&config.database).await?;
    let ledger = Arc::new(PortfolioLedger::open(store).await?);
    let exchange = build_exchange(&config)?;
    let signals = Arc::new(RsiTrend::new(config.strategy.clone())?);

    let (alerts, alert_rx) = broadcast::channel(256);
    let alerter = tokio::spawn(run_alerter_service(
        alerter::from_config(&config.telegram),
        alert_rx,
    ));

    let pool = WorkerPool::new(PoolSettings::from(&config), exchange, signals, ledger, alerts);
    pool.start(&config.markets).await?;

    let mut status_ticker = tokio::time::interval(Duration::from_secs(config.status_interval_secs.max(1)));
    // The first tick completes immediately; skip it so the table shows some progress.
    status_ticker.tick().await;

    let shutdown_signal = wait_for_shutdown_signal();
    tokio::pin!(shutdown_signal);
    loop {
        tokio::select! {
            result = &mut shutdown_signal => {
                result.context("Failed to listen for shutdown signals")?;
                tracing::info!("Shutdown signal received");
                break;
            }
            _ = status_ticker.tick() => print_status(&pool).await,
        }
    }

    pool.stop().await;
    print_status(&pool).await;

    // Dropping the pool closes the alert channel, which ends the alerter service.
    drop(pool);
    alerter.await.context("Alerter service panicked")?;
    Ok(())
}

async fn open_store(config: &DatabaseConfig) -> anyhow::Result<Arc<dyn TradeStore>> {
    if config.url.is_none() {
        tracing::warn!("No database configured. Trades are kept in memory only.");
        return Ok(Arc::new(InMemoryTradeStore::new()));
    }
    let pool = database::connect(config).await?;
    database::run_migrations(&pool).await?;
    tracing::info!("Connected to PostgreSQL and applied migrations");
    Ok(Arc::new(PgTradeStore::new(pool)))
}

fn build_exchange(config: &Config) -> anyhow::Result<Arc<dyn ExchangeClient>> {
    let live_mode = config.exchange.live_mode;
    let exchange: Arc<dyn ExchangeClient> = match config.exchange.kind {
        ExchangeKind::Paper => {
            let market_data = Arc::new(BinanceClient::public(live_mode)?);
            Arc::new(PaperExchange::new(market_data, config.exchange.paper.slippage_pct))
        }
        ExchangeKind::Binance => Arc::new(BinanceClient::new(live_mode, &config.exchange.api)?),
    };
    Ok(exchange)
}

async fn print_status(pool: &WorkerPool) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Market", "State", "Ticks", "Signal", "Last order", "Held", "Avg price"]);

    for (market, status) in pool.status().await {
        let entry = pool.ledger().entry(&market).await;
        let state = match &status.halt_reason {
            Some(reason) => format!("halted: {}", reason),
            None => status.state.to_string(),
        };
        let last_order = match &status.last_order {
            Some(order) => match order.failure {
                Some(kind) => format!("{} {} ({})", order.side, order.status.as_str(), kind.as_str()),
                None => format!("{} {} at {}", order.side, order.status.as_str(), order.at.format("%H:%M:%S")),
            },
            None => "-".to_string(),
        };
        table.add_row(vec![
            market.to_string(),
            state,
            status.ticks.to_string(),
            status
                .last_signal
                .map_or_else(|| "-".to_string(), |s| format!("{:.3}", s)),
            last_order,
            entry.quantity_held.normalize().to_string(),
            entry.average_buy_price.round_dp(2).to_string(),
        ]);
    }
    println!("{table}");

    let budget = pool.gate().budget();
    tracing::info!(
        daily_profit = %pool.ledger().daily_profit().await,
        calls_in_window = budget.calls_in_window,
        max_calls_per_window = budget.max_calls_per_window,
        in_flight = budget.in_flight,
        "Status"
    );
}

/// Waits until either Ctrl-C or SIGTERM is received.
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = term.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

// ==============================================================================
// Check-Config Command Logic
// ==============================================================================

fn check_config(args: ConfigArgs) -> anyhow::Result<()> {
    let config = args
        .load()
        .with_context(|| format!("Invalid configuration in {}", args.config.display()))?;

    let worker = &config.worker;
    let gate = &config.rate_gate;
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec!["Setting", "Value"]);
    let rows = [
        ("exchange", format!("{:?} (live: {})", config.exchange.kind, config.exchange.live_mode)),
        (
            "markets",
            config.markets.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(", "),
        ),
        (
            "rate gate",
            format!(
                "{} calls / {} ms, {} in flight",
                gate.max_calls_per_window, gate.window_ms, gate.max_in_flight
            ),
        ),
        (
            "retries",
            format!("{} attempts, {} ms apart", gate.retry.max_attempts, gate.retry.delay_ms),
        ),
        (
            "lock wait",
            config
                .locks
                .max_wait_ms
                .map_or_else(|| "unbounded".to_string(), |ms| format!("{} ms", ms)),
        ),
        ("tick interval", format!("{} s", worker.tick_interval_secs)),
        (
            "thresholds",
            format!("buy >= {}, sell <= {}", worker.buy_threshold, worker.sell_threshold),
        ),
        (
            "exits",
            format!("stop loss {}, take profit {}", worker.stop_loss_pct, worker.take_profit_pct),
        ),
        (
            "position",
            format!("{} per order, {} max", worker.order_notional, worker.max_position_notional),
        ),
        (
            "database",
            if config.database.url.is_some() { "postgres" } else { "in-memory" }.to_string(),
        ),
        (
            "alerts",
            if config.telegram.token.is_empty() { "log" } else { "telegram" }.to_string(),
        ),
    ];
    for (setting, value) in rows {
        table.add_row(vec![setting.to_string(), value]);
    }

    println!("{table}");
    println!("Configuration OK.");
    Ok(())
}
