use crate::error::EngineError;
use crate::locks::{LockCategory, LockMiss, LockToken};
use chrono::Utc;
use core_types::{Market, OrderStatus, PortfolioEntry, TradeOrder, TradeRecord};
use portfolio::{Holdings, LedgerError, TradeStore};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

struct LedgerState {
    holdings: Holdings,
    /// Realized profit of applied fills, waiting for their trade record.
    pending_pnl: HashMap<Uuid, Decimal>,
}

/// Shared holdings, daily profit and trade records.
///
/// Mutations take a `LockToken`, so they can only happen while the caller holds an
/// operation lock; holdings changes additionally require the lock of the order's side.
/// The one exception, recording an order whose lock wait failed, takes the `LockMiss`
/// for that lock instead. Reads are open to anyone.
pub struct PortfolioLedger {
    state: Mutex<LedgerState>,
    store: Arc<dyn TradeStore>,
}

impl PortfolioLedger {
    /// Builds the ledger from whatever the store already holds.
    pub async fn open(store: Arc<dyn TradeStore>) -> Result<Self, EngineError> {
        let entries = store.load_entries().await?;
        tracing::info!(entries = entries.len(), "Portfolio ledger loaded");
        Ok(Self {
            state: Mutex::new(LedgerState {
                holdings: Holdings::from_entries(entries),
                pending_pnl: HashMap::new(),
            }),
            store,
        })
    }

    fn require(token: &LockToken, expected: LockCategory) -> Result<(), EngineError> {
        if token.category() != expected {
            return Err(EngineError::WrongLock {
                expected,
                held: token.category(),
            });
        }
        Ok(())
    }

    /// Applies a filled order to the holdings of its market.
    ///
    /// A sell beyond the held quantity leaves the holdings unchanged and fails with
    /// `LedgerError::InsufficientHoldings`. If persisting the new entry fails the
    /// in-memory holdings keep the fill and the store error is returned.
    pub async fn apply_fill(&self, token: &LockToken, order: &TradeOrder) -> Result<PortfolioEntry, EngineError> {
        Self::require(token, LockCategory::for_side(order.side))?;

        let mut state = self.state.lock().await;
        let fill = state.holdings.apply_fill(order, Utc::now())?;
        state.pending_pnl.insert(order.id, fill.realized_pnl);

        // Persist while still holding the state lock so the store sees entries in order.
        self.store.save_entry(&fill.entry).await?;
        tracing::debug!(
            market = %order.market,
            side = %order.side,
            quantity_held = %fill.entry.quantity_held,
            average_buy_price = %fill.entry.average_buy_price,
            "Portfolio entry updated"
        );
        Ok(fill.entry)
    }

    /// Appends an immutable record of a terminal order.
    pub async fn record_trade(&self, token: &LockToken, order: TradeOrder) -> Result<TradeRecord, EngineError> {
        if !order.status.is_terminal() {
            return Err(LedgerError::InvalidFill(
                order.id.to_string(),
                format!("cannot record a {} order", order.status.as_str()),
            )
            .into());
        }
        tracing::trace!(lock = %token.category(), order_id = %order.id, "Recording trade");
        self.append(order).await
    }

    /// Records an order that failed before its side lock was obtained.
    ///
    /// The order must have failed with the kind of `miss`, on the side whose lock missed.
    pub async fn record_lock_failure(&self, miss: &LockMiss, order: TradeOrder) -> Result<TradeRecord, EngineError> {
        let matches_miss = order.status == OrderStatus::Failed
            && order.failure == Some(miss.failure_kind())
            && LockCategory::for_side(order.side) == miss.category();
        if !matches_miss {
            return Err(LedgerError::InvalidFill(
                order.id.to_string(),
                format!("a {} lock miss does not account for this order", miss.category()),
            )
            .into());
        }
        tracing::trace!(lock = %miss.category(), order_id = %order.id, "Recording lock failure");
        self.append(order).await
    }

    async fn append(&self, order: TradeOrder) -> Result<TradeRecord, EngineError> {
        let realized_pnl = self
            .state
            .lock()
            .await
            .pending_pnl
            .remove(&order.id)
            .unwrap_or(Decimal::ZERO);

        let record = TradeRecord {
            record_id: Uuid::new_v4(),
            order,
            realized_pnl,
            recorded_at: Utc::now(),
        };
        self.store.append_trade(&record).await?;
        Ok(record)
    }

    pub async fn entry(&self, market: &Market) -> PortfolioEntry {
        self.state.lock().await.holdings.entry(market)
    }

    pub async fn entries(&self) -> Vec<PortfolioEntry> {
        self.state.lock().await.holdings.entries()
    }

    pub async fn trades(&self) -> Result<Vec<TradeRecord>, EngineError> {
        Ok(self.store.trades().await?)
    }

    /// Realized profit of the current UTC day.
    pub async fn daily_profit(&self) -> Decimal {
        self.state
            .lock()
            .await
            .holdings
            .daily_profit(Utc::now().date_naive())
    }
}
