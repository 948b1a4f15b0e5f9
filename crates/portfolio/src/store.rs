use crate::error::LedgerError;
use async_trait::async_trait;
use core_types::{Market, PortfolioEntry, TradeRecord};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Durable home of portfolio entries and the trade audit trail.
///
/// Implementations must offer read-your-writes per market: an entry saved by a
/// worker is what that worker sees on the next load.
#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn save_entry(&self, entry: &PortfolioEntry) -> Result<(), LedgerError>;

    async fn load_entries(&self) -> Result<Vec<PortfolioEntry>, LedgerError>;

    /// Appends a record. Existing records are never rewritten.
    async fn append_trade(&self, record: &TradeRecord) -> Result<(), LedgerError>;

    /// All records in append order.
    async fn trades(&self) -> Result<Vec<TradeRecord>, LedgerError>;
}

/// The default store; contents live as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryTradeStore {
    entries: RwLock<HashMap<Market, PortfolioEntry>>,
    trades: RwLock<Vec<TradeRecord>>,
}

impl InMemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TradeStore for InMemoryTradeStore {
    async fn save_entry(&self, entry: &PortfolioEntry) -> Result<(), LedgerError> {
        self.entries
            .write()
            .await
            .insert(entry.market.clone(), entry.clone());
        Ok(())
    }

    async fn load_entries(&self) -> Result<Vec<PortfolioEntry>, LedgerError> {
        Ok(self.entries.read().await.values().cloned().collect())
    }

    async fn append_trade(&self, record: &TradeRecord) -> Result<(), LedgerError> {
        self.trades.write().await.push(record.clone());
        Ok(())
    }

    async fn trades(&self) -> Result<Vec<TradeRecord>, LedgerError> {
        Ok(self.trades.read().await.clone())
    }
}
