use crate::DbError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{Market, PortfolioEntry, TradeOrder, TradeRecord};
use portfolio::{LedgerError, TradeStore};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

/// The `PgTradeStore` encapsulates all SQL for the ledger's durable state.
#[derive(Debug, Clone)]
pub struct PgTradeStore {
    pool: PgPool,
}

impl PgTradeStore {
    /// Creates a new `PgTradeStore` with a shared database connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn upsert_entry(&self, entry: &PortfolioEntry) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO portfolio_entries (market, quantity_held, average_buy_price, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (market) DO UPDATE SET
                quantity_held = EXCLUDED.quantity_held,
                average_buy_price = EXCLUDED.average_buy_price,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(entry.market.to_string())
        .bind(entry.quantity_held)
        .bind(entry.average_buy_price)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn select_entries(&self) -> Result<Vec<PortfolioEntry>, DbError> {
        let rows = sqlx::query(
            "SELECT market, quantity_held, average_buy_price, updated_at FROM portfolio_entries",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn insert_trade(&self, record: &TradeRecord) -> Result<(), DbError> {
        let order_json = serde_json::to_value(&record.order)?;
        sqlx::query(
            r#"
            INSERT INTO trade_records
                (record_id, order_id, market, side, status, failure, realized_pnl, recorded_at, trade_order)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.record_id)
        .bind(record.order.id)
        .bind(record.order.market.to_string())
        .bind(record.order.side.as_str())
        .bind(record.order.status.as_str())
        .bind(record.order.failure.map(|kind| kind.as_str()))
        .bind(record.realized_pnl)
        .bind(record.recorded_at)
        .bind(order_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn select_trades(&self) -> Result<Vec<TradeRecord>, DbError> {
        let rows = sqlx::query(
            "SELECT record_id, realized_pnl, recorded_at, trade_order FROM trade_records ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<TradeRecord, DbError> {
                let order: JsonValue = row.try_get("trade_order")?;
                Ok(TradeRecord {
                    record_id: row.try_get::<Uuid, _>("record_id")?,
                    order: serde_json::from_value::<TradeOrder>(order)?,
                    realized_pnl: row.try_get::<Decimal, _>("realized_pnl")?,
                    recorded_at: row.try_get::<DateTime<Utc>, _>("recorded_at")?,
                })
            })
            .collect()
    }
}

fn parse_market(raw: &str) -> Result<Market, DbError> {
    raw.parse()
        .map_err(|e| DbError::InvalidRow(format!("market '{}': {}", raw, e)))
}

fn entry_from_row(row: &PgRow) -> Result<PortfolioEntry, DbError> {
    let market: String = row.try_get("market")?;
    Ok(PortfolioEntry {
        market: parse_market(&market)?,
        quantity_held: row.try_get("quantity_held")?,
        average_buy_price: row.try_get("average_buy_price")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl TradeStore for PgTradeStore {
    async fn save_entry(&self, entry: &PortfolioEntry) -> Result<(), LedgerError> {
        Ok(self.upsert_entry(entry).await?)
    }

    async fn load_entries(&self) -> Result<Vec<PortfolioEntry>, LedgerError> {
        Ok(self.select_entries().await?)
    }

    async fn append_trade(&self, record: &TradeRecord) -> Result<(), LedgerError> {
        tracing::debug!(record_id = %record.record_id, market = %record.order.market, "Persisting trade record");
        Ok(self.insert_trade(record).await?)
    }

    async fn trades(&self) -> Result<Vec<TradeRecord>, LedgerError> {
        Ok(self.select_trades().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_market_text_round_trips() {
        let market = parse_market("binance:BTCUSDT").unwrap();
        assert_eq!(market.to_string(), "binance:BTCUSDT");
    }

    #[test]
    fn corrupt_market_text_is_reported() {
        assert!(matches!(parse_market("BTCUSDT"), Err(DbError::InvalidRow(_))));
    }
}
