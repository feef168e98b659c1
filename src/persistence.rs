// =============================================================================
// Persistence — single append-only `trade_history` table (rusqlite/bundled)
// =============================================================================

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::instrument;

/// One row of the append-only execution ledger.
#[derive(Debug, Clone)]
pub struct TradeHistoryRecord {
    pub timestamp: String,
    pub path: String,
    pub success: bool,
    pub profit_loss: f64,
    pub initial_amount: f64,
    pub final_amount: f64,
    pub execution_time: f64,
    pub total_commission: f64,
    pub predicted_profit_percent: f64,
    pub operating_regime: String,
}

/// Owns the single SQLite connection backing `trade_history`. Single-writer
/// via the Order Executor; append-only. `Connection` is `Send` but not
/// `Sync`, so every access goes through a mutex to let `Arc<TradeStore>` be
/// shared across the orchestrator's spawned tasks.
pub struct TradeStore {
    conn: Mutex<Connection>,
}

impl TradeStore {
    #[instrument(skip(db_path), fields(db_path = %db_path))]
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening trade history database at {db_path}"))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS trade_history (
                timestamp TEXT,
                path TEXT,
                success INT,
                profit_loss REAL,
                initial_amount REAL,
                final_amount REAL,
                execution_time REAL,
                total_commission REAL,
                predicted_profit_percent REAL,
                operating_regime TEXT
            )",
            [],
        )
        .context("creating trade_history table")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    #[instrument(skip(self, record), fields(path = %record.path, success = record.success))]
    pub fn insert(&self, record: &TradeHistoryRecord) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO trade_history (
                    timestamp, path, success, profit_loss, initial_amount, final_amount,
                    execution_time, total_commission, predicted_profit_percent, operating_regime
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.timestamp,
                    record.path,
                    record.success as i32,
                    record.profit_loss,
                    record.initial_amount,
                    record.final_amount,
                    record.execution_time,
                    record.total_commission,
                    record.predicted_profit_percent,
                    record.operating_regime,
                ],
            )
            .context("inserting trade_history row")?;
        Ok(())
    }

    pub fn count(&self) -> Result<i64> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM trade_history", [], |row| row.get(0))
            .context("counting trade_history rows")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> TradeHistoryRecord {
        TradeHistoryRecord {
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            path: "USDT->BTC->USDT".to_string(),
            success: true,
            profit_loss: 5.25,
            initial_amount: 1000.0,
            final_amount: 1005.25,
            execution_time: 0.842,
            total_commission: 1.1,
            predicted_profit_percent: 0.6,
            operating_regime: "hydra_2_heads".to_string(),
        }
    }

    #[test]
    fn creates_table_and_inserts_row() {
        let store = TradeStore::open(":memory:").unwrap();
        store.insert(&sample_record()).unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn table_creation_is_idempotent() {
        let store = TradeStore::open(":memory:").unwrap();
        store.insert(&sample_record()).unwrap();
        store.insert(&sample_record()).unwrap();
        assert_eq!(store.count().unwrap(), 2);
    }
}
