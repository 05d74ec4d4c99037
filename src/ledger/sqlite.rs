//! SQLite ledger backend.
//!
//! Tables:
//! - `trades`: one row per confirmed fill
//! - `equity_curve`: equity after each realized P&L change
//! - `bot_state`: the operator's RUNNING / PAUSED switch
//!
//! Decimals are stored as TEXT so values read back exactly.

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::models::{EquityPoint, Side, TradeEvent, TradeEventKind};

use super::{format_time, parse_time, LedgerSink, RunState};

/// SQLite connection pool with ledger helpers.
#[derive(Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct TradeRow {
    time: String,
    connector: String,
    symbol: String,
    #[sqlx(rename = "type")]
    kind: String,
    side: String,
    price: String,
    qty: String,
    pnl: Option<String>,
    equity: String,
    order_id: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct EquityRow {
    time: String,
    equity: String,
}

impl SqliteLedger {
    /// Open (creating if missing) and migrate.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database url {}", database_url))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let ledger = Self { pool };
        ledger.run_migrations().await?;
        Ok(ledger)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                time TEXT NOT NULL,
                connector TEXT NOT NULL,
                symbol TEXT NOT NULL,
                type TEXT NOT NULL,
                side TEXT NOT NULL,
                price TEXT NOT NULL,
                qty TEXT NOT NULL,
                pnl TEXT,
                equity TEXT NOT NULL,
                order_id TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS equity_curve (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                time TEXT NOT NULL,
                equity TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                state TEXT NOT NULL DEFAULT 'RUNNING',
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_time ON trades(time)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_equity_curve_time ON equity_curve(time)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Run State ====================

    /// Current switch position; a fresh ledger reads as RUNNING.
    pub async fn run_state(&self) -> Result<RunState> {
        let row: Option<(String,)> = sqlx::query_as("SELECT state FROM bot_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .and_then(|(s,)| RunState::parse(&s))
            .unwrap_or(RunState::Running))
    }

    pub async fn set_run_state(&self, state: RunState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bot_state (id, state, updated_at)
            VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(state.as_str())
        .bind(format_time(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Trades ====================

    async fn insert_trade(&self, event: &TradeEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (time, connector, symbol, type, side, price, qty, pnl, equity, order_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(format_time(event.time))
        .bind(&event.connector)
        .bind(&event.symbol)
        .bind(event.kind.as_str())
        .bind(event.side.as_str())
        .bind(event.price.to_string())
        .bind(event.qty.to_string())
        .bind(event.pnl.map(|p| p.to_string()))
        .bind(event.equity.to_string())
        .bind(&event.order_id)
        .execute(&self.pool)
        .await
        .context("Failed to insert trade")?;
        Ok(())
    }

    /// Most recent trades, newest first.
    pub async fn recent_trades(&self, limit: i64) -> Result<Vec<TradeEvent>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT time, connector, symbol, type, side, price, qty, pnl, equity, order_id
             FROM trades ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch trades")?;

        rows.into_iter().map(TradeEvent::try_from).collect()
    }

    /// Trades at or after `since`, oldest first.
    pub async fn trades_since(&self, since: DateTime<Utc>) -> Result<Vec<TradeEvent>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT time, connector, symbol, type, side, price, qty, pnl, equity, order_id
             FROM trades WHERE time >= ? ORDER BY id ASC",
        )
        .bind(format_time(since))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch trades")?;

        rows.into_iter().map(TradeEvent::try_from).collect()
    }

    // ==================== Equity Curve ====================

    async fn insert_equity(&self, point: &EquityPoint) -> Result<()> {
        sqlx::query("INSERT INTO equity_curve (time, equity) VALUES (?, ?)")
            .bind(format_time(point.time))
            .bind(point.equity.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to insert equity point")?;
        Ok(())
    }

    pub async fn latest_equity(&self) -> Result<Option<EquityPoint>> {
        let row = sqlx::query_as::<_, EquityRow>(
            "SELECT time, equity FROM equity_curve ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(EquityPoint::try_from).transpose()
    }

    /// Equity points at or after `since`, oldest first.
    pub async fn equity_curve_since(&self, since: DateTime<Utc>) -> Result<Vec<EquityPoint>> {
        let rows = sqlx::query_as::<_, EquityRow>(
            "SELECT time, equity FROM equity_curve WHERE time >= ? ORDER BY id ASC",
        )
        .bind(format_time(since))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch equity curve")?;

        rows.into_iter().map(EquityPoint::try_from).collect()
    }

    /// Get the connection pool (for ad-hoc queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn decimal(field: &str, value: &str) -> Result<Decimal> {
    Decimal::from_str(value).with_context(|| format!("Bad decimal in {}: {}", field, value))
}

fn timestamp(value: &str) -> Result<DateTime<Utc>> {
    parse_time(value).with_context(|| format!("Bad timestamp: {}", value))
}

impl TryFrom<TradeRow> for TradeEvent {
    type Error = anyhow::Error;

    fn try_from(row: TradeRow) -> Result<Self> {
        let kind = TradeEventKind::parse(&row.kind)
            .with_context(|| format!("Unknown trade type {}", row.kind))?;
        let side = match row.side.as_str() {
            "long" => Side::Long,
            "short" => Side::Short,
            other => anyhow::bail!("Unknown side {}", other),
        };
        Ok(TradeEvent {
            time: timestamp(&row.time)?,
            connector: row.connector,
            symbol: row.symbol,
            kind,
            side,
            price: decimal("price", &row.price)?,
            qty: decimal("qty", &row.qty)?,
            pnl: row
                .pnl
                .filter(|p| !p.is_empty())
                .map(|p| decimal("pnl", &p))
                .transpose()?,
            equity: decimal("equity", &row.equity)?,
            order_id: row.order_id,
        })
    }
}

impl TryFrom<EquityRow> for EquityPoint {
    type Error = anyhow::Error;

    fn try_from(row: EquityRow) -> Result<Self> {
        Ok(EquityPoint {
            time: timestamp(&row.time)?,
            equity: decimal("equity", &row.equity)?,
        })
    }
}

#[async_trait]
impl LedgerSink for SqliteLedger {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn append_trade(&self, event: &TradeEvent) -> Result<()> {
        self.insert_trade(event).await
    }

    async fn append_equity(&self, point: &EquityPoint) -> Result<()> {
        self.insert_equity(point).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    async fn temp_ledger() -> (tempfile::TempDir, SqliteLedger) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
        let ledger = SqliteLedger::connect(&url).await.unwrap();
        (dir, ledger)
    }

    #[tokio::test]
    async fn test_trade_round_trip() {
        let (_dir, ledger) = temp_ledger().await;
        let event = TradeEvent {
            time: Utc::now(),
            connector: "bybit".into(),
            symbol: "SOLUSDT".into(),
            kind: TradeEventKind::Sl,
            side: Side::Long,
            price: dec!(142.37),
            qty: dec!(3.5),
            pnl: Some(dec!(-10.5)),
            equity: dec!(989.5),
            order_id: "x-1".into(),
        };
        ledger.append_trade(&event).await.unwrap();

        let trades = ledger.recent_trades(10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].kind, TradeEventKind::Sl);
        assert_eq!(trades[0].pnl, Some(dec!(-10.5)));
        assert_eq!(trades[0].price, dec!(142.37));
    }

    #[tokio::test]
    async fn test_latest_equity_and_since() {
        let (_dir, ledger) = temp_ledger().await;
        assert!(ledger.latest_equity().await.unwrap().is_none());

        let t0 = Utc::now() - Duration::days(3);
        for (i, eq) in [dec!(1000), dec!(1020), dec!(1005)].into_iter().enumerate() {
            ledger
                .append_equity(&EquityPoint {
                    time: t0 + Duration::days(i as i64),
                    equity: eq,
                })
                .await
                .unwrap();
        }

        assert_eq!(ledger.latest_equity().await.unwrap().unwrap().equity, dec!(1005));
        let recent = ledger
            .equity_curve_since(t0 + Duration::hours(12))
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn test_run_state_switch() {
        let (_dir, ledger) = temp_ledger().await;
        assert_eq!(ledger.run_state().await.unwrap(), RunState::Running);
        ledger.set_run_state(RunState::Paused).await.unwrap();
        assert_eq!(ledger.run_state().await.unwrap(), RunState::Paused);
        ledger.set_run_state(RunState::Running).await.unwrap();
        assert_eq!(ledger.run_state().await.unwrap(), RunState::Running);
    }
}
