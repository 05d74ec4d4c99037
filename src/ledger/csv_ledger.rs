//! File-append CSV backend: `trades.csv` and `equity_curve.csv`.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::models::{EquityPoint, TradeEvent};

use super::{format_time, LedgerSink};

const TRADE_HEADER: [&str; 10] = [
    "time", "connector", "symbol", "type", "side", "price", "qty", "pnl", "equity", "order_id",
];
const EQUITY_HEADER: [&str; 2] = ["time", "equity"];

pub struct CsvLedger {
    trades_path: PathBuf,
    equity_path: PathBuf,
    // serializes appends so rows never interleave
    write_lock: Mutex<()>,
}

impl CsvLedger {
    /// Ledger files under `dir`, created if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create ledger directory {}", dir.display()))?;
        Ok(Self {
            trades_path: dir.join("trades.csv"),
            equity_path: dir.join("equity_curve.csv"),
            write_lock: Mutex::new(()),
        })
    }

    pub fn trades_path(&self) -> &Path {
        &self.trades_path
    }

    pub fn equity_path(&self) -> &Path {
        &self.equity_path
    }

    fn append_row(&self, path: &Path, header: &[&str], row: &[String]) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("CSV ledger lock poisoned"))?;

        let file = open_append(path)?;
        let is_new = file.metadata().map(|m| m.len() == 0).unwrap_or(true);

        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if is_new {
            wtr.write_record(header)?;
        }
        wtr.write_record(row)?;
        wtr.flush()
            .with_context(|| format!("Failed to flush {}", path.display()))?;
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))
}

#[async_trait]
impl LedgerSink for CsvLedger {
    fn name(&self) -> &str {
        "csv"
    }

    async fn append_trade(&self, event: &TradeEvent) -> Result<()> {
        let row = vec![
            format_time(event.time),
            event.connector.clone(),
            event.symbol.clone(),
            event.kind.as_str().to_string(),
            event.side.as_str().to_string(),
            event.price.to_string(),
            event.qty.to_string(),
            event.pnl.map(|p| p.to_string()).unwrap_or_default(),
            event.equity.to_string(),
            event.order_id.clone(),
        ];
        self.append_row(&self.trades_path, &TRADE_HEADER, &row)
    }

    async fn append_equity(&self, point: &EquityPoint) -> Result<()> {
        let row = vec![format_time(point.time), point.equity.to_string()];
        self.append_row(&self.equity_path, &EQUITY_HEADER, &row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Side, TradeEventKind};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = CsvLedger::new(dir.path()).unwrap();

        for kind in [TradeEventKind::Enter, TradeEventKind::Tp1] {
            let event = TradeEvent {
                time: Utc::now(),
                connector: "bybit".into(),
                symbol: "ETHUSDT".into(),
                kind,
                side: Side::Short,
                price: dec!(2500.5),
                qty: dec!(0.4),
                pnl: (kind == TradeEventKind::Tp1).then_some(dec!(12.5)),
                equity: dec!(1012.5),
                order_id: "abc".into(),
            };
            ledger.append_trade(&event).await.unwrap();
        }

        let mut rdr = csv::Reader::from_path(ledger.trades_path()).unwrap();
        let headers = rdr.headers().unwrap().clone();
        assert_eq!(headers.iter().collect::<Vec<_>>(), TRADE_HEADER.to_vec());

        let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][3], "ENTER");
        assert_eq!(&rows[0][7], "");
        assert_eq!(&rows[1][3], "TP1");
        assert_eq!(&rows[1][7], "12.5");
    }

    #[tokio::test]
    async fn test_equity_rows_append() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = CsvLedger::new(dir.path().join("nested")).unwrap();
        ledger
            .append_equity(&EquityPoint {
                time: Utc::now(),
                equity: dec!(1000),
            })
            .await
            .unwrap();
        ledger
            .append_equity(&EquityPoint {
                time: Utc::now(),
                equity: dec!(1010),
            })
            .await
            .unwrap();

        let content = std::fs::read_to_string(ledger.equity_path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "time,equity");
        assert_eq!(lines.len(), 3);
        assert!(lines[2].ends_with(",1010"));
    }
}
