//! Append-only trade and equity ledger.
//!
//! The engine only ever appends. Backends are swappable behind
//! [`LedgerSink`]; [`FanoutLedger`] writes to several at once.

mod csv_ledger;
mod sqlite;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;

use crate::models::{EquityPoint, TradeEvent};

pub use csv_ledger::CsvLedger;
pub use sqlite::SqliteLedger;

/// Destination for ledger rows.
#[async_trait]
pub trait LedgerSink: Send + Sync {
    fn name(&self) -> &str;

    async fn append_trade(&self, event: &TradeEvent) -> Result<()>;

    async fn append_equity(&self, point: &EquityPoint) -> Result<()>;
}

/// Writes every row to each backend in order. A failing backend is logged
/// and skipped.
#[derive(Clone, Default)]
pub struct FanoutLedger {
    sinks: Vec<Arc<dyn LedgerSink>>,
}

impl FanoutLedger {
    pub fn new(sinks: Vec<Arc<dyn LedgerSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl LedgerSink for FanoutLedger {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn append_trade(&self, event: &TradeEvent) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.append_trade(event).await {
                warn!(sink = sink.name(), kind = %event.kind, error = %e, "ledger trade append failed");
            }
        }
        Ok(())
    }

    async fn append_equity(&self, point: &EquityPoint) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.append_equity(point).await {
                warn!(sink = sink.name(), error = %e, "ledger equity append failed");
            }
        }
        Ok(())
    }
}

/// Operator switch stored alongside the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "RUNNING",
            RunState::Paused => "PAUSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "RUNNING" => Some(RunState::Running),
            // older ledgers used STOPPED for the same switch
            "PAUSED" | "STOPPED" => Some(RunState::Paused),
            _ => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Fixed-width UTC timestamp so rows sort lexically.
pub fn format_time(time: DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

pub fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
        .or_else(|| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryLedger;
    use super::*;
    use crate::models::{Side, TradeEventKind};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;

    fn event() -> TradeEvent {
        TradeEvent {
            time: Utc::now(),
            connector: "bybit".into(),
            symbol: "BTCUSDT".into(),
            kind: TradeEventKind::Enter,
            side: Side::Long,
            price: dec!(100),
            qty: dec!(1),
            pnl: None,
            equity: dec!(1000),
            order_id: "o-1".into(),
        }
    }

    #[tokio::test]
    async fn test_fanout_survives_failing_sink() {
        let broken = Arc::new(MemoryLedger::default());
        broken.fail.store(true, Ordering::SeqCst);
        let healthy = Arc::new(MemoryLedger::default());

        let fanout = FanoutLedger::new(vec![broken.clone(), healthy.clone()]);
        fanout.append_trade(&event()).await.unwrap();

        assert!(broken.trades().is_empty());
        assert_eq!(healthy.trades().len(), 1);
    }

    #[test]
    fn test_time_format_round_trip() {
        let t = Utc.with_ymd_and_hms(2024, 6, 30, 23, 59, 1).unwrap();
        let s = format_time(t);
        assert_eq!(s, "2024-06-30T23:59:01.000000Z");
        assert_eq!(parse_time(&s), Some(t));
        assert_eq!(parse_time("2024-06-30T23:59:01+00:00"), Some(t));
    }

    #[test]
    fn test_run_state_parse() {
        assert_eq!(RunState::parse("running"), Some(RunState::Running));
        assert_eq!(RunState::parse("STOPPED"), Some(RunState::Paused));
        assert_eq!(RunState::parse("x"), None);
    }
}
