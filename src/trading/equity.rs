//! Running equity and the ordered ledger stream.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::ledger::LedgerSink;
use crate::models::{EquityPoint, PositionKey, Side, TradeEvent, TradeEventKind};

/// A confirmed fill about to be written to the ledger.
#[derive(Debug, Clone)]
pub struct FillRecord {
    pub key: PositionKey,
    pub kind: TradeEventKind,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub order_id: String,
    pub time: DateTime<Utc>,
}

struct EquityState {
    equity: Decimal,
    last_point_at: Option<DateTime<Utc>>,
}

/// Owns equity. Every realized P&L goes through [`record`](Self::record),
/// which appends the trade row and then the equity row under one lock, so
/// the ledger order matches the order of updates.
pub struct EquityTracker {
    state: Mutex<EquityState>,
    sink: Arc<dyn LedgerSink>,
}

impl EquityTracker {
    pub fn new(seed: Decimal, sink: Arc<dyn LedgerSink>) -> Self {
        Self {
            state: Mutex::new(EquityState {
                equity: seed,
                last_point_at: None,
            }),
            sink,
        }
    }

    pub async fn equity(&self) -> Decimal {
        self.state.lock().await.equity
    }

    /// Append a fill. Entries carry no P&L and leave equity unchanged; exits
    /// add `pnl` to equity and produce an [`EquityPoint`].
    pub async fn record(&self, fill: FillRecord, pnl: Option<Decimal>) -> TradeEvent {
        let mut state = self.state.lock().await;

        if let Some(pnl) = pnl {
            state.equity += pnl;
        }

        let event = TradeEvent {
            time: fill.time,
            connector: fill.key.connector.clone(),
            symbol: fill.key.symbol.clone(),
            kind: fill.kind,
            side: fill.side,
            price: fill.price,
            qty: fill.qty,
            pnl,
            equity: state.equity,
            order_id: fill.order_id,
        };

        if let Err(e) = self.sink.append_trade(&event).await {
            warn!(key = %fill.key, kind = %event.kind, error = %e, "failed to append trade");
        }

        if pnl.is_some() {
            // keep equity timestamps strictly increasing
            let time = match state.last_point_at {
                Some(last) if fill.time <= last => last + Duration::microseconds(1),
                _ => fill.time,
            };
            state.last_point_at = Some(time);

            let point = EquityPoint {
                time,
                equity: state.equity,
            };
            if let Err(e) = self.sink.append_equity(&point).await {
                warn!(error = %e, "failed to append equity point");
            }
        }

        info!(
            key = %fill.key,
            kind = %event.kind,
            side = %event.side,
            price = %event.price,
            qty = %event.qty,
            pnl = %event.pnl.unwrap_or_default(),
            equity = %event.equity,
            "ledger"
        );

        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::MemoryLedger;
    use rust_decimal_macros::dec;

    fn fill(kind: TradeEventKind, price: Decimal, qty: Decimal, time: DateTime<Utc>) -> FillRecord {
        FillRecord {
            key: PositionKey::new("bybit", "BTCUSDT"),
            kind,
            side: Side::Long,
            price,
            qty,
            order_id: format!("{}-{}", kind, price),
            time,
        }
    }

    #[tokio::test]
    async fn test_entry_does_not_move_equity() {
        let ledger = Arc::new(MemoryLedger::default());
        let tracker = EquityTracker::new(dec!(1000), ledger.clone());

        let ev = tracker
            .record(fill(TradeEventKind::Enter, dec!(100), dec!(7), Utc::now()), None)
            .await;

        assert_eq!(ev.equity, dec!(1000));
        assert_eq!(tracker.equity().await, dec!(1000));
        assert_eq!(ledger.trades().len(), 1);
        assert!(ledger.equity_points().is_empty());
    }

    #[tokio::test]
    async fn test_realized_pnl_sums_to_equity_delta() {
        let ledger = Arc::new(MemoryLedger::default());
        let tracker = EquityTracker::new(dec!(1000), ledger.clone());
        let now = Utc::now();

        tracker
            .record(fill(TradeEventKind::Enter, dec!(100), dec!(7), now), None)
            .await;
        tracker
            .record(fill(TradeEventKind::Tp1, dec!(102), dec!(3.5), now), Some(dec!(7)))
            .await;
        tracker
            .record(fill(TradeEventKind::Sl, dec!(100), dec!(3.5), now), Some(dec!(0)))
            .await;

        let trades = ledger.trades();
        let realized: Decimal = trades.iter().filter_map(|t| t.pnl).sum();
        let first_equity_before = trades[0].equity;
        let last_equity = trades.last().unwrap().equity;
        assert_eq!(realized, last_equity - first_equity_before);
        assert_eq!(tracker.equity().await, dec!(1007));
    }

    #[tokio::test]
    async fn test_equity_points_strictly_increasing() {
        let ledger = Arc::new(MemoryLedger::default());
        let tracker = EquityTracker::new(dec!(500), ledger.clone());
        let now = Utc::now();

        for _ in 0..3 {
            tracker
                .record(fill(TradeEventKind::Time, dec!(1), dec!(1), now), Some(dec!(1)))
                .await;
        }

        let points = ledger.equity_points();
        assert_eq!(points.len(), 3);
        assert!(points.windows(2).all(|w| w[0].time < w[1].time));
        assert_eq!(points[2].equity, dec!(503));
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_block_equity() {
        let ledger = Arc::new(MemoryLedger::default());
        ledger.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        let tracker = EquityTracker::new(dec!(100), ledger);

        tracker
            .record(fill(TradeEventKind::Tp2, dec!(1), dec!(1), Utc::now()), Some(dec!(-4)))
            .await;
        assert_eq!(tracker.equity().await, dec!(96));
    }
}
