//! Ledger records: trade events and equity points.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::position::{PositionKey, Side};

/// What a ledger trade row represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeEventKind {
    Enter,
    Tp1,
    Tp2,
    Sl,
    Time,
}

impl TradeEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeEventKind::Enter => "ENTER",
            TradeEventKind::Tp1 => "TP1",
            TradeEventKind::Tp2 => "TP2",
            TradeEventKind::Sl => "SL",
            TradeEventKind::Time => "TIME",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ENTER" => Some(TradeEventKind::Enter),
            "TP1" => Some(TradeEventKind::Tp1),
            "TP2" => Some(TradeEventKind::Tp2),
            "SL" => Some(TradeEventKind::Sl),
            "TIME" => Some(TradeEventKind::Time),
            _ => None,
        }
    }

    pub fn is_exit(&self) -> bool {
        !matches!(self, TradeEventKind::Enter)
    }
}

impl fmt::Display for TradeEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One confirmed fill as written to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub time: DateTime<Utc>,
    pub connector: String,
    pub symbol: String,
    pub kind: TradeEventKind,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,

    /// Realized P&L; absent on ENTER
    pub pnl: Option<Decimal>,

    /// Account equity after this event
    pub equity: Decimal,

    pub order_id: String,
}

impl TradeEvent {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.connector.clone(), self.symbol.clone())
    }
}

/// Account equity sampled after a realized P&L change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: DateTime<Utc>,
    pub equity: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip_names() {
        for kind in [
            TradeEventKind::Enter,
            TradeEventKind::Tp1,
            TradeEventKind::Tp2,
            TradeEventKind::Sl,
            TradeEventKind::Time,
        ] {
            assert_eq!(TradeEventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TradeEventKind::parse("BUY"), None);
    }

    #[test]
    fn test_only_enter_is_not_exit() {
        assert!(!TradeEventKind::Enter.is_exit());
        assert!(TradeEventKind::Time.is_exit());
    }
}
