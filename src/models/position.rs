//! Position model: one open exposure per (connector, symbol).

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::{OrderRequest, OrderSide};
use super::trade::TradeEventKind;

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    /// Order side that opens a position in this direction.
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position in this direction.
    pub fn exit_order_side(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }

    /// Signed P&L of moving `qty` from `entry` to `exit`.
    pub fn pnl(&self, entry: Decimal, exit: Decimal, qty: Decimal) -> Decimal {
        match self {
            Side::Long => (exit - entry) * qty,
            Side::Short => (entry - exit) * qty,
        }
    }

    /// Price `distance` away from `from` in the favorable direction.
    pub fn favorable(&self, from: Decimal, distance: Decimal) -> Decimal {
        match self {
            Side::Long => from + distance,
            Side::Short => from - distance,
        }
    }

    /// Price `distance` away from `from` in the adverse direction.
    pub fn adverse(&self, from: Decimal, distance: Decimal) -> Decimal {
        match self {
            Side::Long => from - distance,
            Side::Short => from + distance,
        }
    }

    /// True when `candidate` is a strictly tighter stop than `current`.
    pub fn is_tighter(&self, candidate: Decimal, current: Decimal) -> bool {
        match self {
            Side::Long => candidate > current,
            Side::Short => candidate < current,
        }
    }

    /// True when `price` has reached `level` from the profitable side.
    pub fn reached_target(&self, price: Decimal, level: Decimal) -> bool {
        match self {
            Side::Long => price >= level,
            Side::Short => price <= level,
        }
    }

    /// True when `price` has crossed the protective `stop`.
    pub fn hit_stop(&self, price: Decimal, stop: Decimal) -> bool {
        match self {
            Side::Long => price <= stop,
            Side::Short => price >= stop,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a tradable instrument on a connector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub connector: String,
    pub symbol: String,
}

impl PositionKey {
    pub fn new(connector: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            connector: connector.into(),
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connector, self.symbol)
    }
}

/// Lifecycle state of a key. `None` and `Closed` have no stored position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    None,
    PendingEntry,
    Open,
    Partial,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::None => "NONE",
            PositionStatus::PendingEntry => "PENDING_ENTRY",
            PositionStatus::Open => "OPEN",
            PositionStatus::Partial => "PARTIAL",
            PositionStatus::Closed => "CLOSED",
        }
    }
}

/// An entry order whose outcome is not known yet. Its notional stays
/// reserved until the order is found filled, dead or never placed.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub order: OrderRequest,
    pub side: Side,
    /// ATR the stop is computed from once the fill is known
    pub atr: Decimal,
    pub notional: Decimal,
    pub submitted_at: DateTime<Utc>,
}

/// A reduce-only exit order that was submitted but not yet confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingExit {
    /// `None` until the exchange has acknowledged the order
    pub order_id: Option<String>,
    pub client_order_id: String,
    pub kind: TradeEventKind,
    pub qty: Decimal,
    /// Price that triggered the exit, used when the fill reports no average
    pub trigger_price: Decimal,
    pub submitted_at: DateTime<Utc>,
}

/// An open position with its protective and profit levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub key: PositionKey,
    pub side: Side,

    /// Confirmed fill price of the entry order
    pub entry_price: Decimal,

    /// Remaining quantity
    pub qty: Decimal,

    /// Quantity at entry
    pub initial_qty: Decimal,

    /// Current protective stop; only ever tightens
    pub stop_price: Decimal,

    /// Stop at entry, defines R
    pub initial_stop: Decimal,

    pub tp1_price: Decimal,
    pub tp2_price: Decimal,

    /// Per-unit risk at entry: |entry - initial_stop|
    pub r: Decimal,

    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub entry_order_id: String,

    #[serde(default)]
    pub moved_to_break_even: bool,

    #[serde(default)]
    pub pending_exit: Option<PendingExit>,
}

impl Position {
    /// Build an open position from a confirmed entry fill.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        key: PositionKey,
        side: Side,
        entry_price: Decimal,
        qty: Decimal,
        stop_price: Decimal,
        tp1_price: Decimal,
        tp2_price: Decimal,
        entry_order_id: String,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            side,
            entry_price,
            qty,
            initial_qty: qty,
            stop_price,
            initial_stop: stop_price,
            tp1_price,
            tp2_price,
            r: (entry_price - stop_price).abs(),
            opened_at,
            status: PositionStatus::Open,
            entry_order_id,
            moved_to_break_even: false,
            pending_exit: None,
        }
    }

    /// Open profit in units of R.
    pub fn r_multiple(&self, price: Decimal) -> Decimal {
        if self.r.is_zero() {
            return Decimal::ZERO;
        }
        self.side.pnl(self.entry_price, price, Decimal::ONE) / self.r
    }

    pub fn notional(&self) -> Decimal {
        self.entry_price * self.qty
    }

    pub fn holding_duration(&self, now: DateTime<Utc>) -> Duration {
        now - self.opened_at
    }

    /// Move the stop to `candidate` if it is tighter. Returns whether it moved.
    pub fn tighten_stop(&mut self, candidate: Decimal) -> bool {
        if self.side.is_tighter(candidate, self.stop_price) {
            self.stop_price = candidate;
            true
        } else {
            false
        }
    }
}
