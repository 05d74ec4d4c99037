//! Data models for bars, orders, positions, and ledger records.

mod bar;
mod order;
mod position;
mod trade;

pub use bar::{Bar, Timeframe};
pub use order::{ExchangeLimits, FillStatus, OrderRequest};
pub use position::{PendingEntry, PendingExit, Position, PositionKey, PositionStatus, Side};
pub use trade::{EquityPoint, TradeEvent, TradeEventKind};
