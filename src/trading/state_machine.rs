//! Lifecycle rules for one position: levels at entry, stop management, and
//! which exit (if any) fires on a tick.
//!
//! These functions never touch the exchange. The orchestrator submits the
//! orders they ask for and feeds back only *confirmed* fills through
//! [`PositionStateMachine::apply_exit`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::error::TradingError;
use crate::models::{ExchangeLimits, Position, PositionKey, PositionStatus, Side, TradeEventKind};

use super::TradeManagerConfig;

/// An exit the position is asking for.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitTrigger {
    pub kind: TradeEventKind,
    /// Quantity to close with a reduce-only order
    pub qty: Decimal,
    /// Price observed when the trigger fired
    pub price: Decimal,
}

/// Result of applying a confirmed exit fill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitApplied {
    pub pnl: Decimal,
    pub closed_qty: Decimal,
    pub fill_price: Decimal,
    /// Quantity reached zero; the position must leave the registry
    pub closed: bool,
}

#[derive(Debug, Clone)]
pub struct PositionStateMachine {
    config: TradeManagerConfig,
}

impl PositionStateMachine {
    pub fn new(config: TradeManagerConfig) -> Self {
        Self { config }
    }

    // ==================== Entry ====================

    /// Protective stop for an entry at `price`.
    pub fn stop_for(&self, side: Side, price: Decimal, atr: Decimal) -> Decimal {
        side.adverse(price, self.config.atr_k_sl * atr)
    }

    /// Build the OPEN position from a confirmed entry fill. Stop and targets
    /// are derived from the fill price and fixed here.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &self,
        key: PositionKey,
        side: Side,
        fill_price: Decimal,
        qty: Decimal,
        atr: Decimal,
        order_id: String,
        now: DateTime<Utc>,
    ) -> Result<Position, TradingError> {
        let r = self.config.atr_k_sl * atr;
        if r <= Decimal::ZERO || fill_price <= Decimal::ZERO {
            return Err(TradingError::InvalidRisk {
                entry: fill_price,
                stop: side.adverse(fill_price, r),
            });
        }

        let stop = side.adverse(fill_price, r);
        let tp1 = side.favorable(fill_price, self.config.tp1_r * r);
        let tp2 = side.favorable(fill_price, self.config.tp2_r * r);

        info!(
            key = %key,
            side = %side,
            entry = %fill_price,
            qty = %qty,
            stop = %stop,
            tp1 = %tp1,
            tp2 = %tp2,
            "position OPEN"
        );

        Ok(Position::open(
            key, side, fill_price, qty, stop, tp1, tp2, order_id, now,
        ))
    }

    // ==================== Stop Management ====================

    /// Break-even and ATR trail. Stops only tighten. Returns whether the stop
    /// moved.
    pub fn adjust_stop(&self, pos: &mut Position, price: Decimal, atr: Option<Decimal>) -> bool {
        let mut moved = false;

        if let Some(be_r) = self.config.be_after_r {
            if !pos.moved_to_break_even && pos.r_multiple(price) >= be_r {
                if pos.tighten_stop(pos.entry_price) {
                    info!(key = %pos.key, stop = %pos.stop_price, "stop moved to break-even");
                    moved = true;
                }
                pos.moved_to_break_even = true;
            }
        }

        let trail_active = self.config.trail_always
            || (self.config.trail_after_tp1 && pos.status == PositionStatus::Partial);
        if let (Some(k), Some(atr), true) = (self.config.trail_atr_k, atr, trail_active) {
            if atr > Decimal::ZERO {
                let candidate = pos.side.adverse(price, k * atr);
                if pos.tighten_stop(candidate) {
                    debug!(key = %pos.key, stop = %pos.stop_price, "trailing stop advanced");
                    moved = true;
                }
            }
        }

        moved
    }

    // ==================== Exit Signals ====================

    /// The exit that fires at `price` / `now`, checked in order SL, TP2, TP1,
    /// TIME.
    pub fn check_exit(
        &self,
        pos: &Position,
        price: Decimal,
        now: DateTime<Utc>,
        limits: &ExchangeLimits,
    ) -> Option<ExitTrigger> {
        if pos.qty <= Decimal::ZERO {
            return None;
        }

        if pos.side.hit_stop(price, pos.stop_price) {
            info!(key = %pos.key, price = %price, stop = %pos.stop_price, "stop loss triggered");
            return Some(self.full_exit(pos, TradeEventKind::Sl, price));
        }

        if pos.side.reached_target(price, pos.tp2_price) {
            info!(key = %pos.key, price = %price, target = %pos.tp2_price, "TP2 reached");
            return Some(self.full_exit(pos, TradeEventKind::Tp2, price));
        }

        if pos.status == PositionStatus::Open && pos.side.reached_target(price, pos.tp1_price) {
            match self.tp1_qty(pos, limits) {
                Some(qty) => {
                    info!(key = %pos.key, price = %price, target = %pos.tp1_price, "TP1 reached");
                    return Some(ExitTrigger {
                        kind: TradeEventKind::Tp1,
                        qty,
                        price,
                    });
                }
                None => debug!(
                    key = %pos.key,
                    qty = %pos.qty,
                    "TP1 reached but the partial is not tradable, holding for TP2/SL/TIME"
                ),
            }
        }

        if pos.holding_duration(now) > self.config.time_exit() {
            info!(
                key = %pos.key,
                held_minutes = pos.holding_duration(now).num_minutes(),
                "time exit reached"
            );
            return Some(self.full_exit(pos, TradeEventKind::Time, price));
        }

        None
    }

    fn full_exit(&self, pos: &Position, kind: TradeEventKind, price: Decimal) -> ExitTrigger {
        ExitTrigger {
            kind,
            qty: pos.qty,
            price,
        }
    }

    /// Partial size for TP1, or `None` when the fraction or the remainder
    /// would fall below what the exchange accepts. TP1 never closes a
    /// position outright.
    fn tp1_qty(&self, pos: &Position, limits: &ExchangeLimits) -> Option<Decimal> {
        let part = limits.quantize_down(pos.qty * self.config.tp1_close_pct);
        let rest = pos.qty - part;
        let tradable = part > Decimal::ZERO
            && rest > Decimal::ZERO
            && !limits.below_min_qty(part)
            && !limits.below_min_qty(rest);
        tradable.then_some(part)
    }

    // ==================== Confirmed Fills ====================

    /// Price to book an exit at: the confirmed average, else the stop level
    /// for SL, else the trigger price.
    pub fn exit_price(
        &self,
        pos: &Position,
        kind: TradeEventKind,
        avg_price: Option<Decimal>,
        trigger_price: Decimal,
    ) -> Decimal {
        match (avg_price, kind) {
            (Some(p), _) if p > Decimal::ZERO => p,
            (_, TradeEventKind::Sl) => pos.stop_price,
            _ => trigger_price,
        }
    }

    /// Reduce the position by a confirmed fill and compute realized P&L.
    pub fn apply_exit(
        &self,
        pos: &mut Position,
        kind: TradeEventKind,
        filled_qty: Decimal,
        fill_price: Decimal,
        atr: Option<Decimal>,
    ) -> ExitApplied {
        let closed_qty = filled_qty.min(pos.qty).max(Decimal::ZERO);
        let pnl = pos.side.pnl(pos.entry_price, fill_price, closed_qty);

        pos.qty -= closed_qty;
        pos.pending_exit = None;

        let closed = pos.qty <= Decimal::ZERO;
        if closed {
            pos.status = PositionStatus::Closed;
        } else if kind == TradeEventKind::Tp1 {
            pos.status = PositionStatus::Partial;
            // trail the remainder from the TP1 price
            self.adjust_stop(pos, fill_price, atr);
        }

        info!(
            key = %pos.key,
            kind = %kind,
            qty = %closed_qty,
            price = %fill_price,
            pnl = %pnl,
            remaining = %pos.qty,
            status = pos.status.as_str(),
            "exit filled"
        );

        ExitApplied {
            pnl,
            closed_qty,
            fill_price,
            closed,
        }
    }
}
