//! Risk-based position sizing.
//!
//! Quantity is the smallest of three caps:
//!   risk:     equity * risk_per_trade / R
//!   exposure: equity * max_position_pct / entry
//!   budget:   remaining_notional / entry
//! then floored to the exchange step and checked against exchange minimums.

use rust_decimal::Decimal;

use crate::error::{SkipReason, TradingError};
use crate::models::ExchangeLimits;

use super::RiskConfig;

/// Inputs for one sizing decision.
#[derive(Debug, Clone)]
pub struct SizingInput<'a> {
    pub equity: Decimal,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    /// Notional still available under the account-wide exposure budget
    pub remaining_notional: Decimal,
    pub limits: &'a ExchangeLimits,
}

/// Pure calculator: no I/O, no state beyond its config.
#[derive(Debug, Clone)]
pub struct RiskSizer {
    config: RiskConfig,
}

impl RiskSizer {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Final order quantity, or why there is none.
    ///
    /// `Err(InvalidRisk)` when entry and stop coincide (or the price is not
    /// positive); `Err(SizeTooSmall)` when the result cannot be traded.
    pub fn size(&self, input: &SizingInput<'_>) -> Result<Decimal, TradingError> {
        let r = (input.entry_price - input.stop_price).abs();
        if r <= Decimal::ZERO || input.entry_price <= Decimal::ZERO {
            return Err(TradingError::InvalidRisk {
                entry: input.entry_price,
                stop: input.stop_price,
            });
        }

        let equity = input.equity.max(Decimal::ZERO);
        let qty_risk = equity * self.config.risk_per_trade / r;

        let qty = self.apply_constraints(qty_risk, equity, input)?;
        let qty = input.limits.quantize_down(qty);

        if input.limits.below_min_qty(qty) {
            return Err(TradingError::SizeTooSmall(SkipReason::BelowMinQty));
        }
        if input.limits.below_min_notional(qty, input.entry_price) {
            return Err(TradingError::SizeTooSmall(SkipReason::BelowMinNotional));
        }
        if qty <= Decimal::ZERO {
            return Err(TradingError::SizeTooSmall(SkipReason::ZeroQuantity));
        }
        Ok(qty)
    }

    /// Like [`size`](Self::size) but collapses every skip and error to zero.
    #[cfg(test)]
    pub fn quantity(&self, input: &SizingInput<'_>) -> Decimal {
        self.size(input).unwrap_or(Decimal::ZERO)
    }

    fn apply_constraints(
        &self,
        qty_risk: Decimal,
        equity: Decimal,
        input: &SizingInput<'_>,
    ) -> Result<Decimal, TradingError> {
        let entry = input.entry_price;

        // Per-key exposure cap
        let qty_exposure = equity * self.config.max_position_pct / entry;

        // Account-wide budget
        let remaining = input.remaining_notional.max(Decimal::ZERO);
        if remaining.is_zero() {
            return Err(TradingError::SizeTooSmall(SkipReason::NoBudget));
        }
        let qty_budget = remaining / entry;

        Ok(qty_risk.min(qty_exposure).min(qty_budget))
    }
}
