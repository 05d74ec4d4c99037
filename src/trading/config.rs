//! Risk, trade-management and strategy configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::TradingError;
use crate::indicators::IndicatorParams;

/// Position sizing limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Fraction of equity risked per entry (0.0 to 1.0]
    pub risk_per_trade: Decimal,

    /// Max notional per key as a fraction of equity (0.0 to 1.0]
    pub max_position_pct: Decimal,

    /// Max notional across all open keys as a fraction of equity
    pub max_total_exposure_pct: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade: dec!(0.03), // 3% of equity at risk
            max_position_pct: dec!(0.70), // 70% notional per key
            max_total_exposure_pct: dec!(1.0), // no leverage across keys
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<(), TradingError> {
        in_unit_interval("risk.risk_per_trade", self.risk_per_trade)?;
        in_unit_interval("risk.max_position_pct", self.max_position_pct)?;
        if self.max_total_exposure_pct <= Decimal::ZERO {
            return Err(invalid("risk.max_total_exposure_pct must be > 0"));
        }
        Ok(())
    }
}

/// Stop, target and expiry rules for an open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeManagerConfig {
    /// Stop distance in ATRs
    pub atr_k_sl: Decimal,

    /// First target in R
    pub tp1_r: Decimal,

    /// Second target in R
    pub tp2_r: Decimal,

    /// Fraction of the position closed at TP1
    pub tp1_close_pct: Decimal,

    /// Move the stop to entry after this many R in favor
    pub be_after_r: Option<Decimal>,

    /// ATR trail distance; `None` disables trailing
    pub trail_atr_k: Option<Decimal>,

    /// Trail only once TP1 has been taken
    pub trail_after_tp1: bool,

    /// Trail on every tick, TP1 or not
    pub trail_always: bool,

    /// Close regardless of price after this long
    pub time_exit_minutes: i64,
}

impl Default for TradeManagerConfig {
    fn default() -> Self {
        Self {
            atr_k_sl: dec!(1.5),
            tp1_r: dec!(1.0),
            tp2_r: dec!(2.0),
            tp1_close_pct: dec!(0.5), // Half off at TP1
            be_after_r: Some(dec!(0.8)),
            trail_atr_k: Some(dec!(1.2)),
            trail_after_tp1: true,
            trail_always: false,
            time_exit_minutes: 48,
        }
    }
}

impl TradeManagerConfig {
    pub fn validate(&self) -> Result<(), TradingError> {
        if self.atr_k_sl <= Decimal::ZERO {
            return Err(invalid("trade.atr_k_sl must be > 0"));
        }
        if self.tp1_r <= Decimal::ZERO {
            return Err(invalid("trade.tp1_r must be > 0"));
        }
        if self.tp2_r <= self.tp1_r {
            return Err(invalid("trade.tp2_r must be greater than trade.tp1_r"));
        }
        if self.tp1_close_pct <= Decimal::ZERO || self.tp1_close_pct >= Decimal::ONE {
            return Err(invalid("trade.tp1_close_pct must be in (0, 1)"));
        }
        if self.be_after_r.is_some_and(|r| r <= Decimal::ZERO) {
            return Err(invalid("trade.be_after_r must be > 0 when set"));
        }
        if self.trail_atr_k.is_some_and(|k| k <= Decimal::ZERO) {
            return Err(invalid("trade.trail_atr_k must be > 0 when set"));
        }
        if self.time_exit_minutes < 0 {
            return Err(invalid("trade.time_exit_minutes must not be negative"));
        }
        Ok(())
    }

    pub fn time_exit(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.time_exit_minutes)
    }
}

/// Which richer signal layer sits above the Donchian fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    DonchianAdxRsi,
    TurtleTrend,
    EmaCrossAdx,
    MeanReversionRsi,
    RsiTrendPullback,
    BreakoutOnly,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::DonchianAdxRsi => "donchian_adx_rsi",
            StrategyKind::TurtleTrend => "turtle_trend",
            StrategyKind::EmaCrossAdx => "ema_cross_adx",
            StrategyKind::MeanReversionRsi => "mean_reversion_rsi",
            StrategyKind::RsiTrendPullback => "rsi_trend_pullback",
            StrategyKind::BreakoutOnly => "breakout_only",
        }
    }

    /// Whether the strategy reads the higher-timeframe trend.
    pub fn needs_htf(&self) -> bool {
        matches!(
            self,
            StrategyKind::DonchianAdxRsi
                | StrategyKind::TurtleTrend
                | StrategyKind::MeanReversionRsi
                | StrategyKind::RsiTrendPullback
        )
    }
}

/// Indicator lookbacks and strategy thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub kind: StrategyKind,
    pub atr_period: usize,
    pub adx_period: usize,
    pub rsi_period: usize,
    pub donchian_len: usize,
    pub ema_fast: usize,
    pub ema_slow: usize,

    /// EMA span on the higher timeframe
    pub htf_ema_len: usize,

    pub adx_min: f64,

    /// `donchian_adx_rsi` longs need RSI at or below this
    pub rsi_long_max: f64,

    /// `donchian_adx_rsi` shorts need RSI at or above `100 - rsi_short_min`
    pub rsi_short_min: f64,

    /// Gate `turtle_trend` on ADX as well
    pub turtle_use_adx: bool,

    /// Bollinger window for `mean_reversion_rsi`
    pub bb_len: usize,

    /// Bollinger width in standard deviations
    pub bb_k: f64,

    pub mr_rsi_long_max: f64,
    pub mr_rsi_short_min: f64,

    /// Distance from the fast EMA that counts as a pullback, as a fraction
    pub pullback_pct: f64,

    pub pullback_rsi_long_max: f64,
    pub pullback_rsi_short_min: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: StrategyKind::DonchianAdxRsi,
            atr_period: 14,
            adx_period: 14,
            rsi_period: 14,
            donchian_len: 20,
            ema_fast: 20,
            ema_slow: 50,
            htf_ema_len: 200,
            adx_min: 20.0,
            rsi_long_max: 70.0,
            rsi_short_min: 30.0,
            turtle_use_adx: false,
            bb_len: 20,
            bb_k: 2.0,
            mr_rsi_long_max: 35.0,
            mr_rsi_short_min: 65.0,
            pullback_pct: 0.01,
            pullback_rsi_long_max: 45.0,
            pullback_rsi_short_min: 55.0,
        }
    }
}

impl StrategyConfig {
    pub fn validate(&self) -> Result<(), TradingError> {
        if self.atr_period == 0 {
            return Err(invalid("strategy.atr_period must be > 0"));
        }
        if self.adx_period == 0 || self.rsi_period == 0 {
            return Err(invalid("strategy.adx_period and strategy.rsi_period must be > 0"));
        }
        if self.donchian_len < 2 {
            return Err(invalid("strategy.donchian_len must be >= 2"));
        }
        if self.ema_fast == 0 || self.ema_fast >= self.ema_slow {
            return Err(invalid("strategy.ema_fast must be > 0 and below strategy.ema_slow"));
        }
        if self.htf_ema_len == 0 {
            return Err(invalid("strategy.htf_ema_len must be > 0"));
        }
        if self.bb_len < 2 || !self.bb_k.is_finite() || self.bb_k <= 0.0 {
            return Err(invalid("strategy.bb_len must be >= 2 and strategy.bb_k > 0"));
        }
        if !(0.0..1.0).contains(&self.pullback_pct) {
            return Err(invalid("strategy.pullback_pct must be in [0, 1)"));
        }
        Ok(())
    }

    pub fn indicator_params(&self, history: usize) -> IndicatorParams {
        IndicatorParams {
            atr_period: self.atr_period,
            adx_period: self.adx_period,
            rsi_period: self.rsi_period,
            donchian_len: self.donchian_len,
            ema_fast: self.ema_fast,
            ema_slow: self.ema_slow,
            bb_len: self.bb_len,
            bb_k: self.bb_k,
            history,
        }
    }
}

fn in_unit_interval(name: &str, value: Decimal) -> Result<(), TradingError> {
    if value <= Decimal::ZERO || value > Decimal::ONE {
        return Err(invalid(&format!("{} must be in (0, 1], got {}", name, value)));
    }
    Ok(())
}

fn invalid(msg: &str) -> TradingError {
    TradingError::ConfigInvalid(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        RiskConfig::default().validate().unwrap();
        TradeManagerConfig::default().validate().unwrap();
        StrategyConfig::default().validate().unwrap();
    }

    #[test]
    fn test_risk_bounds() {
        let mut cfg = RiskConfig::default();
        cfg.risk_per_trade = Decimal::ZERO;
        assert!(matches!(cfg.validate(), Err(TradingError::ConfigInvalid(_))));
        cfg.risk_per_trade = dec!(1.5);
        assert!(cfg.validate().is_err());
        cfg.risk_per_trade = Decimal::ONE;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_targets_must_be_ordered() {
        let cfg = TradeManagerConfig {
            tp1_r: dec!(2),
            tp2_r: dec!(1),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_tp1_fraction_excludes_full_close() {
        let cfg = TradeManagerConfig {
            tp1_close_pct: Decimal::ONE,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_strategy_names() {
        let cfg: StrategyConfig = toml::from_str("kind = \"rsi_trend_pullback\"").unwrap();
        assert_eq!(cfg.kind, StrategyKind::RsiTrendPullback);
        assert!(cfg.kind.needs_htf());
        assert_eq!(StrategyKind::MeanReversionRsi.as_str(), "mean_reversion_rsi");
        assert!(!StrategyKind::EmaCrossAdx.needs_htf());
    }

    #[test]
    fn test_band_and_pullback_bounds() {
        let cfg = StrategyConfig {
            bb_k: 0.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = StrategyConfig {
            pullback_pct: 1.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_donchian_window_minimum() {
        let cfg = StrategyConfig {
            donchian_len: 1,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
