//! Directional setups from indicator rows.
//!
//! A richer strategy sits above the Donchian breakout. The breakout is used
//! when the richer layer cannot be evaluated, or when it has produced no
//! signal at all over the last `fallback_window` rows.

use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, warn};

use crate::indicators::{IndicatorRow, TrendBias};
use crate::models::Side;

use super::config::{StrategyConfig, StrategyKind};

/// Resolved entry intent for one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setup {
    Richer { kind: StrategyKind, side: Side },
    DonchianFallback { side: Side },
    None,
}

impl Setup {
    pub fn side(&self) -> Option<Side> {
        match self {
            Setup::Richer { side, .. } | Setup::DonchianFallback { side } => Some(*side),
            Setup::None => None,
        }
    }

    pub fn source(&self) -> &'static str {
        match self {
            Setup::Richer { kind, .. } => kind.as_str(),
            Setup::DonchianFallback { .. } => "donchian_fallback",
            Setup::None => "none",
        }
    }
}

/// Outcome of the richer layer alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Richer {
    Unavailable,
    Flat,
    Long,
    Short,
    Conflict,
}

impl Richer {
    fn from_flags(long: bool, short: bool) -> Self {
        match (long, short) {
            (true, true) => Richer::Conflict,
            (true, false) => Richer::Long,
            (false, true) => Richer::Short,
            (false, false) => Richer::Flat,
        }
    }
}

/// Per-key signal resolver.
#[derive(Debug, Clone)]
pub struct SignalGenerator {
    config: StrategyConfig,
    fallback_window: usize,
    rows_since_richer: Option<usize>,
}

impl SignalGenerator {
    pub fn new(config: StrategyConfig, fallback_window: usize) -> Self {
        Self {
            config,
            fallback_window: fallback_window.max(1),
            rows_since_richer: None,
        }
    }

    /// Resolve the setup for `row`. Call once per new row, in order.
    pub fn evaluate(&mut self, row: &IndicatorRow, trend: Option<TrendBias>) -> Setup {
        let richer = self.richer(row, trend);

        self.rows_since_richer = match richer {
            Richer::Long | Richer::Short | Richer::Conflict => Some(0),
            _ => self.rows_since_richer.map(|n| n.saturating_add(1)),
        };
        let richer_active = self
            .rows_since_richer
            .is_some_and(|n| n < self.fallback_window);

        match richer {
            Richer::Long => Setup::Richer {
                kind: self.config.kind,
                side: Side::Long,
            },
            Richer::Short => Setup::Richer {
                kind: self.config.kind,
                side: Side::Short,
            },
            Richer::Conflict => {
                warn!(strategy = self.config.kind.as_str(), "long and short both true, ignoring row");
                Setup::None
            }
            Richer::Flat if richer_active => Setup::None,
            Richer::Flat | Richer::Unavailable => Self::fallback(row),
        }
    }

    fn fallback(row: &IndicatorRow) -> Setup {
        match (row.long_setup, row.short_setup) {
            (true, false) => Setup::DonchianFallback { side: Side::Long },
            (false, true) => Setup::DonchianFallback { side: Side::Short },
            (true, true) => {
                warn!("breakout above and below the channel on one bar, ignoring row");
                Setup::None
            }
            (false, false) => Setup::None,
        }
    }

    fn richer(&self, row: &IndicatorRow, trend: Option<TrendBias>) -> Richer {
        let cfg = &self.config;
        match cfg.kind {
            StrategyKind::BreakoutOnly => Richer::Unavailable,

            StrategyKind::DonchianAdxRsi => {
                let (Some(trend), Some(adx), Some(rsi), Some(_)) =
                    (trend, row.adx, row.rsi, row.channel)
                else {
                    debug!("donchian_adx_rsi inputs not warm");
                    return Richer::Unavailable;
                };
                let strong = adx >= cfg.adx_min;
                let long = row.long_setup && trend == TrendBias::Up && strong && rsi <= cfg.rsi_long_max;
                let short = row.short_setup
                    && trend == TrendBias::Down
                    && strong
                    && rsi >= 100.0 - cfg.rsi_short_min;
                Richer::from_flags(long, short)
            }

            StrategyKind::TurtleTrend => {
                let (Some(trend), Some(_)) = (trend, row.channel) else {
                    return Richer::Unavailable;
                };
                let strong = if cfg.turtle_use_adx {
                    match row.adx {
                        Some(adx) => adx >= cfg.adx_min,
                        None => return Richer::Unavailable,
                    }
                } else {
                    true
                };
                let long = row.long_setup && trend == TrendBias::Up && strong;
                let short = row.short_setup && trend == TrendBias::Down && strong;
                Richer::from_flags(long, short)
            }

            StrategyKind::EmaCrossAdx => {
                let (Some(fast), Some(slow), Some(pf), Some(ps), Some(adx)) = (
                    row.ema_fast,
                    row.ema_slow,
                    row.prev_ema_fast,
                    row.prev_ema_slow,
                    row.adx,
                ) else {
                    return Richer::Unavailable;
                };
                let close = row.close.to_f64().unwrap_or(f64::NAN);
                let strong = adx >= cfg.adx_min;
                let cross_up = pf <= ps && fast > slow;
                let cross_down = pf >= ps && fast < slow;
                Richer::from_flags(
                    cross_up && close > slow && strong,
                    cross_down && close < slow && strong,
                )
            }

            StrategyKind::MeanReversionRsi => {
                let (Some(trend), Some(rsi), Some(bands)) = (trend, row.rsi, row.bands) else {
                    return Richer::Unavailable;
                };
                // fade band excursions in the direction of the trend
                let close = row.close.to_f64().unwrap_or(f64::NAN);
                Richer::from_flags(
                    trend == TrendBias::Up && close < bands.lower && rsi <= cfg.mr_rsi_long_max,
                    trend == TrendBias::Down && close > bands.upper && rsi >= cfg.mr_rsi_short_min,
                )
            }

            StrategyKind::RsiTrendPullback => {
                let (Some(trend), Some(rsi), Some(fast)) = (trend, row.rsi, row.ema_fast) else {
                    return Richer::Unavailable;
                };
                let close = row.close.to_f64().unwrap_or(f64::NAN);
                let dip = close <= fast * (1.0 - cfg.pullback_pct);
                let spike = close >= fast * (1.0 + cfg.pullback_pct);
                Richer::from_flags(
                    trend == TrendBias::Up && dip && rsi <= cfg.pullback_rsi_long_max,
                    trend == TrendBias::Down && spike && rsi >= cfg.pullback_rsi_short_min,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{Bands, Channel};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn row(long: bool, short: bool) -> IndicatorRow {
        IndicatorRow {
            timestamp: Utc::now(),
            high: dec!(101),
            low: dec!(99),
            close: dec!(100),
            atr: Some(2.0),
            adx: Some(30.0),
            rsi: Some(55.0),
            channel: Some(Channel {
                upper: dec!(99),
                lower: dec!(90),
            }),
            ema_fast: Some(100.0),
            ema_slow: Some(99.0),
            prev_ema_fast: Some(99.0),
            prev_ema_slow: Some(99.5),
            bands: Some(Bands {
                upper: 104.0,
                middle: 100.0,
                lower: 96.0,
            }),
            long_setup: long,
            short_setup: short,
        }
    }

    fn generator(kind: StrategyKind) -> SignalGenerator {
        let cfg = StrategyConfig {
            kind,
            ..Default::default()
        };
        SignalGenerator::new(cfg, 10)
    }

    #[test]
    fn test_breakout_only_uses_fallback() {
        let mut sig = generator(StrategyKind::BreakoutOnly);
        assert_eq!(
            sig.evaluate(&row(true, false), None),
            Setup::DonchianFallback { side: Side::Long }
        );
        assert_eq!(
            sig.evaluate(&row(false, true), None),
            Setup::DonchianFallback { side: Side::Short }
        );
        assert_eq!(sig.evaluate(&row(false, false), None), Setup::None);
    }

    #[test]
    fn test_conflicting_fallback_is_none() {
        let mut sig = generator(StrategyKind::BreakoutOnly);
        assert_eq!(sig.evaluate(&row(true, true), None), Setup::None);
    }

    #[test]
    fn test_missing_trend_falls_back() {
        let mut sig = generator(StrategyKind::DonchianAdxRsi);
        assert_eq!(
            sig.evaluate(&row(true, false), None),
            Setup::DonchianFallback { side: Side::Long }
        );
    }

    #[test]
    fn test_richer_signal_wins() {
        let mut sig = generator(StrategyKind::DonchianAdxRsi);
        assert_eq!(
            sig.evaluate(&row(true, false), Some(TrendBias::Up)),
            Setup::Richer {
                kind: StrategyKind::DonchianAdxRsi,
                side: Side::Long
            }
        );
    }

    #[test]
    fn test_recent_richer_signal_suppresses_fallback() {
        let mut sig = generator(StrategyKind::DonchianAdxRsi);
        sig.evaluate(&row(true, false), Some(TrendBias::Up));
        // breakout against the trend: richer layer says no, and it fired recently
        assert_eq!(sig.evaluate(&row(true, false), Some(TrendBias::Down)), Setup::None);
    }

    #[test]
    fn test_silent_richer_layer_falls_back() {
        let mut sig = generator(StrategyKind::DonchianAdxRsi);
        assert_eq!(
            sig.evaluate(&row(true, false), Some(TrendBias::Down)),
            Setup::DonchianFallback { side: Side::Long }
        );
    }

    #[test]
    fn test_ema_cross_up() {
        let mut sig = generator(StrategyKind::EmaCrossAdx);
        // prev fast 99 <= prev slow 99.5, now fast 100 > slow 99, close 100 > 99
        assert_eq!(
            sig.evaluate(&row(false, false), None),
            Setup::Richer {
                kind: StrategyKind::EmaCrossAdx,
                side: Side::Long
            }
        );
    }

    #[test]
    fn test_short_rsi_gate_mirrors_long() {
        let mut sig = generator(StrategyKind::DonchianAdxRsi);
        // default rsi_short_min 30 means shorts need RSI >= 70
        assert_eq!(
            sig.evaluate(&row(false, true), Some(TrendBias::Down)),
            Setup::DonchianFallback { side: Side::Short }
        );

        let mut sig = generator(StrategyKind::DonchianAdxRsi);
        let hot = IndicatorRow {
            rsi: Some(75.0),
            ..row(false, true)
        };
        assert_eq!(
            sig.evaluate(&hot, Some(TrendBias::Down)),
            Setup::Richer {
                kind: StrategyKind::DonchianAdxRsi,
                side: Side::Short
            }
        );
    }

    #[test]
    fn test_mean_reversion_fades_band_excursions() {
        let mut sig = generator(StrategyKind::MeanReversionRsi);
        let dip = IndicatorRow {
            close: dec!(95),
            rsi: Some(30.0),
            ..row(false, false)
        };
        assert_eq!(
            sig.evaluate(&dip, Some(TrendBias::Up)),
            Setup::Richer {
                kind: StrategyKind::MeanReversionRsi,
                side: Side::Long
            }
        );

        let spike = IndicatorRow {
            close: dec!(105),
            rsi: Some(70.0),
            ..row(false, false)
        };
        assert_eq!(
            sig.evaluate(&spike, Some(TrendBias::Down)),
            Setup::Richer {
                kind: StrategyKind::MeanReversionRsi,
                side: Side::Short
            }
        );
    }

    #[test]
    fn test_mean_reversion_needs_trend_and_rsi() {
        let mut sig = generator(StrategyKind::MeanReversionRsi);
        let dip = IndicatorRow {
            close: dec!(95),
            rsi: Some(30.0),
            ..row(false, false)
        };
        // below the band but against the trend
        assert_eq!(sig.evaluate(&dip, Some(TrendBias::Down)), Setup::None);

        let mild = IndicatorRow {
            rsi: Some(50.0),
            ..dip.clone()
        };
        assert_eq!(sig.evaluate(&mild, Some(TrendBias::Up)), Setup::None);

        // no bands yet: breakout fallback
        let cold = IndicatorRow {
            bands: None,
            ..row(true, false)
        };
        assert_eq!(
            sig.evaluate(&cold, Some(TrendBias::Up)),
            Setup::DonchianFallback { side: Side::Long }
        );
    }

    #[test]
    fn test_pullback_to_fast_ema() {
        let mut sig = generator(StrategyKind::RsiTrendPullback);
        // fast EMA 100, pullback 1%: long at or below 99
        let dip = IndicatorRow {
            close: dec!(98.5),
            rsi: Some(40.0),
            ..row(false, false)
        };
        assert_eq!(
            sig.evaluate(&dip, Some(TrendBias::Up)),
            Setup::Richer {
                kind: StrategyKind::RsiTrendPullback,
                side: Side::Long
            }
        );

        let shallow = IndicatorRow {
            close: dec!(99.5),
            ..dip.clone()
        };
        assert_eq!(sig.evaluate(&shallow, Some(TrendBias::Up)), Setup::None);

        let spike = IndicatorRow {
            close: dec!(101.5),
            rsi: Some(60.0),
            ..row(false, false)
        };
        assert_eq!(
            sig.evaluate(&spike, Some(TrendBias::Down)),
            Setup::Richer {
                kind: StrategyKind::RsiTrendPullback,
                side: Side::Short
            }
        );
    }
}
