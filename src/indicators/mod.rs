//! Incremental indicator engines over ordered bar series.
//!
//! An [`IndicatorEngine`] owns one (symbol, timeframe) series. Bars are fed
//! in timestamp order; anything at or before the last seen timestamp is
//! ignored, so re-fetching overlapping windows is harmless.

mod adx;
mod atr;
mod bollinger;
mod donchian;
mod ema;
mod rsi;

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::models::Bar;

pub use adx::Adx;
pub use atr::Atr;
pub use bollinger::{Bands, Bollinger};
pub use donchian::{Channel, Donchian};
pub use ema::Ema;
pub use rsi::Rsi;

/// Lookbacks for the lower-timeframe indicator set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorParams {
    pub atr_period: usize,
    pub adx_period: usize,
    pub rsi_period: usize,
    pub donchian_len: usize,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub bb_len: usize,
    /// Band width in standard deviations
    pub bb_k: f64,
    /// Bars retained for inspection
    pub history: usize,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            atr_period: 14,
            adx_period: 14,
            rsi_period: 14,
            donchian_len: 20,
            ema_fast: 20,
            ema_slow: 50,
            bb_len: 20,
            bb_k: 2.0,
            history: 600,
        }
    }
}

/// Indicator values as of one closed bar.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorRow {
    pub timestamp: DateTime<Utc>,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub atr: Option<f64>,
    pub adx: Option<f64>,
    pub rsi: Option<f64>,
    /// Channel of the bars before this one
    pub channel: Option<Channel>,
    pub ema_fast: Option<f64>,
    pub ema_slow: Option<f64>,
    pub prev_ema_fast: Option<f64>,
    pub prev_ema_slow: Option<f64>,
    pub bands: Option<Bands>,
    /// Close above the prior channel high
    pub long_setup: bool,
    /// Close below the prior channel low
    pub short_setup: bool,
}

impl IndicatorRow {
    /// ATR as a decimal, only when it is finite and strictly positive.
    pub fn atr_decimal(&self) -> Option<Decimal> {
        self.atr
            .filter(|v| v.is_finite() && *v > 0.0)
            .and_then(Decimal::from_f64)
            .map(|d| d.round_dp(10))
            .filter(|d| *d > Decimal::ZERO)
    }
}

#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    params: IndicatorParams,
    atr: Atr,
    adx: Adx,
    rsi: Rsi,
    donchian: Donchian,
    ema_fast: Ema,
    ema_slow: Ema,
    bollinger: Bollinger,
    history: VecDeque<Bar>,
    latest: Option<IndicatorRow>,
}

impl IndicatorEngine {
    pub fn new(params: IndicatorParams) -> Self {
        Self {
            params,
            atr: Atr::new(params.atr_period),
            adx: Adx::new(params.adx_period),
            rsi: Rsi::new(params.rsi_period),
            donchian: Donchian::new(params.donchian_len),
            ema_fast: Ema::new(params.ema_fast),
            ema_slow: Ema::new(params.ema_slow),
            bollinger: Bollinger::new(params.bb_len, params.bb_k),
            history: VecDeque::with_capacity(params.history.max(1)),
            latest: None,
        }
    }

    /// Feed one closed bar. Returns the new row, or `None` if the bar is not
    /// newer than the last one seen.
    pub fn push(&mut self, bar: Bar) -> Option<&IndicatorRow> {
        if let Some(last) = self.last_timestamp() {
            if bar.timestamp <= last {
                return None;
            }
        }

        let high = bar.high.to_f64().unwrap_or(f64::NAN);
        let low = bar.low.to_f64().unwrap_or(f64::NAN);
        let close = bar.close.to_f64().unwrap_or(f64::NAN);

        let prev_ema_fast = self.ema_fast.value();
        let prev_ema_slow = self.ema_slow.value();

        let channel = self.donchian.update(bar.high, bar.low);
        let (long_setup, short_setup) = match channel {
            Some(ch) => (bar.close > ch.upper, bar.close < ch.lower),
            None => (false, false),
        };

        let row = IndicatorRow {
            timestamp: bar.timestamp,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            atr: self.atr.update(high, low, close),
            adx: self.adx.update(high, low, close),
            rsi: self.rsi.update(close),
            channel,
            ema_fast: self.ema_fast.update(close),
            ema_slow: self.ema_slow.update(close),
            prev_ema_fast,
            prev_ema_slow,
            bands: self.bollinger.update(close),
            long_setup,
            short_setup,
        };

        if self.history.len() >= self.params.history.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(bar);
        self.latest = Some(row);
        self.latest.as_ref()
    }

    /// Feed a batch in any order; returns how many bars were new.
    #[cfg(test)]
    pub fn ingest(&mut self, bars: impl IntoIterator<Item = Bar>) -> usize {
        let mut bars: Vec<Bar> = bars.into_iter().collect();
        bars.sort_by_key(|b| b.timestamp);
        bars.into_iter()
            .filter_map(|bar| self.push(bar).map(|_| ()))
            .count()
    }

    pub fn latest(&self) -> Option<&IndicatorRow> {
        self.latest.as_ref()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.history.back().map(|b| b.timestamp)
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

/// Direction of the higher-timeframe trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendBias {
    Up,
    Down,
    Flat,
}

/// Close versus a long EMA on the higher timeframe.
#[derive(Debug, Clone)]
pub struct TrendFilter {
    ema: Ema,
    last_timestamp: Option<DateTime<Utc>>,
    last_close: Option<f64>,
}

impl TrendFilter {
    pub fn new(span: usize) -> Self {
        Self {
            ema: Ema::new(span),
            last_timestamp: None,
            last_close: None,
        }
    }

    pub fn ingest(&mut self, bars: impl IntoIterator<Item = Bar>) -> usize {
        let mut bars: Vec<Bar> = bars.into_iter().collect();
        bars.sort_by_key(|b| b.timestamp);
        let mut added = 0;
        for bar in bars {
            if self.last_timestamp.is_some_and(|last| bar.timestamp <= last) {
                continue;
            }
            let close = bar.close.to_f64().unwrap_or(f64::NAN);
            self.ema.update(close);
            self.last_timestamp = Some(bar.timestamp);
            self.last_close = Some(close);
            added += 1;
        }
        added
    }

    /// `None` until the EMA is warm.
    pub fn bias(&self) -> Option<TrendBias> {
        let ema = self.ema.value()?;
        let close = self.last_close?;
        Some(if close > ema {
            TrendBias::Up
        } else if close < ema {
            TrendBias::Down
        } else {
            TrendBias::Flat
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::bars_from_closes;
    use super::*;
    use rust_decimal_macros::dec;

    fn small_params() -> IndicatorParams {
        IndicatorParams {
            atr_period: 3,
            adx_period: 3,
            rsi_period: 3,
            donchian_len: 3,
            ema_fast: 2,
            ema_slow: 4,
            bb_len: 3,
            bb_k: 2.0,
            history: 50,
        }
    }

    #[test]
    fn test_breakout_sets_long_setup() {
        let mut engine = IndicatorEngine::new(small_params());
        let closes = [dec!(100), dec!(100), dec!(100), dec!(105)];
        engine.ingest(bars_from_closes(&closes));
        let row = engine.latest().unwrap();
        // prior highs are 101, close 105 breaks out
        assert!(row.long_setup);
        assert!(!row.short_setup);
        assert_eq!(row.channel.unwrap().upper, dec!(101));
    }

    #[test]
    fn test_insufficient_history_has_no_setup() {
        let mut engine = IndicatorEngine::new(small_params());
        engine.ingest(bars_from_closes(&[dec!(100), dec!(200)]));
        let row = engine.latest().unwrap();
        assert!(row.channel.is_none());
        assert!(!row.long_setup && !row.short_setup);
        assert!(row.atr_decimal().is_none());
    }

    #[test]
    fn test_duplicate_bars_are_ignored() {
        let mut engine = IndicatorEngine::new(small_params());
        let bars = bars_from_closes(&[dec!(100), dec!(101), dec!(102)]);
        assert_eq!(engine.ingest(bars.clone()), 3);
        assert_eq!(engine.ingest(bars), 0);
        assert_eq!(engine.len(), 3);
    }

    #[test]
    fn test_atr_available_after_warmup() {
        let mut engine = IndicatorEngine::new(small_params());
        engine.ingest(bars_from_closes(&[dec!(100), dec!(100), dec!(100)]));
        assert_eq!(engine.latest().unwrap().atr_decimal(), Some(dec!(2)));
    }

    #[test]
    fn test_bands_follow_closes() {
        let mut engine = IndicatorEngine::new(small_params());
        engine.ingest(bars_from_closes(&[dec!(100), dec!(100)]));
        assert!(engine.latest().unwrap().bands.is_none());
        engine.ingest(bars_from_closes(&[dec!(100), dec!(100), dec!(100)]));
        let bands = engine.latest().unwrap().bands.unwrap();
        assert_eq!(bands.middle, 100.0);
        assert_eq!(bands.lower, 100.0);
    }

    #[test]
    fn test_trend_filter_bias() {
        let mut filter = TrendFilter::new(3);
        filter.ingest(bars_from_closes(&[dec!(100), dec!(100)]));
        assert_eq!(filter.bias(), None);
        filter.ingest(bars_from_closes(&[dec!(100), dec!(100), dec!(100), dec!(90)]));
        assert_eq!(filter.bias(), Some(TrendBias::Down));
    }
}
