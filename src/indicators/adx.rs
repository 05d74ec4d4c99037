//! Average Directional Index with Wilder smoothing.
//!
//! +DM/-DM and TR are summed over the first `period` bars, then
//! Wilder-smoothed. DX values are averaged over the next `period` bars to
//! seed ADX, after which ADX itself is Wilder-smoothed.

use super::atr::true_range;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    /// Waiting for the first bar
    Init,
    /// Summing the first `period` directional moves
    Accumulate,
    /// Averaging the first `period` DX values
    DxSeed,
    Warm,
}

#[derive(Debug, Clone)]
pub struct Adx {
    period: usize,
    phase: Phase,
    prev_high: f64,
    prev_low: f64,
    prev_close: f64,
    plus_dm: f64,
    minus_dm: f64,
    tr: f64,
    count: usize,
    dx_sum: f64,
    dx_count: usize,
    value: Option<f64>,
}

impl Adx {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            phase: Phase::Init,
            prev_high: 0.0,
            prev_low: 0.0,
            prev_close: 0.0,
            plus_dm: 0.0,
            minus_dm: 0.0,
            tr: 0.0,
            count: 0,
            dx_sum: 0.0,
            dx_count: 0,
            value: None,
        }
    }

    pub fn update(&mut self, high: f64, low: f64, close: f64) -> Option<f64> {
        if !high.is_finite() || !low.is_finite() || !close.is_finite() {
            return self.value;
        }

        if self.phase == Phase::Init {
            self.remember(high, low, close);
            self.phase = Phase::Accumulate;
            return None;
        }

        let (pdm, mdm, tr) = self.directional_move(high, low);
        let n = self.period as f64;

        match self.phase {
            Phase::Accumulate => {
                self.plus_dm += pdm;
                self.minus_dm += mdm;
                self.tr += tr;
                self.count += 1;
                if self.count >= self.period {
                    self.dx_sum = self.dx();
                    self.dx_count = 1;
                    self.phase = Phase::DxSeed;
                }
            }
            Phase::DxSeed => {
                self.smooth(pdm, mdm, tr, n);
                self.dx_sum += self.dx();
                self.dx_count += 1;
                if self.dx_count >= self.period {
                    self.value = Some(self.dx_sum / n);
                    self.phase = Phase::Warm;
                }
            }
            Phase::Warm => {
                self.smooth(pdm, mdm, tr, n);
                let dx = self.dx();
                self.value = self.value.map(|prev| (prev * (n - 1.0) + dx) / n);
            }
            Phase::Init => {}
        }

        self.remember(high, low, close);
        self.value
    }

    fn remember(&mut self, high: f64, low: f64, close: f64) {
        self.prev_high = high;
        self.prev_low = low;
        self.prev_close = close;
    }

    fn directional_move(&self, high: f64, low: f64) -> (f64, f64, f64) {
        let up = high - self.prev_high;
        let down = self.prev_low - low;
        let pdm = if up > down && up > 0.0 { up } else { 0.0 };
        let mdm = if down > up && down > 0.0 { down } else { 0.0 };
        (pdm, mdm, true_range(high, low, Some(self.prev_close)))
    }

    fn smooth(&mut self, pdm: f64, mdm: f64, tr: f64, n: f64) {
        self.plus_dm = self.plus_dm - self.plus_dm / n + pdm;
        self.minus_dm = self.minus_dm - self.minus_dm / n + mdm;
        self.tr = self.tr - self.tr / n + tr;
    }

    fn dx(&self) -> f64 {
        if self.tr <= 0.0 {
            return 0.0;
        }
        let plus_di = 100.0 * self.plus_dm / self.tr;
        let minus_di = 100.0 * self.minus_dm / self.tr;
        let sum = plus_di + minus_di;
        if sum <= 0.0 {
            0.0
        } else {
            100.0 * (plus_di - minus_di).abs() / sum
        }
    }
}
