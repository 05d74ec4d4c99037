//! Average True Range with Wilder smoothing.

/// Incremental ATR. Seeds with the mean of the first `period` true ranges,
/// then applies `ATR = (prev * (N - 1) + TR) / N`.
#[derive(Debug, Clone)]
pub struct Atr {
    period: usize,
    prev_close: Option<f64>,
    sum: f64,
    count: usize,
    value: Option<f64>,
}

impl Atr {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            sum: 0.0,
            count: 0,
            value: None,
        }
    }

    /// Feed one bar; returns the ATR once `period` true ranges are seen.
    pub fn update(&mut self, high: f64, low: f64, close: f64) -> Option<f64> {
        if !high.is_finite() || !low.is_finite() || !close.is_finite() {
            return self.value;
        }

        let tr = true_range(high, low, self.prev_close);
        self.prev_close = Some(close);

        match self.value {
            Some(prev) => {
                let n = self.period as f64;
                self.value = Some((prev * (n - 1.0) + tr) / n);
            }
            None => {
                self.sum += tr;
                self.count += 1;
                if self.count >= self.period {
                    self.value = Some(self.sum / self.period as f64);
                }
            }
        }
        self.value
    }
}

/// True range; the first bar has no previous close and uses `high - low`.
pub fn true_range(high: f64, low: f64, prev_close: Option<f64>) -> f64 {
    match prev_close {
        Some(pc) => (high - low).max((high - pc).abs()).max((low - pc).abs()),
        None => high - low,
    }
}
