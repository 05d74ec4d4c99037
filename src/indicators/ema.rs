/// Exponential moving average, `alpha = 2 / (span + 1)`, seeded with the
/// first close. Reports a value only after `span` samples.
#[derive(Debug, Clone)]
pub struct Ema {
    span: usize,
    alpha: f64,
    current: Option<f64>,
    count: usize,
}

impl Ema {
    pub fn new(span: usize) -> Self {
        let span = span.max(1);
        Self {
            span,
            alpha: 2.0 / (span as f64 + 1.0),
            current: None,
            count: 0,
        }
    }

    pub fn update(&mut self, value: f64) -> Option<f64> {
        if !value.is_finite() {
            return self.value();
        }
        self.current = Some(match self.current {
            Some(prev) => prev + self.alpha * (value - prev),
            None => value,
        });
        self.count += 1;
        self.value()
    }

    pub fn value(&self) -> Option<f64> {
        if self.count >= self.span {
            self.current
        } else {
            None
        }
    }
}
