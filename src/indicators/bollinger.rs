//! Bollinger bands over the last `len` closes, current bar included.

use std::collections::VecDeque;

use statrs::statistics::Statistics;

/// Rolling mean plus and minus `k` population standard deviations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

#[derive(Debug, Clone)]
pub struct Bollinger {
    len: usize,
    k: f64,
    window: VecDeque<f64>,
}

impl Bollinger {
    pub fn new(len: usize, k: f64) -> Self {
        let len = len.max(1);
        Self {
            len,
            k,
            window: VecDeque::with_capacity(len),
        }
    }

    /// Absorb `close` and return the bands once `len` closes are held.
    pub fn update(&mut self, close: f64) -> Option<Bands> {
        if close.is_finite() {
            if self.window.len() == self.len {
                self.window.pop_front();
            }
            self.window.push_back(close);
        }
        if self.window.len() < self.len {
            return None;
        }
        let middle = self.window.iter().mean();
        let width = self.k * self.window.iter().population_std_dev();
        Some(Bands {
            upper: middle + width,
            middle,
            lower: middle - width,
        })
    }
}
