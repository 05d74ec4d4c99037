//! Donchian channel over the bars *before* the current one.

use std::collections::VecDeque;

use rust_decimal::Decimal;

/// Upper and lower bound of the prior `len` bars.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Channel {
    pub upper: Decimal,
    pub lower: Decimal,
}

#[derive(Debug, Clone)]
pub struct Donchian {
    len: usize,
    window: VecDeque<(Decimal, Decimal)>,
}

impl Donchian {
    pub fn new(len: usize) -> Self {
        let len = len.max(1);
        Self {
            len,
            window: VecDeque::with_capacity(len),
        }
    }

    /// Channel from prior bars, then absorb the current bar.
    ///
    /// Returns `None` until `len` prior bars are available.
    pub fn update(&mut self, high: Decimal, low: Decimal) -> Option<Channel> {
        let channel = self.channel();
        if self.window.len() == self.len {
            self.window.pop_front();
        }
        self.window.push_back((high, low));
        channel
    }

    pub fn channel(&self) -> Option<Channel> {
        if self.window.len() < self.len {
            return None;
        }
        let upper = self.window.iter().map(|(h, _)| *h).max()?;
        let lower = self.window.iter().map(|(_, l)| *l).min()?;
        Some(Channel { upper, lower })
    }
}
