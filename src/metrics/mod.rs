//! Ledger reporting.

mod calculator;

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

pub use calculator::ReportCalculator;

/// Summary of a ledger window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerReport {
    pub entries: u32,
    pub tp1_exits: u32,
    pub tp2_exits: u32,
    pub sl_exits: u32,
    pub time_exits: u32,

    /// Entries whose quantity has been fully closed
    pub round_trips: u32,
    pub open_round_trips: u32,
    pub winning_trips: u32,
    pub losing_trips: u32,
    pub win_rate: f64,

    pub total_pnl: Decimal,
    /// Mean realized P&L per exit event
    pub avg_pnl: Decimal,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    /// `None` when there are no losing exits
    pub profit_factor: Option<f64>,

    pub max_drawdown: Decimal,
    pub max_drawdown_pct: f64,
    pub peak_equity: Option<Decimal>,
    pub final_equity: Option<Decimal>,

    pub sharpe: Option<f64>,
    pub sortino: Option<f64>,

    pub first_trade: Option<DateTime<Utc>>,
    pub last_trade: Option<DateTime<Utc>>,
}

impl LedgerReport {
    pub fn exits(&self) -> u32 {
        self.tp1_exits + self.tp2_exits + self.sl_exits + self.time_exits
    }
}

fn ratio(value: Option<f64>) -> String {
    value.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "n/a".to_string())
}

impl fmt::Display for LedgerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Ledger Report ===")?;
        if let (Some(first), Some(last)) = (self.first_trade, self.last_trade) {
            writeln!(f, "Window:         {} .. {}", first.format("%Y-%m-%d %H:%M"), last.format("%Y-%m-%d %H:%M"))?;
        }

        writeln!(f, "\n--- Activity ---")?;
        writeln!(f, "Entries:        {}", self.entries)?;
        writeln!(f, "Exits:          {}", self.exits())?;
        writeln!(f, "  TP1:          {}", self.tp1_exits)?;
        writeln!(f, "  TP2:          {}", self.tp2_exits)?;
        writeln!(f, "  SL:           {}", self.sl_exits)?;
        writeln!(f, "  TIME:         {}", self.time_exits)?;
        writeln!(f, "Round Trips:    {} closed, {} open", self.round_trips, self.open_round_trips)?;

        writeln!(f, "\n--- Win/Loss ---")?;
        writeln!(f, "Win Rate:       {:.1}%", self.win_rate * 100.0)?;
        writeln!(f, "Winning Trips:  {}", self.winning_trips)?;
        writeln!(f, "Losing Trips:   {}", self.losing_trips)?;
        writeln!(f, "Total P&L:      ${:.2}", self.total_pnl)?;
        writeln!(f, "Avg P&L/Exit:   ${:.2}", self.avg_pnl)?;
        writeln!(f, "Profit Factor:  {}", ratio(self.profit_factor))?;

        writeln!(f, "\n--- Risk ---")?;
        writeln!(f, "Max Drawdown:   ${:.2} ({:.1}%)", self.max_drawdown, self.max_drawdown_pct * 100.0)?;
        if let Some(peak) = self.peak_equity {
            writeln!(f, "Peak Equity:    ${:.2}", peak)?;
        }
        if let Some(equity) = self.final_equity {
            writeln!(f, "Final Equity:   ${:.2}", equity)?;
        }
        writeln!(f, "Sharpe (exit):  {}", ratio(self.sharpe))?;
        write!(f, "Sortino (exit): {}", ratio(self.sortino))
    }
}
