//! Performance statistics over the trade ledger and equity curve.

use std::collections::HashMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::{EquityPoint, PositionKey, TradeEvent, TradeEventKind};

use super::LedgerReport;

pub struct ReportCalculator;

impl ReportCalculator {
    /// Build a report from ledger rows in write order.
    pub fn calculate(trades: &[TradeEvent], curve: &[EquityPoint]) -> LedgerReport {
        let mut report = LedgerReport::default();

        for event in trades {
            match event.kind {
                TradeEventKind::Enter => report.entries += 1,
                TradeEventKind::Tp1 => report.tp1_exits += 1,
                TradeEventKind::Tp2 => report.tp2_exits += 1,
                TradeEventKind::Sl => report.sl_exits += 1,
                TradeEventKind::Time => report.time_exits += 1,
            }
        }

        let exit_pnls: Vec<Decimal> = trades
            .iter()
            .filter(|t| t.kind.is_exit())
            .filter_map(|t| t.pnl)
            .collect();

        if !exit_pnls.is_empty() {
            Self::calculate_pnl_metrics(&mut report, &exit_pnls);
            Self::calculate_sharpe_sortino(&mut report, &exit_pnls);
        }

        Self::calculate_round_trips(&mut report, trades);
        Self::calculate_drawdown(&mut report, curve);

        report.first_trade = trades.first().map(|t| t.time);
        report.last_trade = trades.last().map(|t| t.time);
        report.final_equity = curve.last().map(|p| p.equity);
        report
    }

    fn calculate_pnl_metrics(report: &mut LedgerReport, pnls: &[Decimal]) {
        report.total_pnl = pnls.iter().copied().sum();
        report.avg_pnl = report.total_pnl / Decimal::from(pnls.len() as u64);

        let gross_profit: Decimal = pnls.iter().filter(|p| **p > Decimal::ZERO).copied().sum();
        let gross_loss: Decimal = pnls
            .iter()
            .filter(|p| **p < Decimal::ZERO)
            .map(|p| p.abs())
            .sum();

        report.gross_profit = gross_profit;
        report.gross_loss = gross_loss;
        if gross_loss > Decimal::ZERO {
            report.profit_factor =
                Some(gross_profit.to_f64().unwrap_or(0.0) / gross_loss.to_f64().unwrap_or(1.0));
        }
    }

    /// Group exits into round trips (ENTER until the entered quantity is
    /// fully closed) and count winners by net P&L.
    fn calculate_round_trips(report: &mut LedgerReport, trades: &[TradeEvent]) {
        struct Open {
            remaining: Decimal,
            pnl: Decimal,
        }

        let mut open: HashMap<PositionKey, Open> = HashMap::new();
        let mut results: Vec<Decimal> = Vec::new();

        for event in trades {
            let key = event.key();
            if event.kind == TradeEventKind::Enter {
                open.insert(
                    key,
                    Open {
                        remaining: event.qty,
                        pnl: Decimal::ZERO,
                    },
                );
                continue;
            }

            if let Some(trip) = open.get_mut(&key) {
                trip.remaining -= event.qty;
                trip.pnl += event.pnl.unwrap_or_default();
                if trip.remaining <= Decimal::ZERO {
                    results.push(trip.pnl);
                    open.remove(&key);
                }
            }
        }

        report.round_trips = results.len() as u32;
        report.open_round_trips = open.len() as u32;
        report.winning_trips = results.iter().filter(|p| **p > Decimal::ZERO).count() as u32;
        report.losing_trips = results.iter().filter(|p| **p < Decimal::ZERO).count() as u32;
        if !results.is_empty() {
            report.win_rate = report.winning_trips as f64 / results.len() as f64;
        }
    }

    fn calculate_drawdown(report: &mut LedgerReport, curve: &[EquityPoint]) {
        let mut peak: Option<Decimal> = None;
        let mut max_dd = Decimal::ZERO;
        let mut max_dd_pct = 0.0f64;

        for point in curve {
            let top = match peak {
                Some(p) if p >= point.equity => p,
                _ => {
                    peak = Some(point.equity);
                    point.equity
                }
            };

            let dd = top - point.equity;
            if dd > max_dd {
                max_dd = dd;
            }
            if top > Decimal::ZERO {
                let dd_pct = dd.to_f64().unwrap_or(0.0) / top.to_f64().unwrap_or(1.0);
                if dd_pct > max_dd_pct {
                    max_dd_pct = dd_pct;
                }
            }
        }

        report.max_drawdown = max_dd;
        report.max_drawdown_pct = max_dd_pct;
        report.peak_equity = peak;
    }

    /// Per-exit ratios, not annualized.
    fn calculate_sharpe_sortino(report: &mut LedgerReport, pnls: &[Decimal]) {
        if pnls.len() < 2 {
            return;
        }

        let returns: Vec<f64> = pnls.iter().filter_map(|p| p.to_f64()).collect();
        if returns.len() < 2 {
            return;
        }

        let mean = returns.iter().mean();
        let std_dev = returns.iter().std_dev();
        if std_dev > 0.0 {
            report.sharpe = Some(mean / std_dev);
        }

        let negative: Vec<f64> = returns.iter().filter(|r| **r < 0.0).copied().collect();
        if negative.len() >= 2 {
            let downside = negative.iter().std_dev();
            if downside > 0.0 {
                report.sortino = Some(mean / downside);
            }
        }
    }
}
