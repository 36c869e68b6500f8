use chrono::{DateTime, Utc};

use super::types::{EquitySample, PerformanceSummary, TradeRecord};

/// 24x365 trading, the default annualization basis.
pub const MINUTES_PER_YEAR: f64 = 525_600.0;

pub(crate) const EMPTY_SUMMARY: PerformanceSummary = PerformanceSummary {
    trades: 0,
    final_equity: 0.0,
    total_return: 0.0,
    win_rate: 0.0,
    profit_factor: 0.0,
    max_drawdown: 0.0,
    avg_drawdown: 0.0,
    sharpe: 0.0,
    sortino: 0.0,
    calmar: 0.0,
    avg_r_multiple: 0.0,
    expectancy: 0.0,
};

/// Sharpe/Sortino scaling from bar returns to annual: one year contains
/// `minutes_per_year / base_minutes` bars.
pub fn annualization_factor(base_minutes: u32, minutes_per_year: f64) -> f64 {
    (minutes_per_year / f64::from(base_minutes)).sqrt()
}

/// Running equity state: realized P&L accumulates on every fill, a sample is
/// appended at every bar close, and the peak never forgets.
#[derive(Debug)]
pub struct EquityTracker {
    initial_capital: f64,
    realized: f64,
    peak: f64,
    samples: Vec<EquitySample>,
}

impl EquityTracker {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            initial_capital,
            realized: initial_capital,
            peak: initial_capital,
            samples: Vec::new(),
        }
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    /// Realized equity: initial capital plus all realized P&L so far.
    pub fn realized_equity(&self) -> f64 {
        self.realized
    }

    pub fn add_realized(&mut self, pnl: f64) {
        self.realized += pnl;
    }

    pub fn total_equity(&self, unrealized: f64) -> f64 {
        self.realized + unrealized
    }

    /// Append the bar-close sample. Drawdown is the fractional decline of
    /// total equity from its running peak.
    pub fn record_bar(&mut self, timestamp: DateTime<Utc>, unrealized: f64) {
        let total = self.realized + unrealized;
        if total > self.peak {
            self.peak = total;
        }
        let drawdown = if self.peak > 0.0 {
            (self.peak - total) / self.peak
        } else {
            0.0
        };
        self.samples.push(EquitySample {
            timestamp,
            realized_equity: self.realized,
            unrealized_equity: unrealized,
            drawdown,
        });
    }

    pub fn samples(&self) -> &[EquitySample] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<EquitySample> {
        self.samples
    }
}

/// Derive the summary metrics over a completed run's equity log and closed
/// trades. `annualization` is the square-root factor from
/// [`annualization_factor`].
pub fn summarize(
    samples: &[EquitySample],
    trades: &[TradeRecord],
    initial_capital: f64,
    annualization: f64,
) -> PerformanceSummary {
    if initial_capital <= 0.0 {
        return EMPTY_SUMMARY;
    }

    let final_equity = samples
        .last()
        .map_or(initial_capital, |s| s.realized_equity + s.unrealized_equity);
    let total_return = (final_equity - initial_capital) / initial_capital;

    // Bar returns of total equity.
    let mut returns = Vec::with_capacity(samples.len());
    let mut prev = initial_capital;
    for sample in samples {
        let total = sample.realized_equity + sample.unrealized_equity;
        if prev > 0.0 {
            returns.push((total - prev) / prev);
        }
        prev = total;
    }

    let mean_return = mean(&returns);
    let std_return = std_dev(&returns);
    let sharpe = if std_return > 0.0 {
        mean_return / std_return * annualization
    } else {
        0.0
    };

    let negative: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    let downside = std_dev(&negative);
    let sortino = if downside > 0.0 {
        mean_return / downside * annualization
    } else {
        0.0
    };

    let max_drawdown = samples.iter().map(|s| s.drawdown).fold(0.0, f64::max);
    let in_drawdown: Vec<f64> = samples
        .iter()
        .map(|s| s.drawdown)
        .filter(|d| *d > 0.0)
        .collect();
    let avg_drawdown = mean(&in_drawdown);

    let calmar = if max_drawdown > 0.0 {
        total_return / max_drawdown
    } else {
        0.0
    };

    let tm = trade_metrics(trades);

    PerformanceSummary {
        trades: trades.len(),
        final_equity,
        total_return,
        win_rate: tm.win_rate,
        profit_factor: tm.profit_factor,
        max_drawdown,
        avg_drawdown,
        sharpe,
        sortino,
        calmar,
        avg_r_multiple: tm.avg_r_multiple,
        expectancy: tm.expectancy,
    }
}

struct TradeMetrics {
    win_rate: f64,
    profit_factor: f64,
    avg_r_multiple: f64,
    expectancy: f64,
}

fn trade_metrics(trades: &[TradeRecord]) -> TradeMetrics {
    if trades.is_empty() {
        return TradeMetrics {
            win_rate: 0.0,
            profit_factor: 0.0,
            avg_r_multiple: 0.0,
            expectancy: 0.0,
        };
    }

    let total = trades.len() as f64;
    let mut winner_count = 0usize;
    let mut loser_count = 0usize;
    let mut winner_sum = 0.0_f64;
    let mut loser_sum = 0.0_f64;
    let mut r_sum = 0.0_f64;

    for t in trades {
        r_sum += t.r_multiple;
        if t.realized_pnl > 0.0 {
            winner_count += 1;
            winner_sum += t.realized_pnl;
        } else if t.realized_pnl < 0.0 {
            loser_count += 1;
            loser_sum += t.realized_pnl;
        }
    }

    let win_rate = winner_count as f64 / total;

    let profit_factor = if loser_sum < 0.0 {
        winner_sum / loser_sum.abs()
    } else if winner_sum > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let avg_win = if winner_count > 0 {
        winner_sum / winner_count as f64
    } else {
        0.0
    };
    let avg_loss = if loser_count > 0 {
        loser_sum / loser_count as f64
    } else {
        0.0
    };

    TradeMetrics {
        win_rate,
        profit_factor,
        avg_r_multiple: r_sum / total,
        expectancy: win_rate * avg_win - (1.0 - win_rate) * avg_loss.abs(),
    }
}

fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

fn std_dev(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let m = mean(data);
    let variance = data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    variance.sqrt()
}
