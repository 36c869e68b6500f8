use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;

use super::error::EngineError;
use super::exits::ExitEvaluation;
use super::types::{CloseReason, PartialRung, RiskPolicy, Side, TradeRecord};

const SIZE_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Closed(CloseReason),
}

/// One execution against a position: a partial-exit rung, the final close,
/// or a force-close.
#[derive(Debug, Clone)]
pub struct Fill {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub size: f64,
    pub pnl: f64,
}

/// An open or closed position. The `PositionManager` is the sole mutator;
/// strategies only ever see a shared reference.
#[derive(Debug, Clone)]
pub struct Position {
    pub strategy: String,
    pub side: Side,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub initial_size: f64,
    pub remaining_size: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Account-currency amount at risk between entry and stop at open time.
    pub initial_risk: f64,
    /// `|entry - stop|` at open time; rung triggers are multiples of this.
    pub risk_points: f64,
    pub point_value: f64,
    /// Ascending by `r_multiple`; `rungs_fired` tracks which fired.
    pub rungs: Vec<PartialRung>,
    pub rungs_fired: Vec<bool>,
    pub max_hold_bars: Option<u32>,
    pub status: PositionStatus,
    pub close_time: Option<DateTime<Utc>>,
    pub realized_pnl: f64,
    pub fills: Vec<Fill>,
    /// Completed bars since entry; 0 on the entry bar itself.
    pub bars_held: u32,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Price at which a rung fires: `entry + r * risk_points` on the
    /// profitable side of entry.
    pub fn rung_trigger(&self, rung: &PartialRung) -> f64 {
        self.entry_price + self.side.multiplier() * rung.r_multiple * self.risk_points
    }

    /// Mark-to-market of the remaining size at `price`.
    pub fn unrealized(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.side.multiplier() * self.remaining_size * self.point_value
    }

    pub fn r_multiple(&self) -> f64 {
        self.realized_pnl / self.initial_risk
    }

    /// The trade-log record for a closed position.
    pub fn to_record(&self) -> Option<TradeRecord> {
        let PositionStatus::Closed(reason) = self.status else {
            return None;
        };
        let exit_time = self.close_time?;
        let exit_price = self.fills.last().map_or(self.entry_price, |f| f.price);
        Some(TradeRecord {
            strategy: self.strategy.clone(),
            side: self.side,
            entry_time: self.entry_time,
            entry_price: self.entry_price,
            exit_time,
            exit_price,
            initial_size: self.initial_size,
            initial_risk: self.initial_risk,
            realized_pnl: self.realized_pnl,
            r_multiple: self.r_multiple(),
            close_reason: reason,
            duration_bars: self.bars_held,
            duration_secs: (exit_time - self.entry_time).num_seconds(),
        })
    }

    fn fill(&mut self, price: f64, size: f64, timestamp: DateTime<Utc>) {
        let pnl = (price - self.entry_price) * self.side.multiplier() * size * self.point_value;
        self.remaining_size = (self.remaining_size - size).max(0.0);
        self.realized_pnl += pnl;
        self.fills.push(Fill {
            timestamp,
            price,
            size,
            pnl,
        });
    }
}

/// Request to open a position at the close of the signal bar. Stop and
/// target prices arrive already resolved (absolute override or derivation).
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub strategy: String,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: Option<f64>,
    pub rungs: Vec<PartialRung>,
    pub max_hold_bars: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened,
    /// Observable rejection, not an error: the account-wide risk budget had
    /// no room. The signal is dropped, never queued.
    RiskCapExceeded,
}

/// Owns every position of a run and is the only code that mutates one.
#[derive(Debug)]
pub struct PositionManager {
    policy: RiskPolicy,
    point_value: f64,
    positions: Vec<Position>,
    rejections: u64,
}

impl PositionManager {
    pub fn new(policy: RiskPolicy, point_value: f64) -> Self {
        Self {
            policy,
            point_value,
            positions: Vec::new(),
            rejections: 0,
        }
    }

    pub fn policy(&self) -> &RiskPolicy {
        &self.policy
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn rejections(&self) -> u64 {
        self.rejections
    }

    /// Capital that risk fractions apply to: initial capital when
    /// compounding is off, current total equity when on.
    pub fn effective_capital(&self, current_equity: f64) -> f64 {
        if self.policy.use_compounding {
            current_equity
        } else {
            self.policy.initial_capital
        }
    }

    /// Units to open so that being stopped out loses exactly `risk_amount`.
    pub fn position_size(
        entry: f64,
        stop: f64,
        risk_amount: f64,
        point_value: f64,
    ) -> Result<f64, EngineError> {
        let risk_in_points = (entry - stop).abs();
        if risk_in_points <= 0.0 || !risk_in_points.is_finite() {
            return Err(EngineError::InvalidStop {
                entry,
                detail: "stop-loss equals entry".to_string(),
            });
        }
        Ok(risk_amount / (risk_in_points * point_value))
    }

    pub fn open_risk_total(&self) -> f64 {
        self.positions
            .iter()
            .filter(|p| p.is_open())
            .map(|p| p.initial_risk)
            .sum()
    }

    /// Mark-to-market P&L over all open positions at `price`.
    pub fn unrealized_total(&self, price: f64) -> f64 {
        self.positions
            .iter()
            .filter(|p| p.is_open())
            .map(|p| p.unrealized(price))
            .sum()
    }

    /// Advance the bar counter on every open position. Called once at the
    /// start of each bar, before any evaluation.
    pub fn advance_bar(&mut self) {
        for p in &mut self.positions {
            if p.is_open() {
                p.bars_held += 1;
            }
        }
    }

    /// Atomically open a position or refuse: denial leaves no trace beyond
    /// the rejection counter.
    pub fn try_open(
        &mut self,
        req: OpenRequest,
        current_equity: f64,
    ) -> Result<OpenOutcome, EngineError> {
        let entry = req.entry_price;
        let wrong_side = match req.side {
            Side::Long => req.stop_loss >= entry,
            Side::Short => req.stop_loss <= entry,
        };
        if wrong_side {
            return Err(EngineError::InvalidStop {
                entry,
                detail: format!(
                    "stop {} is not on the losing side of a {} entry",
                    req.stop_loss, req.side
                ),
            });
        }

        let take_profit = req.take_profit.filter(|tp| {
            let valid = match req.side {
                Side::Long => *tp > entry,
                Side::Short => *tp < entry,
            };
            if !valid {
                tracing::warn!(
                    strategy = %req.strategy,
                    take_profit = tp,
                    entry,
                    "take-profit not on the profitable side of entry; ignored"
                );
            }
            valid
        });

        let fraction_sum: f64 = req.rungs.iter().map(|r| r.fraction).sum();
        if fraction_sum > 1.0 + 1e-9 || req.rungs.iter().any(|r| r.fraction <= 0.0) {
            return Err(EngineError::InvalidParameter {
                strategy: req.strategy,
                detail: format!("partial-exit fractions must be positive and sum to <= 1 (sum {fraction_sum})"),
            });
        }

        let k_eff = self.effective_capital(current_equity);
        let risk_amount = self.policy.per_trade_risk_fraction * k_eff;
        let size = Self::position_size(entry, req.stop_loss, risk_amount, self.point_value)?;

        let cap = self.policy.max_total_risk_fraction * k_eff;
        if self.open_risk_total() + risk_amount > cap * (1.0 + 1e-9) {
            self.rejections += 1;
            return Ok(OpenOutcome::RiskCapExceeded);
        }

        let mut rungs = req.rungs;
        rungs.sort_by_key(|r| OrderedFloat(r.r_multiple));
        let fired = vec![false; rungs.len()];

        self.positions.push(Position {
            strategy: req.strategy,
            side: req.side,
            entry_time: req.timestamp,
            entry_price: entry,
            initial_size: size,
            remaining_size: size,
            stop_loss: Some(req.stop_loss),
            take_profit,
            initial_risk: risk_amount,
            risk_points: (entry - req.stop_loss).abs(),
            point_value: self.point_value,
            rungs,
            rungs_fired: fired,
            max_hold_bars: req.max_hold_bars,
            status: PositionStatus::Open,
            close_time: None,
            realized_pnl: 0.0,
            fills: Vec::new(),
            bars_held: 0,
        });
        Ok(OpenOutcome::Opened)
    }

    /// Indices of open positions belonging to one strategy, in open order.
    pub fn open_indices_for(&self, strategy: &str) -> Vec<usize> {
        self.positions
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_open() && p.strategy == strategy)
            .map(|(i, _)| i)
            .collect()
    }

    /// Execute the outcome of a bar's exit evaluation against one position.
    /// Returns the realized P&L of the applied fills.
    pub fn apply_exits(
        &mut self,
        index: usize,
        eval: &ExitEvaluation,
        timestamp: DateTime<Utc>,
    ) -> f64 {
        let pos = &mut self.positions[index];
        let before = pos.realized_pnl;
        for rung_fill in &eval.rung_fills {
            pos.rungs_fired[rung_fill.rung_index] = true;
            pos.fill(rung_fill.price, rung_fill.size, timestamp);
        }
        if let Some((reason, price)) = eval.close {
            Self::finalize(pos, price, timestamp, reason);
        }
        pos.realized_pnl - before
    }

    /// Close the full remaining size at `price` (time, strategy, manual and
    /// end-of-data exits all land here). Returns the realized P&L of the
    /// closing fill.
    pub fn close_position(
        &mut self,
        index: usize,
        price: f64,
        timestamp: DateTime<Utc>,
        reason: CloseReason,
    ) -> f64 {
        let pos = &mut self.positions[index];
        let before = pos.realized_pnl;
        Self::finalize(pos, price, timestamp, reason);
        pos.realized_pnl - before
    }

    /// Force-close every open position at `price`. Returns the total
    /// realized P&L of the closing fills.
    pub fn force_close_all(
        &mut self,
        price: f64,
        timestamp: DateTime<Utc>,
        reason: CloseReason,
    ) -> f64 {
        let mut pnl = 0.0;
        for pos in &mut self.positions {
            if pos.is_open() {
                let before = pos.realized_pnl;
                Self::finalize(pos, price, timestamp, reason);
                pnl += pos.realized_pnl - before;
            }
        }
        pnl
    }

    /// Remove closed positions from the table and hand them to the caller.
    pub fn take_closed(&mut self) -> Vec<Position> {
        let mut closed = Vec::new();
        self.positions.retain(|p| {
            if p.is_open() {
                true
            } else {
                closed.push(p.clone());
                false
            }
        });
        closed
    }

    fn finalize(pos: &mut Position, price: f64, timestamp: DateTime<Utc>, reason: CloseReason) {
        if pos.remaining_size > SIZE_EPSILON {
            let size = pos.remaining_size;
            pos.fill(price, size, timestamp);
        }
        pos.remaining_size = 0.0;
        pos.status = PositionStatus::Closed(reason);
        pos.close_time = Some(timestamp);
    }
}
