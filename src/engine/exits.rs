use crate::data::frame::Bar;

use super::position::Position;
use super::types::{CloseReason, Side};

const SIZE_EPSILON: f64 = 1e-12;

/// A partial-exit rung spanned by the bar's range, to be filled at its
/// trigger price.
#[derive(Debug, Clone, Copy)]
pub struct RungFill {
    pub rung_index: usize,
    pub price: f64,
    pub size: f64,
}

/// What one bar does to one open position. At most one of the trigger
/// families fires per bar; the stop always wins a tie.
#[derive(Debug, Clone, Default)]
pub struct ExitEvaluation {
    pub rung_fills: Vec<RungFill>,
    pub close: Option<(CloseReason, f64)>,
}

impl ExitEvaluation {
    pub fn is_empty(&self) -> bool {
        self.rung_fills.is_empty() && self.close.is_none()
    }
}

/// Evaluate the fixed per-bar exit order for an open position:
///
/// 1. stop-loss, against the pessimistic extreme of the bar;
/// 2. partial-exit rungs in ascending r-multiple order (several may fire);
/// 3. take-profit;
/// 4. time exit at the bar close.
///
/// The strategy's own exit hook is the engine's business and runs only when
/// nothing here fired. A bar that gaps through the stop still fills at the
/// stop price.
pub fn evaluate(position: &Position, bar: &Bar) -> ExitEvaluation {
    let mut eval = ExitEvaluation::default();

    if let Some(stop) = position.stop_loss {
        let hit = match position.side {
            Side::Long => bar.low <= stop,
            Side::Short => bar.high >= stop,
        };
        if hit {
            eval.close = Some((CloseReason::StopLoss, stop));
            return eval;
        }
    }

    let mut remaining = position.remaining_size;
    let mut last_trigger = None;
    for (i, rung) in position.rungs.iter().enumerate() {
        if position.rungs_fired[i] {
            continue;
        }
        let trigger = position.rung_trigger(rung);
        let spanned = match position.side {
            Side::Long => bar.high >= trigger,
            Side::Short => bar.low <= trigger,
        };
        if !spanned {
            break;
        }
        let size = (rung.fraction * position.initial_size).min(remaining);
        if size <= SIZE_EPSILON {
            continue;
        }
        remaining -= size;
        last_trigger = Some(trigger);
        eval.rung_fills.push(RungFill {
            rung_index: i,
            price: trigger,
            size,
        });
    }
    if let Some(trigger) = last_trigger {
        if remaining <= SIZE_EPSILON {
            // The ladder consumed the full size.
            eval.close = Some((CloseReason::PartialExit, trigger));
        }
        return eval;
    }

    if let Some(tp) = position.take_profit {
        let hit = match position.side {
            Side::Long => bar.high >= tp,
            Side::Short => bar.low <= tp,
        };
        if hit {
            eval.close = Some((CloseReason::TakeProfit, tp));
            return eval;
        }
    }

    if let Some(max_bars) = position.max_hold_bars {
        if position.bars_held >= max_bars {
            eval.close = Some((CloseReason::TimeExit, bar.close));
        }
    }

    eval
}
