use chrono::{DateTime, Utc};

use crate::strategies::Strategy;

use super::align::AlignedFrame;
use super::error::EngineError;
use super::exits;
use super::metrics::EquityTracker;
use super::position::{OpenOutcome, OpenRequest, PositionManager};
use super::types::{CancelToken, CloseReason, ExitPlan, Signal, StopRule, TargetRule, TradeRecord};

/// What the replay loop hands back to the orchestrator.
#[derive(Debug)]
pub struct LoopOutcome {
    pub trades: Vec<TradeRecord>,
    pub bars_processed: usize,
    pub cancelled: bool,
}

/// Stop/target prices and holding clock for a new position, after merging
/// the signal's absolute overrides with the strategy's derivation rules.
#[derive(Debug)]
struct ResolvedExits {
    stop_loss: f64,
    take_profit: Option<f64>,
    max_hold_bars: Option<u32>,
}

fn resolve_exits(signal: &Signal, plan: &ExitPlan, entry: f64) -> Result<ResolvedExits, EngineError> {
    let mult = signal.side.multiplier();

    let mut stop_price = signal.stop_loss;
    let mut max_hold_bars = None;
    match plan.stop {
        Some(StopRule::Percent { pct }) => {
            if stop_price.is_none() {
                stop_price = Some(entry * (1.0 - mult * pct));
            }
        }
        Some(StopRule::Time { bars }) => max_hold_bars = Some(bars),
        None => {}
    }
    // Sizing needs a price distance; a bare time stop cannot provide one.
    let stop_loss = stop_price.ok_or_else(|| EngineError::InvalidStop {
        entry,
        detail: "no stop price resolvable from signal or exit plan".to_string(),
    })?;

    let take_profit = signal.take_profit.or_else(|| match plan.target {
        Some(TargetRule::Percent { pct }) => Some(entry * (1.0 + mult * pct)),
        Some(TargetRule::RiskReward { rr }) => {
            Some(entry + mult * rr * (entry - stop_loss).abs())
        }
        None => None,
    });

    Ok(ResolvedExits {
        stop_loss,
        take_profit,
        max_hold_bars,
    })
}

/// Replay the aligned frame bar by bar.
///
/// Within a bar: strategies are polled for signals in registration order
/// (earlier registration wins risk-cap ties), then every open position goes
/// through the fixed exit cascade, then one equity sample is appended. A
/// position opened at this bar's close is first exit-evaluated on the next
/// bar. The cancel flag is honoured between bars; remaining positions are
/// closed at the last observed close.
pub fn run_loop(
    frame: &AlignedFrame,
    strategies: &mut [Box<dyn Strategy>],
    manager: &mut PositionManager,
    tracker: &mut EquityTracker,
    cancel: &CancelToken,
) -> LoopOutcome {
    let mut trades = Vec::new();
    let mut bars_processed = 0usize;
    let mut cancelled = false;

    for i in 0..frame.len() {
        if cancel.is_cancelled() {
            if let Some(prev) = i.checked_sub(1).map(|j| frame.bar(j)) {
                let pnl =
                    manager.force_close_all(prev.close, prev.timestamp, CloseReason::ManualExit);
                tracker.add_realized(pnl);
                drain_closed(manager, &mut trades);
            }
            cancelled = true;
            break;
        }

        let bar = frame.bar(i);
        let row = frame.row(i);
        let t = bar.timestamp;

        manager.advance_bar();

        // Entries: signal at the close of the bar that just finished.
        for strategy in strategies.iter_mut() {
            if !strategy.is_trading_time_allowed(&row, t) {
                continue;
            }
            let signal = match strategy.generate_signals(&row, t) {
                Ok(Some(signal)) => signal,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(
                        strategy = strategy.meta().id,
                        timestamp = %t,
                        error = %err,
                        "signal callback failed; treating as no signal"
                    );
                    continue;
                }
            };

            let entry = bar.close;
            let plan = strategy.exit_plan();
            let resolved = match resolve_exits(&signal, &plan, entry) {
                Ok(resolved) => resolved,
                Err(err) => {
                    tracing::warn!(
                        strategy = strategy.meta().id,
                        timestamp = %t,
                        error = %err,
                        "signal discarded"
                    );
                    continue;
                }
            };

            let equity = tracker.total_equity(manager.unrealized_total(entry));
            let request = OpenRequest {
                strategy: strategy.meta().id.to_string(),
                side: signal.side,
                timestamp: t,
                entry_price: entry,
                stop_loss: resolved.stop_loss,
                take_profit: resolved.take_profit,
                rungs: plan.partial_exits,
                max_hold_bars: resolved.max_hold_bars,
            };
            match manager.try_open(request, equity) {
                Ok(OpenOutcome::Opened) => {
                    tracing::debug!(
                        strategy = strategy.meta().id,
                        timestamp = %t,
                        side = %signal.side,
                        entry,
                        confidence = signal.confidence.clamp(0.0, 1.0),
                        "position opened"
                    );
                }
                Ok(OpenOutcome::RiskCapExceeded) => {
                    tracing::debug!(
                        strategy = strategy.meta().id,
                        timestamp = %t,
                        "signal rejected by risk cap"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        strategy = strategy.meta().id,
                        timestamp = %t,
                        error = %err,
                        "signal discarded"
                    );
                }
            }
        }

        // Exits: the fixed cascade first, the strategy hook only when the
        // cascade declined. Positions opened this bar sit out.
        for strategy in strategies.iter_mut() {
            let id = strategy.meta().id;
            for idx in manager.open_indices_for(id) {
                let pos = &manager.positions()[idx];
                if pos.bars_held == 0 {
                    continue;
                }
                let eval = exits::evaluate(pos, bar);
                if eval.is_empty() {
                    let wants_exit = match strategy.should_exit(pos, &row, t) {
                        Ok(wants_exit) => wants_exit,
                        Err(err) => {
                            tracing::warn!(
                                strategy = id,
                                timestamp = %t,
                                error = %err,
                                "exit callback failed; treating as no exit"
                            );
                            false
                        }
                    };
                    if wants_exit {
                        let pnl =
                            manager.close_position(idx, bar.close, t, CloseReason::StrategyExit);
                        tracker.add_realized(pnl);
                    }
                } else {
                    let pnl = manager.apply_exits(idx, &eval, t);
                    tracker.add_realized(pnl);
                }
            }
        }

        if i == frame.len() - 1 {
            let pnl = manager.force_close_all(bar.close, t, CloseReason::EndOfData);
            tracker.add_realized(pnl);
        }

        drain_closed(manager, &mut trades);

        tracker.record_bar(t, manager.unrealized_total(bar.close));
        bars_processed += 1;
    }

    LoopOutcome {
        trades,
        bars_processed,
        cancelled,
    }
}

fn drain_closed(manager: &mut PositionManager, trades: &mut Vec<TradeRecord>) {
    for pos in manager.take_closed() {
        if let Some(record) = pos.to_record() {
            trades.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::frame::Bar;
    use crate::engine::types::Side;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 8, 8, 0, 0).unwrap()
    }

    fn long_signal(entry_stop: Option<(f64, f64)>) -> Signal {
        let mut signal = Signal::new(t0(), Side::Long, 0.8);
        if let Some((stop, tp)) = entry_stop {
            signal = signal.with_stop_loss(stop).with_take_profit(tp);
        }
        signal
    }

    #[test]
    fn absolute_overrides_win_over_plan() {
        let plan = ExitPlan {
            stop: Some(StopRule::Percent { pct: 0.05 }),
            target: Some(TargetRule::RiskReward { rr: 2.0 }),
            partial_exits: vec![],
        };
        let resolved = resolve_exits(&long_signal(Some((98.0, 107.0))), &plan, 100.0).unwrap();
        assert!((resolved.stop_loss - 98.0).abs() < f64::EPSILON);
        assert_eq!(resolved.take_profit, Some(107.0));
        assert_eq!(resolved.max_hold_bars, None);
    }

    #[test]
    fn percent_stop_and_rr_target_derived() {
        let plan = ExitPlan {
            stop: Some(StopRule::Percent { pct: 0.01 }),
            target: Some(TargetRule::RiskReward { rr: 2.0 }),
            partial_exits: vec![],
        };
        let resolved = resolve_exits(&long_signal(None), &plan, 1_800.0).unwrap();
        assert!((resolved.stop_loss - 1_782.0).abs() < 1e-9);
        // rr target: 2x the 18-point risk distance above entry.
        assert!((resolved.take_profit.unwrap() - 1_836.0).abs() < 1e-9);
    }

    #[test]
    fn rr_target_from_signal_stop() {
        // Entry 1800, absolute stop 1780, rr 2 -> target 1840.
        let plan = ExitPlan {
            stop: None,
            target: Some(TargetRule::RiskReward { rr: 2.0 }),
            partial_exits: vec![],
        };
        let signal = Signal::new(t0(), Side::Long, 1.0).with_stop_loss(1_780.0);
        let resolved = resolve_exits(&signal, &plan, 1_800.0).unwrap();
        assert!((resolved.take_profit.unwrap() - 1_840.0).abs() < 1e-9);
    }

    #[test]
    fn percent_target_for_short() {
        let plan = ExitPlan {
            stop: Some(StopRule::Percent { pct: 0.01 }),
            target: Some(TargetRule::Percent { pct: 0.02 }),
            partial_exits: vec![],
        };
        let signal = Signal::new(t0(), Side::Short, 1.0);
        let resolved = resolve_exits(&signal, &plan, 100.0).unwrap();
        assert!((resolved.stop_loss - 101.0).abs() < 1e-9);
        assert!((resolved.take_profit.unwrap() - 98.0).abs() < 1e-9);
    }

    #[test]
    fn time_stop_without_price_is_invalid() {
        let plan = ExitPlan {
            stop: Some(StopRule::Time { bars: 10 }),
            target: None,
            partial_exits: vec![],
        };
        let err = resolve_exits(&long_signal(None), &plan, 100.0).unwrap_err();
        assert!(matches!(err, EngineError::InvalidStop { .. }));
    }

    #[test]
    fn time_stop_with_signal_stop_sets_clock() {
        let plan = ExitPlan {
            stop: Some(StopRule::Time { bars: 10 }),
            target: None,
            partial_exits: vec![],
        };
        let signal = Signal::new(t0(), Side::Long, 1.0).with_stop_loss(98.5);
        let resolved = resolve_exits(&signal, &plan, 100.0).unwrap();
        assert_eq!(resolved.max_hold_bars, Some(10));
        assert!((resolved.stop_loss - 98.5).abs() < f64::EPSILON);
    }

    #[test]
    fn bar_shape_helper_sane() {
        // Guard for the fixtures used by the integration scenarios.
        let bar = Bar::new(t0(), 100.0, 101.0, 99.0, 100.5, None);
        assert!(bar.low <= bar.open && bar.open <= bar.high);
    }
}
