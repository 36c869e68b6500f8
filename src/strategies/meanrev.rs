use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc, Weekday};

use crate::engine::align::AlignedRow;
use crate::engine::error::{EngineError, StrategyError};
use crate::engine::position::Position;
use crate::engine::timeframe::Timeframe;
use crate::engine::types::{ExitPlan, ParamValue, Side, Signal, StopRule};

use super::{ParamSpec, Strategy, StrategyMeta, StrategyParams};

pub const ID: &str = "rsi_reversion";

pub fn meta() -> StrategyMeta {
    StrategyMeta {
        id: ID,
        name: "RSI mean reversion",
        description: "Fades oscillator extremes using a pre-computed RSI column; leaves when \
                      the oscillator normalizes or the holding clock runs out",
        timeframes: vec![Timeframe::parse("5m").expect("static label")],
        uses_custom_sl: true,
        uses_custom_tp: false,
        default_exits: ExitPlan {
            stop: Some(StopRule::Time { bars: 48 }),
            target: None,
            partial_exits: vec![],
        },
        params: vec![
            ParamSpec::text("column", "rsi", "Indicator column carrying the oscillator"),
            ParamSpec::float("oversold", 30.0, 1.0, 50.0, "Long entry threshold"),
            ParamSpec::float("overbought", 70.0, 50.0, 99.0, "Short entry threshold"),
            ParamSpec::float("exit_level", 50.0, 1.0, 99.0, "Oscillator level that ends a trade"),
            ParamSpec::float("stop_pct", 1.5, 0.05, 20.0, "Protective stop, percent of entry"),
            ParamSpec::int("max_hold_bars", 48, 1.0, 10_000.0, "Time exit after this many bars"),
            ParamSpec::text("days", "", "Comma-separated day-of-week allowlist, empty for all"),
        ],
    }
}

/// Long when the oscillator crosses back up through the oversold line, short
/// when it crosses down through the overbought line. The stop price is
/// computed by the strategy itself (absolute override); the exit plan only
/// contributes the holding clock.
pub struct RsiReversion {
    meta: StrategyMeta,
    exits: ExitPlan,
    allowed_days: Option<HashSet<Weekday>>,
    column: String,
    oversold: f64,
    overbought: f64,
    exit_level: f64,
    stop_fraction: f64,
    prev_value: Option<f64>,
}

impl RsiReversion {
    pub fn from_params(supplied: &BTreeMap<String, ParamValue>) -> Result<Self, EngineError> {
        let meta = meta();
        let params = StrategyParams::resolve(ID, &meta.params, supplied)?;
        Ok(Self {
            exits: ExitPlan {
                stop: Some(StopRule::Time {
                    bars: params.int("max_hold_bars") as u32,
                }),
                target: None,
                partial_exits: vec![],
            },
            allowed_days: params.day_allowlist("days")?,
            column: params.text("column").to_string(),
            oversold: params.float("oversold"),
            overbought: params.float("overbought"),
            exit_level: params.float("exit_level"),
            stop_fraction: params.float("stop_pct") / 100.0,
            prev_value: None,
            meta,
        })
    }
}

impl Strategy for RsiReversion {
    fn meta(&self) -> &StrategyMeta {
        &self.meta
    }

    fn exit_plan(&self) -> ExitPlan {
        self.exits.clone()
    }

    fn generate_signals(
        &mut self,
        row: &AlignedRow<'_>,
        t: DateTime<Utc>,
    ) -> Result<Option<Signal>, StrategyError> {
        let Some(value) = row.get(&self.column) else {
            // Indicator warm-up rows carry no value; nothing to fade yet.
            return Ok(None);
        };
        let prev = self.prev_value.replace(value);
        let Some(prev) = prev else {
            return Ok(None);
        };

        let close = row.close();
        let crossed_up = prev < self.oversold && value >= self.oversold;
        let crossed_down = prev > self.overbought && value <= self.overbought;

        let (side, depth) = if crossed_up {
            (Side::Long, (self.oversold - prev) / self.oversold)
        } else if crossed_down {
            (Side::Short, (prev - self.overbought) / (100.0 - self.overbought))
        } else {
            return Ok(None);
        };

        let stop = match side {
            Side::Long => close * (1.0 - self.stop_fraction),
            Side::Short => close * (1.0 + self.stop_fraction),
        };
        let confidence = depth.clamp(0.1, 1.0);
        Ok(Some(Signal::new(t, side, confidence).with_stop_loss(stop)))
    }

    fn should_exit(
        &mut self,
        position: &Position,
        row: &AlignedRow<'_>,
        _t: DateTime<Utc>,
    ) -> Result<bool, StrategyError> {
        let Some(value) = row.get(&self.column) else {
            return Ok(false);
        };
        Ok(match position.side {
            Side::Long => value >= self.exit_level,
            Side::Short => value <= self.exit_level,
        })
    }

    fn allowed_days(&self) -> Option<&HashSet<Weekday>> {
        self.allowed_days.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::frame::{Bar, MarketFrame};
    use crate::engine::align::align_frames;
    use chrono::{Duration, TimeZone};
    use rustc_hash::FxHashMap;

    fn ts(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 8, 8, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn aligned_with_rsi(rsi: Vec<f64>) -> crate::engine::align::AlignedFrame {
        let bars: Vec<Bar> = (0..rsi.len() as i64)
            .map(|i| Bar::new(ts(i * 5), 100.0, 100.5, 99.5, 100.0, None))
            .collect();
        let tf = Timeframe::parse("5m").unwrap();
        let mut frames = FxHashMap::default();
        frames.insert(
            "5m".to_string(),
            MarketFrame::new(tf, bars).unwrap().with_indicator("rsi", rsi),
        );
        align_frames(&frames, &[tf]).unwrap()
    }

    fn collect_signals(frame: &crate::engine::align::AlignedFrame) -> Vec<Signal> {
        let mut strat = RsiReversion::from_params(&BTreeMap::new()).unwrap();
        let mut out = Vec::new();
        for i in 0..frame.len() {
            let row = frame.row(i);
            if let Some(sig) = strat.generate_signals(&row, row.timestamp()).unwrap() {
                out.push(sig);
            }
        }
        out
    }

    #[test]
    fn long_on_cross_up_through_oversold() {
        // Dips below 30, then recovers: one long on the recovery bar.
        let frame = aligned_with_rsi(vec![45.0, 35.0, 25.0, 28.0, 33.0, 40.0]);
        let signals = collect_signals(&frame);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Long);
        // 1.5% protective stop below the 100.0 close.
        let stop = signals[0].stop_loss.unwrap();
        assert!((stop - 98.5).abs() < 1e-9);
    }

    #[test]
    fn short_on_cross_down_through_overbought() {
        let frame = aligned_with_rsi(vec![55.0, 65.0, 78.0, 72.0, 69.0, 60.0]);
        let signals = collect_signals(&frame);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Short);
        assert!(signals[0].stop_loss.unwrap() > 100.0);
    }

    #[test]
    fn no_signal_while_pinned_in_extreme() {
        let frame = aligned_with_rsi(vec![25.0, 24.0, 23.0, 22.0]);
        assert!(collect_signals(&frame).is_empty());
    }

    #[test]
    fn missing_column_is_silent() {
        let bars: Vec<Bar> = (0..4i64)
            .map(|i| Bar::new(ts(i * 5), 100.0, 100.5, 99.5, 100.0, None))
            .collect();
        let tf = Timeframe::parse("5m").unwrap();
        let mut frames = FxHashMap::default();
        frames.insert("5m".to_string(), MarketFrame::new(tf, bars).unwrap());
        let frame = align_frames(&frames, &[tf]).unwrap();
        assert!(collect_signals(&frame).is_empty());
    }

    #[test]
    fn exit_when_oscillator_normalizes() {
        let frame = aligned_with_rsi(vec![25.0, 35.0, 45.0, 55.0]);
        let mut strat = RsiReversion::from_params(&BTreeMap::new()).unwrap();

        // A long position opened earlier; any fields beyond side are unused
        // by the hook.
        let mut mgr = crate::engine::position::PositionManager::new(
            crate::engine::types::RiskPolicy {
                initial_capital: 10_000.0,
                max_total_risk_fraction: 0.05,
                per_trade_risk_fraction: 0.01,
                use_compounding: false,
            },
            1.0,
        );
        mgr.try_open(
            crate::engine::position::OpenRequest {
                strategy: ID.to_string(),
                side: Side::Long,
                timestamp: ts(0),
                entry_price: 100.0,
                stop_loss: 98.5,
                take_profit: None,
                rungs: vec![],
                max_hold_bars: Some(48),
            },
            10_000.0,
        )
        .unwrap();
        let pos = &mgr.positions()[0];

        let row = frame.row(2); // rsi 45, below exit level
        assert!(!strat.should_exit(pos, &row, row.timestamp()).unwrap());
        let row = frame.row(3); // rsi 55, above exit level
        assert!(strat.should_exit(pos, &row, row.timestamp()).unwrap());
    }

    #[test]
    fn time_stop_comes_from_params() {
        let mut supplied = BTreeMap::new();
        supplied.insert("max_hold_bars".to_string(), ParamValue::Int(12));
        let strat = RsiReversion::from_params(&supplied).unwrap();
        assert_eq!(
            strat.exit_plan().stop,
            Some(StopRule::Time { bars: 12 })
        );
    }
}
