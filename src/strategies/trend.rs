use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc, Weekday};

use crate::engine::align::AlignedRow;
use crate::engine::error::{EngineError, StrategyError};
use crate::engine::timeframe::Timeframe;
use crate::engine::types::{ExitPlan, ParamValue, Side, Signal, StopRule, TargetRule};

use super::{ParamSpec, Strategy, StrategyMeta, StrategyParams};

pub const ID: &str = "htf_momentum";

pub fn meta() -> StrategyMeta {
    StrategyMeta {
        id: ID,
        name: "Higher-timeframe momentum",
        description: "Enters with the hourly trend when the base close pulls ahead of the last \
                      closed hourly bar",
        timeframes: vec![
            Timeframe::parse("5m").expect("static label"),
            Timeframe::parse("1h").expect("static label"),
        ],
        uses_custom_sl: false,
        uses_custom_tp: false,
        default_exits: ExitPlan {
            stop: Some(StopRule::Percent { pct: 0.01 }),
            target: Some(TargetRule::RiskReward { rr: 2.0 }),
            partial_exits: vec![],
        },
        params: vec![
            ParamSpec::float("stop_pct", 1.0, 0.05, 20.0, "Stop distance, percent of entry"),
            ParamSpec::float("target_rr", 2.0, 0.1, 20.0, "Take-profit as an r-multiple"),
            ParamSpec::text("days", "", "Comma-separated day-of-week allowlist, empty for all"),
        ],
    }
}

/// Long when the base close is above a bullish last-closed hourly bar, short
/// on the mirror image. Emits only on the transition into that state.
pub struct HtfMomentum {
    meta: StrategyMeta,
    exits: ExitPlan,
    allowed_days: Option<HashSet<Weekday>>,
    htf_close_col: String,
    htf_open_col: String,
    prev_state: Option<i8>,
}

impl HtfMomentum {
    pub fn from_params(supplied: &BTreeMap<String, ParamValue>) -> Result<Self, EngineError> {
        let meta = meta();
        let params = StrategyParams::resolve(ID, &meta.params, supplied)?;
        let htf = meta.timeframes[1].standard();
        Ok(Self {
            exits: ExitPlan {
                stop: Some(StopRule::Percent {
                    pct: params.float("stop_pct") / 100.0,
                }),
                target: Some(TargetRule::RiskReward {
                    rr: params.float("target_rr"),
                }),
                partial_exits: vec![],
            },
            allowed_days: params.day_allowlist("days")?,
            htf_close_col: format!("{htf}_close"),
            htf_open_col: format!("{htf}_open"),
            prev_state: None,
            meta,
        })
    }

    fn state(&self, row: &AlignedRow<'_>) -> Option<i8> {
        let htf_close = row.get(&self.htf_close_col)?;
        let htf_open = row.get(&self.htf_open_col)?;
        let close = row.close();
        if close > htf_close && htf_close > htf_open {
            Some(1)
        } else if close < htf_close && htf_close < htf_open {
            Some(-1)
        } else {
            Some(0)
        }
    }
}

impl Strategy for HtfMomentum {
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
        let Some(state) = self.state(row) else {
            return Ok(None);
        };
        let prev = self.prev_state.replace(state);

        let entered = prev.is_some_and(|p| p != state);
        if !entered || state == 0 {
            return Ok(None);
        }

        let side = if state > 0 { Side::Long } else { Side::Short };
        let htf_close = row
            .get(&self.htf_close_col)
            .ok_or_else(|| StrategyError::new("higher-timeframe close vanished mid-bar"))?;
        let stretch = ((row.close() - htf_close) / htf_close).abs();
        let confidence = (stretch * 200.0).clamp(0.1, 1.0);

        Ok(Some(Signal::new(t, side, confidence)))
    }

    fn allowed_days(&self) -> Option<&HashSet<Weekday>> {
        self.allowed_days.as_ref()
    }
}
