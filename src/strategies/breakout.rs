use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc, Weekday};

use crate::engine::align::AlignedRow;
use crate::engine::error::{EngineError, StrategyError};
use crate::engine::timeframe::Timeframe;
use crate::engine::types::{ExitPlan, ParamValue, PartialRung, Side, Signal, StopRule};

use super::{ParamSpec, Strategy, StrategyMeta, StrategyParams};

pub const ID: &str = "ladder_breakout";

pub fn meta() -> StrategyMeta {
    StrategyMeta {
        id: ID,
        name: "Hourly breakout with ladder exits",
        description: "Buys a base-timeframe close above the last closed hourly high and scales \
                      out at fixed r-multiples",
        timeframes: vec![
            Timeframe::parse("15m").expect("static label"),
            Timeframe::parse("1h").expect("static label"),
        ],
        uses_custom_sl: false,
        uses_custom_tp: false,
        default_exits: ExitPlan {
            stop: Some(StopRule::Percent { pct: 0.01 }),
            target: None,
            partial_exits: vec![
                PartialRung {
                    fraction: 0.5,
                    r_multiple: 2.0,
                },
                PartialRung {
                    fraction: 0.5,
                    r_multiple: 4.0,
                },
            ],
        },
        params: vec![
            ParamSpec::float("stop_pct", 1.0, 0.05, 20.0, "Stop distance, percent of entry"),
            ParamSpec::float("rung1_fraction", 0.5, 0.0, 1.0, "Share closed at the first rung"),
            ParamSpec::float("rung1_r", 2.0, 0.1, 20.0, "First rung trigger, r-multiple"),
            ParamSpec::float("rung2_fraction", 0.5, 0.0, 1.0, "Share closed at the second rung"),
            ParamSpec::float("rung2_r", 4.0, 0.1, 20.0, "Second rung trigger, r-multiple"),
            ParamSpec::text(
                "days",
                "Mon,Tue,Wed,Thu,Fri",
                "Comma-separated day-of-week allowlist, empty for all",
            ),
        ],
    }
}

/// Long-only breakout: the base close pushes above the high of the last
/// closed hourly bar. One signal per push; re-arms once price falls back
/// under the reference high.
pub struct LadderBreakout {
    meta: StrategyMeta,
    exits: ExitPlan,
    allowed_days: Option<HashSet<Weekday>>,
    htf_high_col: String,
    armed: bool,
}

impl LadderBreakout {
    pub fn from_params(supplied: &BTreeMap<String, ParamValue>) -> Result<Self, EngineError> {
        let meta = meta();
        let params = StrategyParams::resolve(ID, &meta.params, supplied)?;

        let mut partial_exits = Vec::new();
        for (frac_name, r_name) in [("rung1_fraction", "rung1_r"), ("rung2_fraction", "rung2_r")] {
            let fraction = params.float(frac_name);
            if fraction > 0.0 {
                partial_exits.push(PartialRung {
                    fraction,
                    r_multiple: params.float(r_name),
                });
            }
        }
        let fraction_sum: f64 = partial_exits.iter().map(|r| r.fraction).sum();
        if fraction_sum > 1.0 + 1e-9 {
            return Err(EngineError::InvalidParameter {
                strategy: ID.to_string(),
                detail: format!("rung fractions sum to {fraction_sum}, must be <= 1"),
            });
        }

        let htf = meta.timeframes[1].standard();
        Ok(Self {
            exits: ExitPlan {
                stop: Some(StopRule::Percent {
                    pct: params.float("stop_pct") / 100.0,
                }),
                target: None,
                partial_exits,
            },
            allowed_days: params.day_allowlist("days")?,
            htf_high_col: format!("{htf}_high"),
            armed: true,
            meta,
        })
    }
}

impl Strategy for LadderBreakout {
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
        let Some(reference_high) = row.get(&self.htf_high_col) else {
            return Ok(None);
        };
        let close = row.close();

        if close <= reference_high {
            self.armed = true;
            return Ok(None);
        }
        if !self.armed {
            return Ok(None);
        }
        self.armed = false;

        let stretch = (close - reference_high) / reference_high;
        let confidence = (stretch * 400.0).clamp(0.2, 1.0);
        Ok(Some(Signal::new(t, Side::Long, confidence)))
    }

    fn allowed_days(&self) -> Option<&HashSet<Weekday>> {
        self.allowed_days.as_ref()
    }
}
