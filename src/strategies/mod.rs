pub mod breakout;
pub mod meanrev;
pub mod trend;

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc, Weekday};
use schemars::JsonSchema;
use serde::Serialize;

use crate::data::frame::parse_day_tag;
use crate::engine::align::AlignedRow;
use crate::engine::error::{EngineError, StrategyError};
use crate::engine::position::Position;
use crate::engine::timeframe::Timeframe;
use crate::engine::types::{ExitPlan, ParamValue, Signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Int,
    Float,
    Bool,
    Text,
}

/// Schema entry for one configurable strategy parameter. Declared statically
/// on the strategy type; the configuration UI renders from this.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub default: ParamValue,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub help: &'static str,
}

impl ParamSpec {
    pub fn float(name: &'static str, default: f64, min: f64, max: f64, help: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::Float,
            default: ParamValue::Float(default),
            min: Some(min),
            max: Some(max),
            help,
        }
    }

    pub fn int(name: &'static str, default: i64, min: f64, max: f64, help: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::Int,
            default: ParamValue::Int(default),
            min: Some(min),
            max: Some(max),
            help,
        }
    }

    pub fn text(name: &'static str, default: &str, help: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::Text,
            default: ParamValue::Text(default.to_string()),
            min: None,
            max: None,
            help,
        }
    }
}

/// Static metadata of a strategy: identity, required timeframes (first is
/// the base), exit defaults, and the parameter schema.
#[derive(Debug, Clone)]
pub struct StrategyMeta {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    /// Ordered; index 0 is the base timeframe the engine steps on.
    pub timeframes: Vec<Timeframe>,
    pub uses_custom_sl: bool,
    pub uses_custom_tp: bool,
    pub default_exits: ExitPlan,
    pub params: Vec<ParamSpec>,
}

impl StrategyMeta {
    pub fn base_timeframe(&self) -> Timeframe {
        self.timeframes[0]
    }
}

/// Parameter values resolved against a schema: defaults filled in, names,
/// kinds and ranges checked.
#[derive(Debug, Clone)]
pub struct StrategyParams {
    values: BTreeMap<String, ParamValue>,
}

impl StrategyParams {
    pub fn resolve(
        strategy_id: &str,
        schema: &[ParamSpec],
        supplied: &BTreeMap<String, ParamValue>,
    ) -> Result<Self, EngineError> {
        let invalid = |detail: String| EngineError::InvalidParameter {
            strategy: strategy_id.to_string(),
            detail,
        };

        for name in supplied.keys() {
            if !schema.iter().any(|spec| spec.name == name) {
                return Err(invalid(format!("unknown parameter '{name}'")));
            }
        }

        let mut values = BTreeMap::new();
        for spec in schema {
            let value = match supplied.get(spec.name) {
                None => spec.default.clone(),
                Some(v) => {
                    let ok = match spec.kind {
                        ParamKind::Int => v.as_i64().is_some(),
                        ParamKind::Float => v.as_f64().is_some(),
                        ParamKind::Bool => v.as_bool().is_some(),
                        ParamKind::Text => v.as_str().is_some(),
                    };
                    if !ok {
                        return Err(invalid(format!(
                            "parameter '{}' expects kind {:?}",
                            spec.name, spec.kind
                        )));
                    }
                    if let Some(n) = v.as_f64() {
                        if spec.min.is_some_and(|min| n < min)
                            || spec.max.is_some_and(|max| n > max)
                        {
                            return Err(invalid(format!(
                                "parameter '{}' = {n} outside [{:?}, {:?}]",
                                spec.name, spec.min, spec.max
                            )));
                        }
                    }
                    v.clone()
                }
            };
            values.insert(spec.name.to_string(), value);
        }

        Ok(Self { values })
    }

    pub fn float(&self, name: &str) -> f64 {
        self.values
            .get(name)
            .and_then(ParamValue::as_f64)
            .expect("parameter resolved against schema")
    }

    pub fn int(&self, name: &str) -> i64 {
        self.values
            .get(name)
            .and_then(ParamValue::as_i64)
            .expect("parameter resolved against schema")
    }

    pub fn text(&self, name: &str) -> &str {
        self.values
            .get(name)
            .and_then(ParamValue::as_str)
            .expect("parameter resolved against schema")
    }

    /// Parse a comma-separated day-of-week allowlist parameter (`Mon,Tue`).
    /// Empty means no restriction.
    pub fn day_allowlist(&self, name: &str) -> Result<Option<HashSet<Weekday>>, EngineError> {
        let text = self.text(name).trim();
        if text.is_empty() {
            return Ok(None);
        }
        let mut days = HashSet::new();
        for tag in text.split(',') {
            let tag = tag.trim();
            match parse_day_tag(tag) {
                Some(day) => {
                    days.insert(day);
                }
                None => {
                    return Err(EngineError::InvalidParameter {
                        strategy: String::new(),
                        detail: format!("unknown day tag '{tag}' in '{name}'"),
                    })
                }
            }
        }
        Ok(Some(days))
    }
}

/// The contract between a strategy and the engine. The aligned row handed to
/// each hook contains only information available at the close of bar `t`;
/// that is the whole lookahead defense.
pub trait Strategy: Send {
    fn meta(&self) -> &StrategyMeta;

    /// Exit behavior for new positions, resolved from this instance's
    /// parameters.
    fn exit_plan(&self) -> ExitPlan {
        self.meta().default_exits.clone()
    }

    /// Entry decision for the bar that closed at `t`. Called once per bar.
    fn generate_signals(
        &mut self,
        row: &AlignedRow<'_>,
        t: DateTime<Utc>,
    ) -> Result<Option<Signal>, StrategyError>;

    /// Custom exit for one of this strategy's open positions. Runs after
    /// the SL/TP/partial/time checks all declined.
    fn should_exit(
        &mut self,
        _position: &Position,
        _row: &AlignedRow<'_>,
        _t: DateTime<Utc>,
    ) -> Result<bool, StrategyError> {
        Ok(false)
    }

    /// Day-of-week allowlist, when the strategy's config has one.
    fn allowed_days(&self) -> Option<&HashSet<Weekday>> {
        None
    }

    fn is_trading_time_allowed(&self, row: &AlignedRow<'_>, _t: DateTime<Utc>) -> bool {
        match self.allowed_days() {
            Some(days) => days.contains(&row.day_of_week()),
            None => true,
        }
    }
}

impl std::fmt::Debug for dyn Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strategy").field("id", &self.meta().id).finish()
    }
}

/// Metadata of every registered strategy.
pub fn available() -> Vec<StrategyMeta> {
    vec![trend::meta(), meanrev::meta(), breakout::meta()]
}

pub fn find_meta(id: &str) -> Option<StrategyMeta> {
    available().into_iter().find(|m| m.id == id)
}

/// Construct a strategy by id from raw parameter values.
pub fn build(
    id: &str,
    params: &BTreeMap<String, ParamValue>,
) -> Result<Box<dyn Strategy>, EngineError> {
    match id {
        trend::ID => Ok(Box::new(trend::HtfMomentum::from_params(params)?)),
        meanrev::ID => Ok(Box::new(meanrev::RsiReversion::from_params(params)?)),
        breakout::ID => Ok(Box::new(breakout::LadderBreakout::from_params(params)?)),
        _ => Err(EngineError::UnknownStrategy(id.to_string())),
    }
}
