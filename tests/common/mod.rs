#![allow(dead_code)]

use std::collections::HashSet;

use chrono::{DateTime, Duration, TimeZone, Utc, Weekday};
use rustc_hash::FxHashMap;

use crossmarket::data::frame::{Bar, MarketFrame};
use crossmarket::engine::align::AlignedRow;
use crossmarket::engine::error::StrategyError;
use crossmarket::engine::timeframe::Timeframe;
use crossmarket::engine::types::{
    AssetType, ExitPlan, RiskPolicy, RunConfig, Side, Signal, StrategyConfig, SymbolFilter,
    SymbolMeta,
};
use crossmarket::strategies::{Strategy, StrategyMeta};

/// 2024-01-08 08:00 UTC (a Monday) plus `min` minutes.
pub fn ts(min: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 8, 8, 0, 0).unwrap() + Duration::minutes(min)
}

/// Build a 5m frame from `(open, high, low, close)` rows starting at 08:00.
pub fn frames_5m(rows: &[(f64, f64, f64, f64)]) -> FxHashMap<String, MarketFrame> {
    let bars: Vec<Bar> = rows
        .iter()
        .enumerate()
        .map(|(i, &(o, h, l, c))| Bar::new(ts(i as i64 * 5), o, h, l, c, None))
        .collect();
    let mut frames = FxHashMap::default();
    frames.insert(
        "5m".to_string(),
        MarketFrame::new(Timeframe::parse("5m").unwrap(), bars).unwrap(),
    );
    frames
}

pub fn run_config(strategy_ids: &[&str]) -> RunConfig {
    RunConfig {
        risk: RiskPolicy {
            initial_capital: 10_000.0,
            max_total_risk_fraction: 0.02,
            per_trade_risk_fraction: 0.01,
            use_compounding: false,
        },
        base_timeframe: "5m".to_string(),
        start_time: None,
        end_time: None,
        strategies: strategy_ids
            .iter()
            .map(|id| StrategyConfig {
                id: (*id).to_string(),
                params: std::collections::BTreeMap::new(),
            })
            .collect(),
        minutes_per_trading_year: None,
        symbols: SymbolFilter::default(),
    }
}

pub fn symbol() -> SymbolMeta {
    SymbolMeta {
        symbol: "BTCUSDT".to_string(),
        asset_type: AssetType::Crypto,
        exchange: "binance".to_string(),
        point_value: 1.0,
        table_name: None,
        first_timestamp: None,
        last_timestamp: None,
    }
}

/// One scripted entry: fire on this row index with an absolute stop and an
/// optional absolute target.
#[derive(Debug, Clone, Copy)]
pub struct ScriptedFire {
    pub at: usize,
    pub stop: f64,
    pub target: Option<f64>,
}

/// A fully scripted strategy for end-to-end scenarios: fixed entries,
/// optional ladder/time exits via the exit plan, an optional custom-exit
/// row, an optional failing callback, and an optional day allowlist.
pub struct ScriptedStrategy {
    meta: StrategyMeta,
    pub side: Side,
    pub fires: Vec<ScriptedFire>,
    pub exits: ExitPlan,
    pub exit_at: Option<usize>,
    pub fail_at: Option<usize>,
    pub allowed: Option<HashSet<Weekday>>,
}

impl ScriptedStrategy {
    pub fn new(id: &'static str, side: Side, fires: Vec<ScriptedFire>) -> Self {
        Self {
            meta: StrategyMeta {
                id,
                name: id,
                description: "scripted scenario fixture",
                timeframes: vec![Timeframe::parse("5m").unwrap()],
                uses_custom_sl: true,
                uses_custom_tp: true,
                default_exits: ExitPlan::default(),
                params: vec![],
            },
            side,
            fires,
            exits: ExitPlan::default(),
            exit_at: None,
            fail_at: None,
            allowed: None,
        }
    }

    pub fn with_exits(mut self, exits: ExitPlan) -> Self {
        self.exits = exits;
        self
    }

    pub fn exit_on_row(mut self, at: usize) -> Self {
        self.exit_at = Some(at);
        self
    }

    pub fn failing_on_row(mut self, at: usize) -> Self {
        self.fail_at = Some(at);
        self
    }

    pub fn with_allowed_days(mut self, days: HashSet<Weekday>) -> Self {
        self.allowed = Some(days);
        self
    }
}

impl Strategy for ScriptedStrategy {
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
        if self.fail_at == Some(row.index()) {
            return Err(StrategyError::new("scripted failure"));
        }
        let Some(fire) = self.fires.iter().find(|f| f.at == row.index()) else {
            return Ok(None);
        };
        let mut signal = Signal::new(t, self.side, 1.0).with_stop_loss(fire.stop);
        if let Some(tp) = fire.target {
            signal = signal.with_take_profit(tp);
        }
        Ok(Some(signal))
    }

    fn should_exit(
        &mut self,
        _position: &crossmarket::engine::position::Position,
        row: &AlignedRow<'_>,
        _t: DateTime<Utc>,
    ) -> Result<bool, StrategyError> {
        if self.fail_at == Some(row.index()) {
            return Err(StrategyError::new("scripted failure"));
        }
        Ok(self.exit_at == Some(row.index()))
    }

    fn allowed_days(&self) -> Option<&HashSet<Weekday>> {
        self.allowed.as_ref()
    }
}
