use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use garde::Validate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn multiplier(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Why a position stopped being open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    /// Terminal: the partial-exit ladder consumed the full size.
    PartialExit,
    TimeExit,
    StrategyExit,
    ManualExit,
    EndOfData,
}

impl CloseReason {
    /// Fixed wire value used in exports.
    pub fn wire(self) -> &'static str {
        match self {
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::PartialExit => "partial_exit",
            CloseReason::TimeExit => "time_exit",
            CloseReason::StrategyExit => "strategy_exit",
            CloseReason::ManualExit => "manual_exit",
            CloseReason::EndOfData => "end_of_data",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire())
    }
}

/// One checkpoint of a partial-exit ladder: close `fraction` of the initial
/// size when price reaches `r_multiple` times the initial risk distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PartialRung {
    pub fraction: f64,
    pub r_multiple: f64,
}

/// How a strategy's stop-loss is derived when the signal carries no absolute
/// price. `Time` contributes no price: it closes the position after a bar
/// count and must be combined with an absolute stop for sizing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopRule {
    Percent { pct: f64 },
    Time { bars: u32 },
}

/// How a strategy's take-profit is derived when the signal carries no
/// absolute price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetRule {
    Percent { pct: f64 },
    /// Target distance equals `rr` times the entry-to-stop distance.
    RiskReward { rr: f64 },
}

/// A strategy's declared exit behavior, resolved at entry into concrete
/// stop/target prices and a rung ladder on the position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExitPlan {
    pub stop: Option<StopRule>,
    pub target: Option<TargetRule>,
    #[serde(default)]
    pub partial_exits: Vec<PartialRung>,
}

/// An entry decision emitted by a strategy for the bar that just closed.
/// Absolute `stop_loss` / `take_profit` prices override the exit plan's
/// derivation rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub timestamp: DateTime<Utc>,
    pub side: Side,
    /// In `[0, 1]`; informational, clamped by the engine.
    pub confidence: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub metadata: Option<serde_json::Value>,
}

impl Signal {
    pub fn new(timestamp: DateTime<Utc>, side: Side, confidence: f64) -> Self {
        Self {
            timestamp,
            side,
            confidence,
            stop_loss: None,
            take_profit: None,
            metadata: None,
        }
    }

    pub fn with_stop_loss(mut self, price: f64) -> Self {
        self.stop_loss = Some(price);
        self
    }

    pub fn with_take_profit(mut self, price: f64) -> Self {
        self.take_profit = Some(price);
        self
    }
}

/// Account-wide risk and sizing policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Validate)]
pub struct RiskPolicy {
    #[garde(range(min = 0.01))]
    pub initial_capital: f64,
    /// Sum of initial risks across open positions may not exceed this
    /// fraction of effective capital.
    #[garde(range(min = 0.0001, max = 1.0))]
    pub max_total_risk_fraction: f64,
    #[garde(range(min = 0.0001, max = 1.0))]
    pub per_trade_risk_fraction: f64,
    /// When on, per-trade risk is a fraction of current equity rather than
    /// of initial capital.
    #[garde(skip)]
    #[serde(default)]
    pub use_compounding: bool,
}

/// A value for one configurable strategy parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// One strategy registration in a run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct StrategyConfig {
    #[garde(length(min = 1))]
    pub id: String,
    #[garde(skip)]
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
}

/// Explicit symbol allow/block repository, owned by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SymbolFilter {
    /// When set, only these symbols may run.
    #[serde(default)]
    pub allowed: Option<Vec<String>>,
    #[serde(default)]
    pub blocked: Vec<String>,
}

impl SymbolFilter {
    pub fn permits(&self, symbol: &str) -> bool {
        if self.blocked.iter().any(|s| s == symbol) {
            return false;
        }
        match &self.allowed {
            Some(allowed) => allowed.iter().any(|s| s == symbol),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    Tradfi,
    Crypto,
}

fn default_point_value() -> f64 {
    1.0
}

/// Per-symbol metadata supplied by the external catalog.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct SymbolMeta {
    #[garde(length(min = 1))]
    pub symbol: String,
    #[garde(skip)]
    pub asset_type: AssetType,
    #[garde(skip)]
    #[serde(default)]
    pub exchange: String,
    /// Account currency per point of price movement per unit of size.
    #[garde(range(min = 0.000_001))]
    #[serde(default = "default_point_value")]
    pub point_value: f64,
    #[garde(skip)]
    #[serde(default)]
    pub table_name: Option<String>,
    #[garde(skip)]
    #[serde(default)]
    pub first_timestamp: Option<DateTime<Utc>>,
    #[garde(skip)]
    #[serde(default)]
    pub last_timestamp: Option<DateTime<Utc>>,
}

/// Full configuration of one backtest run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct RunConfig {
    #[serde(flatten)]
    #[garde(dive)]
    pub risk: RiskPolicy,
    #[garde(length(min = 1))]
    pub base_timeframe: String,
    #[garde(skip)]
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[garde(skip)]
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[garde(length(min = 1), dive)]
    pub strategies: Vec<StrategyConfig>,
    /// Annualization basis for Sharpe/Sortino. Defaults to 24x365
    /// (`525_600` minutes); set for session-calendar symbols.
    #[garde(inner(range(min = 1.0)))]
    #[serde(default)]
    pub minutes_per_trading_year: Option<f64>,
    #[garde(skip)]
    #[serde(default)]
    pub symbols: SymbolFilter,
}

/// One equity observation, appended at every bar close.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EquitySample {
    pub timestamp: DateTime<Utc>,
    pub realized_equity: f64,
    pub unrealized_equity: f64,
    /// Fractional decline from the running peak of total equity.
    pub drawdown: f64,
}

/// A closed position, enriched for the trade log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TradeRecord {
    pub strategy: String,
    pub side: Side,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub initial_size: f64,
    pub initial_risk: f64,
    pub realized_pnl: f64,
    pub r_multiple: f64,
    pub close_reason: CloseReason,
    pub duration_bars: u32,
    pub duration_secs: i64,
}

/// Summary metrics over the closed-trade log and the equity log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PerformanceSummary {
    pub trades: usize,
    pub final_equity: f64,
    /// `(final_equity - initial_capital) / initial_capital`.
    pub total_return: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub max_drawdown: f64,
    pub avg_drawdown: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub calmar: f64,
    pub avg_r_multiple: f64,
    pub expectancy: f64,
}

/// Everything a completed (or cancelled) run produces.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct BacktestResult {
    pub symbol: String,
    pub summary: PerformanceSummary,
    pub per_strategy: BTreeMap<String, PerformanceSummary>,
    pub trade_log: Vec<TradeRecord>,
    pub equity_log: Vec<EquitySample>,
    /// Signals denied by the account-wide risk cap.
    pub risk_cap_rejections: u64,
    pub bars_processed: usize,
    pub cancelled: bool,
}

/// Cooperative cancellation flag, checked by the engine between bars.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn risk() -> RiskPolicy {
        RiskPolicy {
            initial_capital: 10_000.0,
            max_total_risk_fraction: 0.02,
            per_trade_risk_fraction: 0.01,
            use_compounding: false,
        }
    }

    #[test]
    fn close_reason_wire_values() {
        assert_eq!(CloseReason::StopLoss.wire(), "stop_loss");
        assert_eq!(CloseReason::TakeProfit.wire(), "take_profit");
        assert_eq!(CloseReason::PartialExit.wire(), "partial_exit");
        assert_eq!(CloseReason::TimeExit.wire(), "time_exit");
        assert_eq!(CloseReason::StrategyExit.wire(), "strategy_exit");
        assert_eq!(CloseReason::ManualExit.wire(), "manual_exit");
        assert_eq!(CloseReason::EndOfData.wire(), "end_of_data");
    }

    #[test]
    fn risk_policy_validates() {
        assert!(risk().validate().is_ok());

        let mut bad = risk();
        bad.initial_capital = -5.0;
        assert!(bad.validate().is_err());

        let mut bad = risk();
        bad.per_trade_risk_fraction = 1.5;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn run_config_requires_strategies() {
        let config = RunConfig {
            risk: risk(),
            base_timeframe: "5m".to_string(),
            start_time: None,
            end_time: None,
            strategies: vec![],
            minutes_per_trading_year: None,
            symbols: SymbolFilter::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn run_config_parses_from_toml() {
        let text = r#"
            initial_capital = 10000.0
            max_total_risk_fraction = 0.02
            per_trade_risk_fraction = 0.01
            use_compounding = true
            base_timeframe = "5m"

            [[strategies]]
            id = "htf_momentum"
            params = { stop_pct = 1.5, days = "Mon,Tue" }
        "#;
        let config: RunConfig = toml::from_str(text).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.risk.use_compounding);
        assert_eq!(config.strategies.len(), 1);
        assert_eq!(
            config.strategies[0].params.get("stop_pct"),
            Some(&ParamValue::Float(1.5))
        );
        assert_eq!(
            config.strategies[0].params.get("days"),
            Some(&ParamValue::Text("Mon,Tue".to_string()))
        );
    }

    #[test]
    fn param_value_coercions() {
        assert_eq!(ParamValue::Int(5).as_f64(), Some(5.0));
        assert_eq!(ParamValue::Float(2.5).as_f64(), Some(2.5));
        assert_eq!(ParamValue::Bool(true).as_f64(), None);
        assert_eq!(ParamValue::Text("x".into()).as_str(), Some("x"));
    }

    #[test]
    fn symbol_filter_permits() {
        let filter = SymbolFilter {
            allowed: Some(vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]),
            blocked: vec!["ETHUSDT".to_string()],
        };
        assert!(filter.permits("BTCUSDT"));
        assert!(!filter.permits("ETHUSDT"));
        assert!(!filter.permits("SOLUSDT"));
        assert!(SymbolFilter::default().permits("anything"));
    }

    #[test]
    fn symbol_meta_defaults_point_value() {
        let meta: SymbolMeta = serde_json::from_value(serde_json::json!({
            "symbol": "BTCUSDT",
            "asset_type": "crypto"
        }))
        .unwrap();
        assert!((meta.point_value - 1.0).abs() < f64::EPSILON);
        assert!(meta.validate().is_ok());
    }

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
