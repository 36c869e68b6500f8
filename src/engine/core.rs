use garde::Validate;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::data::frame::MarketFrame;
use crate::strategies::{self, Strategy};

use super::align::align_frames;
use super::error::EngineError;
use super::event_sim::run_loop;
use super::metrics::{annualization_factor, summarize, EquityTracker, MINUTES_PER_YEAR};
use super::position::PositionManager;
use super::timeframe::Timeframe;
use super::types::{
    BacktestResult, CancelToken, PerformanceSummary, RunConfig, SymbolMeta, TradeRecord,
};

/// One backtest run: a validated configuration bound to a symbol. Separate
/// runs share nothing, so any number may execute on independent threads.
pub struct Backtest {
    config: RunConfig,
    symbol: SymbolMeta,
    cancel: CancelToken,
}

impl Backtest {
    pub fn new(config: RunConfig, symbol: SymbolMeta) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        symbol
            .validate()
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            config,
            symbol,
            cancel: CancelToken::new(),
        })
    }

    /// Clone of the cooperative cancel flag; flipping it makes the loop
    /// close out at the last observed bar and return partial results.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run with strategies built from the configuration's registry ids.
    pub fn run(
        &self,
        frames: &FxHashMap<String, MarketFrame>,
    ) -> Result<BacktestResult, EngineError> {
        let mut built = Vec::with_capacity(self.config.strategies.len());
        for sc in &self.config.strategies {
            built.push(strategies::build(&sc.id, &sc.params)?);
        }
        self.run_with_strategies(frames, built)
    }

    /// Run with pre-built strategy instances, in registration order.
    pub fn run_with_strategies(
        &self,
        frames: &FxHashMap<String, MarketFrame>,
        mut strategies: Vec<Box<dyn Strategy>>,
    ) -> Result<BacktestResult, EngineError> {
        let base = Timeframe::parse(&self.config.base_timeframe)?;
        let timeframes = required_timeframes(base, &strategies)?;

        let window: FxHashMap<String, MarketFrame> = frames
            .iter()
            .map(|(label, frame)| {
                (
                    label.clone(),
                    frame.slice_time(self.config.start_time, self.config.end_time),
                )
            })
            .collect();

        let aligned = align_frames(&window, &timeframes)?;
        tracing::info!(
            symbol = %self.symbol.symbol,
            bars = aligned.len(),
            timeframes = ?timeframes.iter().map(Timeframe::standard).collect::<Vec<_>>(),
            "aligned frame ready"
        );

        let mut manager = PositionManager::new(self.config.risk, self.symbol.point_value);
        let mut tracker = EquityTracker::new(self.config.risk.initial_capital);

        let outcome = run_loop(
            &aligned,
            &mut strategies,
            &mut manager,
            &mut tracker,
            &self.cancel,
        );

        let annualization = annualization_factor(
            base.minutes(),
            self.config
                .minutes_per_trading_year
                .unwrap_or(MINUTES_PER_YEAR),
        );
        let initial = self.config.risk.initial_capital;
        let samples = tracker.into_samples();
        let summary = summarize(&samples, &outcome.trades, initial, annualization);

        let per_strategy = strategies
            .iter()
            .map(|s| {
                let id = s.meta().id;
                (
                    id.to_string(),
                    strategy_summary(id, &outcome.trades, initial, annualization),
                )
            })
            .collect();

        tracing::info!(
            symbol = %self.symbol.symbol,
            trades = outcome.trades.len(),
            rejections = manager.rejections(),
            cancelled = outcome.cancelled,
            final_equity = summary.final_equity,
            "run complete"
        );

        Ok(BacktestResult {
            symbol: self.symbol.symbol.clone(),
            summary,
            per_strategy,
            trade_log: outcome.trades,
            equity_log: samples,
            risk_cap_rejections: manager.rejections(),
            bars_processed: outcome.bars_processed,
            cancelled: outcome.cancelled,
        })
    }
}

/// The union of the run base and every strategy's higher timeframes, sorted
/// ascending. Each strategy's own base must agree with the run base.
fn required_timeframes(
    base: Timeframe,
    strategies: &[Box<dyn Strategy>],
) -> Result<Vec<Timeframe>, EngineError> {
    let mut timeframes = vec![base];
    for strategy in strategies {
        let meta = strategy.meta();
        if meta.base_timeframe().minutes() != base.minutes() {
            return Err(EngineError::InvalidTimeframeOrder(format!(
                "strategy '{}' expects base '{}' but the run uses '{}'",
                meta.id,
                meta.base_timeframe(),
                base
            )));
        }
        for tf in &meta.timeframes[1..] {
            if !timeframes.iter().any(|t| t.minutes() == tf.minutes()) {
                timeframes.push(*tf);
            }
        }
    }
    timeframes.sort_by_key(Timeframe::minutes);
    Ok(timeframes)
}

/// Per-strategy summary over that strategy's closed trades, on a
/// realized-only equity curve sampled at its trade closes.
fn strategy_summary(
    id: &str,
    trades: &[TradeRecord],
    initial_capital: f64,
    annualization: f64,
) -> PerformanceSummary {
    let mine: Vec<TradeRecord> = trades
        .iter()
        .filter(|t| t.strategy == id)
        .cloned()
        .collect();

    let mut tracker = EquityTracker::new(initial_capital);
    for trade in &mine {
        tracker.add_realized(trade.realized_pnl);
        tracker.record_bar(trade.exit_time, 0.0);
    }
    summarize(tracker.samples(), &mine, initial_capital, annualization)
}

/// Replicate one configuration across symbols, in parallel. Runs are fully
/// independent; one failure never poisons its siblings. Symbols refused by
/// the allow/block repository are skipped up front.
pub fn run_many(
    config: &RunConfig,
    runs: Vec<(SymbolMeta, FxHashMap<String, MarketFrame>)>,
) -> Vec<(String, Result<BacktestResult, EngineError>)> {
    runs.into_par_iter()
        .filter_map(|(meta, frames)| {
            let symbol = meta.symbol.clone();
            if !config.symbols.permits(&symbol) {
                tracing::info!(symbol = %symbol, "skipped by symbol filter");
                return None;
            }
            let result = Backtest::new(config.clone(), meta).and_then(|bt| bt.run(&frames));
            Some((symbol, result))
        })
        .collect()
}
