use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure modes of the simulation core. Everything here is fatal to the run
/// except `InvalidStop`, which discards the offending signal and continues.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid timeframe label '{0}'")]
    InvalidTimeframe(String),

    #[error("no market data supplied")]
    EmptyData,

    #[error("no market data for timeframe '{0}'")]
    MissingTimeframeData(String),

    #[error("timeframes must be ordered by ascending duration with the base first: {0}")]
    InvalidTimeframeOrder(String),

    #[error("cannot size position: {detail} (entry {entry})")]
    InvalidStop { entry: f64, detail: String },

    #[error("invalid bar at {timestamp}: {detail}")]
    InvalidBar {
        timestamp: DateTime<Utc>,
        detail: String,
    },

    #[error("unknown strategy '{0}'")]
    UnknownStrategy(String),

    #[error("invalid parameter for strategy '{strategy}': {detail}")]
    InvalidParameter { strategy: String, detail: String },

    #[error("invalid run configuration: {0}")]
    InvalidConfig(String),
}

/// An error raised inside a strategy callback. The engine catches these at
/// the protocol boundary and demotes them to "no signal" / "no exit" so one
/// misbehaving strategy cannot poison a multi-strategy run.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StrategyError {
    pub message: String,
}

impl StrategyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
