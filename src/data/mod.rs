pub mod frame;
pub mod parquet;

use anyhow::Result;
use chrono::{DateTime, Utc};
use polars::prelude::DataFrame;

use crate::engine::timeframe::Timeframe;

/// The market-data loader boundary. Implementations hand the engine raw
/// OHLCV frames; all validation and typing happens at ingestion
/// ([`frame::MarketFrame::from_dataframe`]).
pub trait MarketStore: Send + Sync {
    fn load_ohlcv(
        &self,
        symbol: &str,
        timeframe: &Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<DataFrame>;

    fn list_symbols(&self) -> Result<Vec<String>>;
}
