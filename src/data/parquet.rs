use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use polars::prelude::*;

use super::frame::TIMESTAMP_COL;
use super::MarketStore;
use crate::engine::timeframe::Timeframe;

/// Parquet-backed OHLCV store: one file per symbol and timeframe, named
/// `<symbol>_<db-label>.parquet` (e.g. `BTCUSDT_5m.parquet`).
pub struct ParquetStore {
    dir: PathBuf,
}

impl ParquetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_path(&self, symbol: &str, timeframe: &Timeframe) -> PathBuf {
        self.dir
            .join(format!("{symbol}_{}.parquet", timeframe.db()))
    }
}

/// Column names accepted as the time axis of a raw OHLCV file, in lookup
/// order. Whatever is found ends up as a Datetime column named `timestamp`.
const TIME_COLUMN_CANDIDATES: [&str; 4] = [TIMESTAMP_COL, "time", "datetime", "date"];

/// Normalize the time column to a Datetime column named `timestamp`.
/// Date and string columns are widened through a cast chain (strings parse
/// as dates, dates land at midnight); frames without any recognizable time
/// column pass through untouched for ingestion to reject.
pub fn normalize_timestamp(df: DataFrame) -> Result<DataFrame> {
    let Some(source) = TIME_COLUMN_CANDIDATES
        .iter()
        .copied()
        .find(|name| df.schema().contains(name))
    else {
        return Ok(df);
    };

    let widened = match df.column(source)?.dtype() {
        DataType::Datetime(_, _) => col(source),
        DataType::Date => col(source).cast(DataType::Datetime(TimeUnit::Microseconds, None)),
        DataType::String => col(source)
            .cast(DataType::Date)
            .cast(DataType::Datetime(TimeUnit::Microseconds, None)),
        other => bail!("time column '{source}' has unsupported type {other:?}"),
    };

    let normalized = df
        .lazy()
        .with_column(widened.alias(TIMESTAMP_COL))
        .collect()?;
    if source == TIMESTAMP_COL {
        Ok(normalized)
    } else {
        Ok(normalized.drop(source)?)
    }
}

impl MarketStore for ParquetStore {
    fn load_ohlcv(
        &self,
        symbol: &str,
        timeframe: &Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<DataFrame> {
        let path = self.file_path(symbol, timeframe);
        let path_str = path.to_string_lossy().to_string();
        let df = LazyFrame::scan_parquet(path_str.as_str().into(), ScanArgsParquet::default())?
            .collect()
            .with_context(|| format!("Failed to read Parquet file {}", path.display()))?;

        let mut df = normalize_timestamp(df)?;

        if df.schema().contains(TIMESTAMP_COL) {
            if let Some(start) = start {
                df = df
                    .lazy()
                    .filter(col(TIMESTAMP_COL).gt_eq(lit(start.naive_utc())))
                    .collect()?;
            }
            if let Some(end) = end {
                df = df
                    .lazy()
                    .filter(col(TIMESTAMP_COL).lt_eq(lit(end.naive_utc())))
                    .collect()?;
            }
        }

        Ok(df)
    }

    fn list_symbols(&self) -> Result<Vec<String>> {
        let mut symbols = BTreeSet::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read data dir {}", self.dir.display()))?
        {
            let entry = entry?;
            if let Some(symbol) = symbol_from_file(&entry.path()) {
                symbols.insert(symbol);
            }
        }
        Ok(symbols.into_iter().collect())
    }
}

/// `BTCUSDT_5m.parquet` -> `BTCUSDT`. Files without a parseable timeframe
/// suffix are ignored.
fn symbol_from_file(path: &Path) -> Option<String> {
    if path.extension()?.to_str()? != "parquet" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (symbol, tf_label) = stem.rsplit_once('_')?;
    if symbol.is_empty() || Timeframe::parse(tf_label).is_err() {
        return None;
    }
    Some(symbol.to_string())
}
