use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, Utc, Weekday};
use polars::prelude::*;

use crate::engine::error::EngineError;
use crate::engine::timeframe::Timeframe;

/// The canonical timestamp column name used internally after normalization.
pub const TIMESTAMP_COL: &str = "timestamp";
pub const DAY_OF_WEEK_COL: &str = "day_of_week";

const PRICE_COLS: [&str; 4] = ["open", "high", "low", "close"];

/// One OHLCV record for a fixed time window.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
    pub day_of_week: Weekday,
}

impl Bar {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: Option<f64>,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            day_of_week: timestamp.weekday(),
        }
    }

    /// Short weekday tag, `Mon`..`Sun`.
    pub fn day_tag(&self) -> &'static str {
        day_tag(self.day_of_week)
    }

    fn validate(&self) -> Result<(), EngineError> {
        let ordered = self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high;
        if !ordered {
            return Err(EngineError::InvalidBar {
                timestamp: self.timestamp,
                detail: format!(
                    "OHLC out of order (o={}, h={}, l={}, c={})",
                    self.open, self.high, self.low, self.close
                ),
            });
        }
        Ok(())
    }
}

pub fn day_tag(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Mon",
        Weekday::Tue => "Tue",
        Weekday::Wed => "Wed",
        Weekday::Thu => "Thu",
        Weekday::Fri => "Fri",
        Weekday::Sat => "Sat",
        Weekday::Sun => "Sun",
    }
}

pub fn parse_day_tag(tag: &str) -> Option<Weekday> {
    match tag {
        "Mon" => Some(Weekday::Mon),
        "Tue" => Some(Weekday::Tue),
        "Wed" => Some(Weekday::Wed),
        "Thu" => Some(Weekday::Thu),
        "Fri" => Some(Weekday::Fri),
        "Sat" => Some(Weekday::Sat),
        "Sun" => Some(Weekday::Sun),
        _ => None,
    }
}

/// An ordered OHLCV series for one symbol and timeframe, plus any indicator
/// columns the external indicator framework attached to the input frame.
/// Immutable during a run.
#[derive(Debug, Clone)]
pub struct MarketFrame {
    pub timeframe: Timeframe,
    pub bars: Vec<Bar>,
    /// Extra numeric columns, parallel to `bars`. NaN marks a missing value.
    pub indicators: Vec<(String, Vec<f64>)>,
}

impl MarketFrame {
    /// Build a frame from bars, enforcing the bar invariants: OHLC ordering
    /// and strictly increasing timestamps.
    pub fn new(timeframe: Timeframe, bars: Vec<Bar>) -> Result<Self, EngineError> {
        validate_bars(&timeframe, &bars)?;
        Ok(Self {
            timeframe,
            bars,
            indicators: Vec::new(),
        })
    }

    pub fn with_indicator(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.indicators.push((name.into(), values));
        self
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn has_volume(&self) -> bool {
        self.bars.iter().any(|b| b.volume.is_some())
    }

    /// Restrict the frame to bars with `start <= timestamp <= end`.
    pub fn slice_time(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> MarketFrame {
        let keep: Vec<usize> = self
            .bars
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                start.is_none_or(|s| b.timestamp >= s) && end.is_none_or(|e| b.timestamp <= e)
            })
            .map(|(i, _)| i)
            .collect();

        MarketFrame {
            timeframe: self.timeframe,
            bars: keep.iter().map(|&i| self.bars[i].clone()).collect(),
            indicators: self
                .indicators
                .iter()
                .map(|(name, values)| {
                    (name.clone(), keep.iter().map(|&i| values[i]).collect())
                })
                .collect(),
        }
    }

    /// Convert a loader-supplied `DataFrame` into a typed frame.
    ///
    /// Expected columns: `timestamp` (Datetime), `open`/`high`/`low`/`close`
    /// (f64), optional `volume`, optional `day_of_week` (short tags; derived
    /// from the timestamp when absent). Any other f64 column is carried as
    /// an indicator column.
    pub fn from_dataframe(timeframe: Timeframe, df: &DataFrame) -> Result<Self> {
        let n = df.height();
        let ts_col = df.column(TIMESTAMP_COL)?;

        let mut bars = Vec::with_capacity(n);
        let opens = df.column("open")?.f64()?;
        let highs = df.column("high")?.f64()?;
        let lows = df.column("low")?.f64()?;
        let closes = df.column("close")?.f64()?;
        let volumes = if df.schema().contains("volume") {
            Some(df.column("volume")?.f64()?)
        } else {
            None
        };
        let day_tags = if df.schema().contains(DAY_OF_WEEK_COL) {
            Some(df.column(DAY_OF_WEEK_COL)?.str()?)
        } else {
            None
        };

        for i in 0..n {
            let timestamp = extract_timestamp(ts_col, i)?;
            let mut bar = Bar::new(
                timestamp,
                opens.get(i).unwrap_or(f64::NAN),
                highs.get(i).unwrap_or(f64::NAN),
                lows.get(i).unwrap_or(f64::NAN),
                closes.get(i).unwrap_or(f64::NAN),
                volumes.as_ref().and_then(|v| v.get(i)),
            );
            if let Some(day) = day_tags
                .as_ref()
                .and_then(|tags| tags.get(i))
                .and_then(parse_day_tag)
            {
                bar.day_of_week = day;
            }
            bars.push(bar);
        }

        let mut frame = MarketFrame::new(timeframe, bars)?;

        let reserved = [TIMESTAMP_COL, DAY_OF_WEEK_COL, "volume"];
        for col in df.columns() {
            let name = col.name().as_str();
            if reserved.contains(&name) || PRICE_COLS.contains(&name) {
                continue;
            }
            if col.dtype() == &DataType::Float64 {
                let values = col
                    .f64()?
                    .into_iter()
                    .map(|v| v.unwrap_or(f64::NAN))
                    .collect();
                frame = frame.with_indicator(name, values);
            }
        }

        Ok(frame)
    }
}

/// Extract a UTC timestamp from a Datetime column at a given index.
fn extract_timestamp(col: &Column, idx: usize) -> Result<DateTime<Utc>> {
    match col.dtype() {
        DataType::Datetime(tu, _) => {
            let val = col.datetime()?.phys.get(idx);
            match val {
                Some(v) => {
                    let dt = match tu {
                        TimeUnit::Milliseconds => DateTime::from_timestamp_millis(v),
                        TimeUnit::Microseconds => DateTime::from_timestamp_micros(v),
                        TimeUnit::Nanoseconds => {
                            let secs = v / 1_000_000_000;
                            let nsecs = (v % 1_000_000_000) as u32;
                            DateTime::from_timestamp(secs, nsecs)
                        }
                    };
                    dt.ok_or_else(|| anyhow::anyhow!("Invalid timestamp value at index {idx}"))
                }
                None => bail!("Null timestamp at index {idx}"),
            }
        }
        other => bail!("Unsupported timestamp column type: {other:?}"),
    }
}

fn validate_bars(timeframe: &Timeframe, bars: &[Bar]) -> Result<(), EngineError> {
    let mut irregular_gaps = 0usize;
    for (i, bar) in bars.iter().enumerate() {
        bar.validate()?;
        if i > 0 {
            let prev = &bars[i - 1];
            if bar.timestamp <= prev.timestamp {
                return Err(EngineError::InvalidBar {
                    timestamp: bar.timestamp,
                    detail: format!("timestamp not strictly increasing (prev {})", prev.timestamp),
                });
            }
            if (bar.timestamp - prev.timestamp).num_seconds() != timeframe.seconds() {
                irregular_gaps += 1;
            }
        }
    }
    if irregular_gaps > 0 {
        // Calendar gaps (weekends, venue outages) are tolerated; alignment
        // relies on ordering only.
        tracing::warn!(
            timeframe = %timeframe,
            irregular_gaps,
            "bar spacing deviates from the nominal duration"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 8, hour, min, 0).unwrap()
    }

    fn bar(hour: u32, min: u32, close: f64) -> Bar {
        Bar::new(ts(hour, min), close, close + 1.0, close - 1.0, close, None)
    }

    #[test]
    fn frame_accepts_well_formed_bars() {
        let tf = Timeframe::parse("5m").unwrap();
        let frame = MarketFrame::new(tf, vec![bar(8, 0, 100.0), bar(8, 5, 101.0)]).unwrap();
        assert_eq!(frame.len(), 2);
        assert!(!frame.has_volume());
    }

    #[test]
    fn rejects_ohlc_out_of_order() {
        let tf = Timeframe::parse("5m").unwrap();
        let mut bad = bar(8, 0, 100.0);
        bad.low = 100.5; // low above close
        let err = MarketFrame::new(tf, vec![bad]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidBar { .. }));
    }

    #[test]
    fn rejects_nan_prices() {
        let tf = Timeframe::parse("5m").unwrap();
        let mut bad = bar(8, 0, 100.0);
        bad.open = f64::NAN;
        assert!(MarketFrame::new(tf, vec![bad]).is_err());
    }

    #[test]
    fn rejects_non_monotonic_timestamps() {
        let tf = Timeframe::parse("5m").unwrap();
        let err = MarketFrame::new(tf, vec![bar(8, 5, 100.0), bar(8, 0, 101.0)]).unwrap_err();
        match err {
            EngineError::InvalidBar { detail, .. } => {
                assert!(detail.contains("strictly increasing"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn day_of_week_derived_from_timestamp() {
        // 2024-01-08 is a Monday.
        let b = bar(8, 0, 100.0);
        assert_eq!(b.day_of_week, Weekday::Mon);
        assert_eq!(b.day_tag(), "Mon");
        assert_eq!(parse_day_tag("Mon"), Some(Weekday::Mon));
        assert_eq!(parse_day_tag("mon"), None);
    }

    #[test]
    fn slice_time_keeps_indicators_parallel() {
        let tf = Timeframe::parse("5m").unwrap();
        let frame = MarketFrame::new(
            tf,
            vec![bar(8, 0, 100.0), bar(8, 5, 101.0), bar(8, 10, 102.0)],
        )
        .unwrap()
        .with_indicator("rsi", vec![10.0, 20.0, 30.0]);

        let sliced = frame.slice_time(Some(ts(8, 5)), None);
        assert_eq!(sliced.len(), 2);
        assert_eq!(sliced.indicators[0].1, vec![20.0, 30.0]);
    }

    #[test]
    fn from_dataframe_extracts_bars_and_indicators() {
        let timestamps: Vec<chrono::NaiveDateTime> = (0..3)
            .map(|i| ts(8, i * 5).naive_utc())
            .collect();
        let df = df!(
            TIMESTAMP_COL => timestamps,
            "open" => [100.0, 101.0, 102.0],
            "high" => [101.0, 102.0, 103.0],
            "low" => [99.0, 100.0, 101.0],
            "close" => [100.5, 101.5, 102.5],
            "volume" => [10.0, 11.0, 12.0],
            "ema_20" => [100.1, 100.9, 101.8],
        )
        .unwrap();

        let tf = Timeframe::parse("5m").unwrap();
        let frame = MarketFrame::from_dataframe(tf, &df).unwrap();
        assert_eq!(frame.len(), 3);
        assert!(frame.has_volume());
        assert_eq!(frame.bars[1].close, 101.5);
        assert_eq!(frame.bars[2].timestamp, ts(8, 10));
        assert_eq!(frame.indicators.len(), 1);
        assert_eq!(frame.indicators[0].0, "ema_20");
        assert_eq!(frame.indicators[0].1[2], 101.8);
    }
}
