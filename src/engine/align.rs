use chrono::{DateTime, Duration, Utc, Weekday};
use rustc_hash::FxHashMap;

use super::error::EngineError;
use super::timeframe::{are_equivalent, Timeframe};
use crate::data::frame::{Bar, MarketFrame};

/// The merged view the engine steps over: base-timeframe bars carrying, for
/// every higher timeframe, the columns of the most recent *closed* bar of
/// that timeframe. Base columns are unprefixed; higher-timeframe columns are
/// prefixed with the source timeframe's standard label (`h1_close`).
#[derive(Debug, Clone)]
pub struct AlignedFrame {
    base: Timeframe,
    bars: Vec<Bar>,
    names: Vec<String>,
    index: FxHashMap<String, usize>,
    columns: Vec<Vec<f64>>,
}

impl AlignedFrame {
    pub fn base_timeframe(&self) -> Timeframe {
        self.base
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.index.get(name).map(|&i| self.columns[i].as_slice())
    }

    pub fn bar(&self, row: usize) -> &Bar {
        &self.bars[row]
    }

    pub fn row(&self, row: usize) -> AlignedRow<'_> {
        AlignedRow { frame: self, row }
    }

    fn push_column(&mut self, name: String, values: Vec<f64>) {
        debug_assert_eq!(values.len(), self.bars.len());
        self.index.insert(name.clone(), self.columns.len());
        self.names.push(name);
        self.columns.push(values);
    }
}

/// A read-only view of one aligned row. This is all a strategy sees of the
/// market on a given bar: only values known at the close of that bar.
#[derive(Debug, Clone, Copy)]
pub struct AlignedRow<'a> {
    frame: &'a AlignedFrame,
    row: usize,
}

impl AlignedRow<'_> {
    pub fn index(&self) -> usize {
        self.row
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.frame.bars[self.row].timestamp
    }

    pub fn day_of_week(&self) -> Weekday {
        self.frame.bars[self.row].day_of_week
    }

    pub fn bar(&self) -> &Bar {
        &self.frame.bars[self.row]
    }

    /// Value of a named column at this row. `None` when the column does not
    /// exist or the value is missing.
    pub fn get(&self, name: &str) -> Option<f64> {
        let value = *self.frame.column(name)?.get(self.row)?;
        if value.is_nan() {
            None
        } else {
            Some(value)
        }
    }

    pub fn open(&self) -> f64 {
        self.bar().open
    }

    pub fn high(&self) -> f64 {
        self.bar().high
    }

    pub fn low(&self) -> f64 {
        self.bar().low
    }

    pub fn close(&self) -> f64 {
        self.bar().close
    }
}

/// Merge per-timeframe frames into one base-timeframe frame.
///
/// `timeframes` is ordered with the base (shortest) first. For each base row
/// at time `t` and each higher timeframe, the attached bar is the latest one
/// that has fully closed as of `t`: its open timestamp `u` satisfies
/// `u + duration <= t`, so a row sitting exactly on a higher-timeframe
/// boundary sees the previous bar, never the one opening there. Leading base
/// rows for which some higher timeframe has no closed bar yet are dropped.
pub fn align_frames(
    frames: &FxHashMap<String, MarketFrame>,
    timeframes: &[Timeframe],
) -> Result<AlignedFrame, EngineError> {
    if timeframes.is_empty() || frames.is_empty() {
        return Err(EngineError::EmptyData);
    }

    for pair in timeframes.windows(2) {
        if pair[1].minutes() <= pair[0].minutes() {
            return Err(EngineError::InvalidTimeframeOrder(format!(
                "'{}' does not ascend from '{}'",
                pair[1], pair[0]
            )));
        }
    }

    let base_tf = timeframes[0];
    let base = lookup_frame(frames, base_tf)?;
    if base.is_empty() {
        return Err(EngineError::EmptyData);
    }

    let higher: Vec<(&Timeframe, &MarketFrame)> = timeframes[1..]
        .iter()
        .map(|tf| lookup_frame(frames, *tf).map(|f| (tf, f)))
        .collect::<Result<_, _>>()?;

    // For each higher timeframe, the index of the last closed bar per base
    // row. The attachment pointer only moves forward because both series are
    // strictly increasing in time.
    let mut attachments: Vec<Vec<Option<usize>>> = Vec::with_capacity(higher.len());
    for (tf, frame) in &higher {
        let duration = Duration::seconds(tf.seconds());
        let mut attached = Vec::with_capacity(base.len());
        let mut j: Option<usize> = None;
        for bar in &base.bars {
            let mut next = j.map_or(0, |v| v + 1);
            while next < frame.len() && frame.bars[next].timestamp + duration <= bar.timestamp {
                j = Some(next);
                next += 1;
            }
            attached.push(j);
        }
        attachments.push(attached);
    }

    // Drop leading rows until every higher timeframe has a closed bar.
    let offset = (0..base.len())
        .find(|&row| attachments.iter().all(|a| a[row].is_some()))
        .unwrap_or(base.len());

    let bars: Vec<Bar> = base.bars[offset..].to_vec();
    let n = bars.len();

    let mut aligned = AlignedFrame {
        base: base_tf,
        bars,
        names: Vec::new(),
        index: FxHashMap::default(),
        columns: Vec::new(),
    };

    push_frame_columns(&mut aligned, base, "", |row| Some(offset + row), n);

    for (tf_idx, &(tf, frame)) in higher.iter().enumerate() {
        let prefix = format!("{}_", tf.standard());
        let attached = &attachments[tf_idx];
        push_frame_columns(&mut aligned, frame, &prefix, |row| attached[offset + row], n);
    }

    Ok(aligned)
}

fn lookup_frame<'a>(
    frames: &'a FxHashMap<String, MarketFrame>,
    tf: Timeframe,
) -> Result<&'a MarketFrame, EngineError> {
    let standard = tf.standard();
    frames
        .iter()
        .find(|(label, _)| are_equivalent(label, &standard))
        .map(|(_, frame)| frame)
        .ok_or(EngineError::MissingTimeframeData(standard))
}

/// Copy a source frame's columns into the aligned frame under a prefix,
/// indexed through `source_row` (identity for the base, as-of attachment for
/// higher timeframes).
fn push_frame_columns(
    aligned: &mut AlignedFrame,
    frame: &MarketFrame,
    prefix: &str,
    source_row: impl Fn(usize) -> Option<usize>,
    n: usize,
) {
    let gather = |pick: &dyn Fn(&Bar) -> f64| -> Vec<f64> {
        (0..n)
            .map(|row| source_row(row).map_or(f64::NAN, |src| pick(&frame.bars[src])))
            .collect()
    };

    aligned.push_column(format!("{prefix}open"), gather(&|b| b.open));
    aligned.push_column(format!("{prefix}high"), gather(&|b| b.high));
    aligned.push_column(format!("{prefix}low"), gather(&|b| b.low));
    aligned.push_column(format!("{prefix}close"), gather(&|b| b.close));
    if frame.has_volume() {
        aligned.push_column(
            format!("{prefix}volume"),
            gather(&|b| b.volume.unwrap_or(f64::NAN)),
        );
    }
    aligned.push_column(
        format!("{prefix}day_of_week"),
        gather(&|b| f64::from(b.day_of_week.num_days_from_monday())),
    );

    for (name, values) in &frame.indicators {
        let column = (0..n)
            .map(|row| source_row(row).map_or(f64::NAN, |src| values[src]))
            .collect();
        aligned.push_column(format!("{prefix}{name}"), column);
    }
}
