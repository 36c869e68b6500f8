use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use polars::prelude::*;

use super::types::TradeRecord;

/// Assemble the trade log as a `DataFrame` with the fixed export column
/// order. Timestamps are ISO-8601 UTC strings; close reasons use the wire
/// values.
pub fn trade_log_frame(trades: &[TradeRecord]) -> PolarsResult<DataFrame> {
    let iso = |t: &chrono::DateTime<chrono::Utc>| t.to_rfc3339_opts(SecondsFormat::Secs, true);

    df!(
        "strategy" => trades.iter().map(|t| t.strategy.clone()).collect::<Vec<_>>(),
        "side" => trades.iter().map(|t| t.side.label()).collect::<Vec<_>>(),
        "entry_time" => trades.iter().map(|t| iso(&t.entry_time)).collect::<Vec<_>>(),
        "entry_price" => trades.iter().map(|t| t.entry_price).collect::<Vec<_>>(),
        "exit_time" => trades.iter().map(|t| iso(&t.exit_time)).collect::<Vec<_>>(),
        "exit_price" => trades.iter().map(|t| t.exit_price).collect::<Vec<_>>(),
        "initial_size" => trades.iter().map(|t| t.initial_size).collect::<Vec<_>>(),
        "initial_risk" => trades.iter().map(|t| t.initial_risk).collect::<Vec<_>>(),
        "realized_pnl" => trades.iter().map(|t| t.realized_pnl).collect::<Vec<_>>(),
        "r_multiple" => trades.iter().map(|t| t.r_multiple).collect::<Vec<_>>(),
        "close_reason" => trades.iter().map(|t| t.close_reason.wire()).collect::<Vec<_>>(),
        "duration_bars" => trades.iter().map(|t| t.duration_bars).collect::<Vec<_>>(),
    )
}

/// Write the trade log CSV to `path`.
pub fn write_trade_log_csv(path: &Path, trades: &[TradeRecord]) -> Result<()> {
    let mut df = trade_log_frame(trades)
        .with_context(|| format!("Failed to assemble trade log for {}", path.display()))?;
    let mut file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(&mut df)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{CloseReason, Side};
    use chrono::{TimeZone, Utc};

    fn trade() -> TradeRecord {
        TradeRecord {
            strategy: "htf_momentum".to_string(),
            side: Side::Long,
            entry_time: Utc.with_ymd_and_hms(2024, 1, 8, 8, 0, 0).unwrap(),
            entry_price: 15_000.0,
            exit_time: Utc.with_ymd_and_hms(2024, 1, 8, 8, 25, 0).unwrap(),
            exit_price: 14_850.0,
            initial_size: 0.666_666_666_666_666_6,
            initial_risk: 100.0,
            realized_pnl: -100.0,
            r_multiple: -1.0,
            close_reason: CloseReason::StopLoss,
            duration_bars: 5,
            duration_secs: 1_500,
        }
    }

    #[test]
    fn frame_has_fixed_column_order() {
        let df = trade_log_frame(&[trade()]).unwrap();
        let names: Vec<String> = df
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "strategy",
                "side",
                "entry_time",
                "entry_price",
                "exit_time",
                "exit_price",
                "initial_size",
                "initial_risk",
                "realized_pnl",
                "r_multiple",
                "close_reason",
                "duration_bars",
            ]
        );
        assert_eq!(df.height(), 1);
    }

    #[test]
    fn timestamps_are_iso8601_utc() {
        let df = trade_log_frame(&[trade()]).unwrap();
        let entry = df.column("entry_time").unwrap().str().unwrap().get(0);
        assert_eq!(entry, Some("2024-01-08T08:00:00Z"));
    }

    #[test]
    fn close_reason_uses_wire_value() {
        let df = trade_log_frame(&[trade()]).unwrap();
        let reason = df.column("close_reason").unwrap().str().unwrap().get(0);
        assert_eq!(reason, Some("stop_loss"));
    }

    #[test]
    fn csv_round_trip_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.csv");
        write_trade_log_csv(&path, &[trade()]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("strategy,side,entry_time"));
        let row = lines.next().unwrap();
        assert!(row.contains("htf_momentum"));
        assert!(row.contains("long"));
        assert!(row.contains("stop_loss"));
        assert!(row.contains("-100.0"));
    }

    #[test]
    fn empty_trade_log_writes_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        write_trade_log_csv(&path, &[]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1);
    }
}
