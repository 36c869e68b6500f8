use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing_subscriber::{self, EnvFilter};

use crossmarket::data::frame::MarketFrame;
use crossmarket::data::parquet::ParquetStore;
use crossmarket::data::MarketStore;
use crossmarket::engine::core::run_many;
use crossmarket::engine::output::write_trade_log_csv;
use crossmarket::engine::timeframe::Timeframe;
use crossmarket::engine::types::{RunConfig, SymbolMeta};
use crossmarket::strategies;

/// Top-level launcher configuration: where the data lives, which symbols to
/// replay, and the run configuration itself.
#[derive(Debug, Deserialize)]
struct AppConfig {
    data_dir: String,
    #[serde(default)]
    output_dir: Option<String>,
    symbols: Vec<SymbolMeta>,
    run: RunConfig,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "backtest.toml".to_string());
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config {path}"))?;
    let app: AppConfig =
        toml::from_str(&text).with_context(|| format!("Failed to parse config {path}"))?;

    // Every timeframe any configured strategy needs, base first.
    let base = Timeframe::parse(&app.run.base_timeframe)?;
    let mut timeframes = vec![base];
    for sc in &app.run.strategies {
        let meta = strategies::find_meta(&sc.id)
            .ok_or_else(|| anyhow::anyhow!("Unknown strategy '{}'", sc.id))?;
        for tf in &meta.timeframes {
            if !timeframes.iter().any(|t| t.minutes() == tf.minutes()) {
                timeframes.push(*tf);
            }
        }
    }
    timeframes.sort_by_key(Timeframe::minutes);

    let store = ParquetStore::new(&app.data_dir);

    let pb = ProgressBar::new((app.symbols.len() * timeframes.len()) as u64);
    pb.set_style(
        ProgressStyle::with_template("loading {bar:30} {pos}/{len} {msg}")
            .expect("static template"),
    );

    let mut runs = Vec::with_capacity(app.symbols.len());
    for meta in &app.symbols {
        let mut frames = FxHashMap::default();
        for tf in &timeframes {
            pb.set_message(format!("{} {}", meta.symbol, tf.db()));
            let df = store
                .load_ohlcv(&meta.symbol, tf, app.run.start_time, app.run.end_time)
                .with_context(|| format!("Loading {} {}", meta.symbol, tf.db()))?;
            frames.insert(tf.standard(), MarketFrame::from_dataframe(*tf, &df)?);
            pb.inc(1);
        }
        runs.push((meta.clone(), frames));
    }
    pb.finish_and_clear();

    let results = run_many(&app.run, runs);

    for (symbol, result) in &results {
        match result {
            Ok(result) => {
                if let Some(dir) = &app.output_dir {
                    std::fs::create_dir_all(dir)
                        .with_context(|| format!("Creating output dir {dir}"))?;
                    let csv = std::path::Path::new(dir).join(format!("{symbol}_trades.csv"));
                    write_trade_log_csv(&csv, &result.trade_log)?;
                    tracing::info!(symbol = %symbol, path = %csv.display(), "trade log written");
                }
                let report = serde_json::json!({
                    "symbol": symbol,
                    "summary": result.summary,
                    "per_strategy": result.per_strategy,
                    "trades": result.trade_log.len(),
                    "bars_processed": result.bars_processed,
                    "risk_cap_rejections": result.risk_cap_rejections,
                    "cancelled": result.cancelled,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Err(err) => {
                tracing::error!(symbol = %symbol, error = %err, "run failed");
            }
        }
    }

    Ok(())
}
