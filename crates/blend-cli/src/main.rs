//! blend: analyze, correlate and optimize strategy P/L series from CSV files.
//!
//! Usage:
//!   blend analyze es.csv nq.csv --weights es=1,nq=0.5
//!   blend correlate es.csv nq.csv cl.csv
//!   blend optimize es.csv nq.csv cl.csv --objective sharpe --timeout-secs 60

mod args;
mod loader;

use std::sync::Arc;

use anyhow::{Context, Result};
use blend_analytics::{blend, blend_equal, correlation_matrix_for_series, MetricsEngine};
use blend_core::{AnalysisConfig, DailySeries, InMemorySeriesStore};
use blend_optimizer::{CacheSettings, CancelToken, OptimizationCache, PortfolioOptimizer};

use crate::args::{CliArgs, Command, USAGE};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let raw: Vec<String> = std::env::args().skip(1).collect();
    if raw.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = AnalysisConfig::from_env().context("invalid BLEND_* environment")?;
    let cli = match args::parse(&raw, config) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("error: {:#}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    let series = loader::load_all(&cli.files)?;
    tracing::info!(
        strategies = series.len(),
        command = ?cli.command,
        "Loaded strategy series"
    );

    let output = match cli.command {
        Command::Analyze => analyze(&cli, &series)?,
        Command::Correlate => serde_json::to_value(correlation_matrix_for_series(&series)?)?,
        Command::Optimize => optimize(cli, series).await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn init_tracing() {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("blend=info,blend_optimizer=info")
            })
    };
    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // Logs go to stderr so stdout stays valid JSON
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(filter())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter())
            .init();
    }
}

fn analyze(cli: &CliArgs, series: &[DailySeries]) -> Result<serde_json::Value> {
    // Account values are re-derived from --capital, even for a single file
    let blended = match &cli.weights {
        Some(weights) => blend(series, weights, cli.config.starting_capital)?,
        None => blend_equal(series, cli.config.starting_capital)?,
    };
    let result = MetricsEngine::analyze_blend(&blended.series, &blended.weights, &cli.config)?;
    Ok(serde_json::to_value(result)?)
}

async fn optimize(cli: CliArgs, series: Vec<DailySeries>) -> Result<serde_json::Value> {
    let ids: Vec<String> = series.iter().map(|s| s.id().to_string()).collect();
    let store = Arc::new(InMemorySeriesStore::new());
    for s in series {
        store.insert(s);
    }
    let cache = Arc::new(OptimizationCache::new(CacheSettings::default())?);
    let service = Arc::new(PortfolioOptimizer::new(
        store,
        cache,
        cli.settings.clone(),
        cli.config.clone(),
    )?);

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping search after the current generation");
            on_interrupt.cancel();
        }
    });

    // The search is CPU-bound; keep it off the async workers
    let worker = Arc::clone(&service);
    let worker_ids = ids.clone();
    let optimized = tokio::task::spawn_blocking(move || {
        let refs: Vec<&str> = worker_ids.iter().map(String::as_str).collect();
        worker.optimize(&refs, &cancel)
    })
    .await
    .context("optimizer thread panicked")??;

    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let analysis = service.analyze(&refs, Some(&optimized.weights))?;

    Ok(serde_json::json!({
        "optimization": optimized,
        "analysis": analysis,
    }))
}
