use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use blend_analytics::Objective;
use blend_core::{AnalysisConfig, WeightVector};
use blend_optimizer::{SearchMethod, SearchSettings};

pub const USAGE: &str = "\
Usage:
  blend analyze   <csv>... [--weights id=w,...] [common options]
  blend correlate <csv>...
  blend optimize  <csv>... [--objective sharpe|sortino|mar|cagr|upi] [--method de|grid]
                           [--seed N] [--max-iterations N] [--upper-bound X]
                           [--timeout-secs N] [common options]

Common options:
  --capital X        starting capital of the blended account
  --risk-free X      annual risk-free rate (decimal)
  --filter           only count trading days (non-zero P/L, SMA gate)
  --sma N            SMA window of the trading filter (0 disables the gate)

CSV columns: date,pl,cumulative_pl,account_value. The file stem is the strategy id.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Analyze,
    Correlate,
    Optimize,
}

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub command: Command,
    pub files: Vec<PathBuf>,
    pub weights: Option<WeightVector>,
    pub settings: SearchSettings,
    pub config: AnalysisConfig,
}

/// Parse arguments (without the program name) on top of `config`.
pub fn parse(args: &[String], mut config: AnalysisConfig) -> Result<CliArgs> {
    let mut iter = args.iter();
    let command = match iter.next().map(String::as_str) {
        Some("analyze") => Command::Analyze,
        Some("correlate") => Command::Correlate,
        Some("optimize") => Command::Optimize,
        Some(other) => bail!("unknown command '{}'", other),
        None => bail!("missing command"),
    };

    let mut files = Vec::new();
    let mut weights = None;
    let mut settings = SearchSettings::default();

    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| anyhow!("{} needs a value", name))
        };
        match arg.as_str() {
            "--weights" => weights = Some(parse_weights(&value("--weights")?)?),
            "--objective" => settings.objective = value("--objective")?.parse::<Objective>()?,
            "--method" => settings.method = value("--method")?.parse::<SearchMethod>()?,
            "--seed" => settings.seed = number(&value("--seed")?, "--seed")?,
            "--max-iterations" => {
                settings.max_iterations = number(&value("--max-iterations")?, "--max-iterations")?
            }
            "--upper-bound" => {
                settings.upper_bound = number(&value("--upper-bound")?, "--upper-bound")?
            }
            "--timeout-secs" => {
                let secs: u64 = number(&value("--timeout-secs")?, "--timeout-secs")?;
                settings.timeout_ms = Some(secs.saturating_mul(1_000));
            }
            "--capital" => config.starting_capital = number(&value("--capital")?, "--capital")?,
            "--risk-free" => config.risk_free_rate = number(&value("--risk-free")?, "--risk-free")?,
            "--sma" => config.sma_window = number(&value("--sma")?, "--sma")?,
            "--filter" => config.use_trading_filter = true,
            flag if flag.starts_with("--") => bail!("unknown option '{}'", flag),
            file => files.push(PathBuf::from(file)),
        }
    }

    if files.is_empty() {
        bail!("no CSV files given");
    }
    if command == Command::Correlate && files.len() < 2 {
        bail!("correlate needs at least two files");
    }
    if weights.is_some() && command != Command::Analyze {
        bail!("--weights only applies to analyze");
    }
    config.validate()?;
    settings.validate()?;

    Ok(CliArgs {
        command,
        files,
        weights,
        settings,
        config,
    })
}

fn number<T>(raw: &str, name: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("{}: invalid value '{}'", name, raw))
}

/// `id=w,id2=w2`
fn parse_weights(raw: &str) -> Result<WeightVector> {
    let mut weights = WeightVector::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (id, w) = part
            .split_once('=')
            .with_context(|| format!("weight '{}' is not id=value", part))?;
        weights.set(id.trim(), number::<f64>(w, "--weights")?);
    }
    if weights.is_empty() {
        bail!("--weights is empty");
    }
    Ok(weights)
}
