use blend_core::{AnalysisConfig, DailyRecord};
use chrono::NaiveDate;

/// Fallback annualization factor when a series has too few active days.
pub const DEFAULT_PERIODS_PER_YEAR: f64 = 252.0;

const DAYS_PER_YEAR: f64 = 365.25;

/// Daily returns over the active days of a series.
#[derive(Debug, Clone, Default)]
pub struct ReturnSeries {
    /// Date of each return (the later day of each pct-change pair)
    pub dates: Vec<NaiveDate>,
    pub returns: Vec<f64>,
    /// P/L of every active day, in date order
    pub active_pl: Vec<f64>,
    pub active_dates: Vec<NaiveDate>,
    pub periods_per_year: f64,
}

impl ReturnSeries {
    pub fn active_days(&self) -> usize {
        self.active_dates.len()
    }
}

/// Which records count as trading days.
///
/// Without the filter every record is active. With it, a day is active when it
/// has non-zero P/L and, if `sma_window > 0`, the previous day's account value
/// sits at or above the SMA of the `sma_window` account values before today.
/// Days before the window fills pass the gate.
pub fn active_mask(records: &[DailyRecord], config: &AnalysisConfig) -> Vec<bool> {
    if !config.use_trading_filter {
        return vec![true; records.len()];
    }

    let values: Vec<f64> = records.iter().map(|r| r.account_value).collect();
    records
        .iter()
        .enumerate()
        .map(|(i, r)| r.pl != 0.0 && passes_sma_gate(&values, i, config.sma_window))
        .collect()
}

fn passes_sma_gate(values: &[f64], i: usize, window: usize) -> bool {
    if window == 0 || i < window {
        return true;
    }
    let prior = &values[i - window..i];
    let sma = prior.iter().sum::<f64>() / window as f64;
    values[i - 1] >= sma
}

/// Pct-change of account value between consecutive active days.
///
/// The first active day is measured against `starting_capital`. A base value
/// that is not positive yields no return for that step.
pub fn daily_returns(
    records: &[DailyRecord],
    starting_capital: f64,
    config: &AnalysisConfig,
) -> ReturnSeries {
    let mask = active_mask(records, config);

    let mut out = ReturnSeries::default();
    let mut base = starting_capital;

    for (record, active) in records.iter().zip(mask) {
        if !active {
            continue;
        }
        out.active_pl.push(record.pl);
        out.active_dates.push(record.date);
        if base > 0.0 {
            out.returns.push(record.account_value / base - 1.0);
            out.dates.push(record.date);
        }
        base = record.account_value;
    }

    out.periods_per_year = periods_per_year(&out.active_dates);
    out
}

/// Active trading days per calendar year observed in `active_dates`.
///
/// Falls back to [`DEFAULT_PERIODS_PER_YEAR`] with fewer than two active days.
pub fn periods_per_year(active_dates: &[NaiveDate]) -> f64 {
    let (Some(first), Some(last)) = (active_dates.first(), active_dates.last()) else {
        return DEFAULT_PERIODS_PER_YEAR;
    };
    if active_dates.len() < 2 {
        return DEFAULT_PERIODS_PER_YEAR;
    }

    let span_days = (*last - *first).num_days() + 1;
    if span_days <= 0 {
        return DEFAULT_PERIODS_PER_YEAR;
    }

    active_dates.len() as f64 * DAYS_PER_YEAR / span_days as f64
}
