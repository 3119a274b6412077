//! Risk / return metrics for a single daily series.
//!
//! Every function here is total: empty, single-point and degenerate inputs
//! produce the documented sentinel (mostly 0.0) instead of NaN or a panic.
//! Percent-like outputs are decimal fractions (0.12 = 12%).

use blend_core::{AnalysisConfig, BlendResult, DailySeries, WeightVector};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::models::{AnalysisResult, MonthlyReturn};
use crate::returns::{daily_returns, ReturnSeries};
use crate::risk::{
    conditional_value_at_risk, drawdown_curve, drawdown_duration, max_drawdown, ulcer_index,
};

const CALENDAR_DAYS_PER_YEAR: f64 = 365.25;

// Below this a return stream is treated as constant
const MIN_STD_DEV: f64 = 1e-12;

pub struct MetricsEngine;

impl MetricsEngine {
    /// Analyze one series. Fails only on an invalid `config`.
    pub fn analyze(series: &DailySeries, config: &AnalysisConfig) -> BlendResult<AnalysisResult> {
        config.validate()?;
        Ok(compute(series, config, vec![series.id().to_string()], None))
    }

    /// Analyze a blended series, recording the component ids and weights.
    pub fn analyze_blend(
        series: &DailySeries,
        weights: &WeightVector,
        config: &AnalysisConfig,
    ) -> BlendResult<AnalysisResult> {
        config.validate()?;
        let ids = weights.ids().map(str::to_string).collect();
        Ok(compute(series, config, ids, Some(weights.clone())))
    }
}

fn compute(
    series: &DailySeries,
    config: &AnalysisConfig,
    strategy_ids: Vec<String>,
    weights: Option<WeightVector>,
) -> AnalysisResult {
    let capital = config.starting_capital;
    let records = series.records();
    let rs = daily_returns(records, capital, config);

    let final_account_value = series.final_account_value().unwrap_or(capital);
    let total_pl = series.total_pl();
    let days_elapsed = match (series.first_date(), series.last_date()) {
        (Some(first), Some(last)) => (last - first).num_days(),
        _ => 0,
    };

    let curve = drawdown_curve(records, capital);
    let mdd = max_drawdown(&curve);
    let duration = drawdown_duration(&curve);
    let ulcer = ulcer_index(&curve);

    let cagr_value = cagr(capital, final_account_value, days_elapsed);
    let trades = pl_stats(&rs.active_pl);

    AnalysisResult {
        strategy_ids,
        weights,
        start_date: series.first_date(),
        end_date: series.last_date(),
        starting_capital: capital,
        final_account_value,
        total_pl,
        total_return: total_return(capital, final_account_value),
        cagr: cagr_value,
        annual_volatility: annual_volatility(&rs.returns, rs.periods_per_year),
        sharpe_ratio: sharpe_ratio(&rs, config.risk_free_rate),
        sortino_ratio: sortino_ratio(&rs, config.risk_free_rate),
        max_drawdown: mdd.amount,
        max_drawdown_pct: mdd.percent,
        max_drawdown_date: mdd.date,
        max_drawdown_duration_days: duration.max_duration_days,
        time_in_drawdown: duration.time_in_drawdown,
        ulcer_index: ulcer,
        upi: ulcer_performance_index(cagr_value, ulcer),
        cvar: conditional_value_at_risk(&rs.returns, config.confidence_level, capital),
        kelly_criterion: kelly_criterion(&rs.active_pl),
        mar_ratio: mar_ratio(cagr_value, mdd.percent),
        recovery_factor: if mdd.amount < 0.0 { total_pl / mdd.amount.abs() } else { 0.0 },
        win_rate: trades.win_rate,
        profit_factor: trades.profit_factor,
        average_daily_pl: trades.average,
        best_day_pl: trades.best,
        worst_day_pl: trades.worst,
        trading_days: rs.active_days(),
        periods_per_year: rs.periods_per_year,
        monthly_returns: monthly_returns(series, capital),
    }
}

/// final / starting - 1 as a decimal fraction.
pub fn total_return(starting_capital: f64, final_value: f64) -> f64 {
    if starting_capital <= 0.0 {
        return 0.0;
    }
    final_value / starting_capital - 1.0
}

/// (final / initial)^(365.25 / days) - 1.
///
/// 0.0 when `days_elapsed <= 0` or `initial <= 0`; -1.0 when the account
/// ends at or below zero.
pub fn cagr(initial: f64, final_value: f64, days_elapsed: i64) -> f64 {
    if days_elapsed <= 0 || initial <= 0.0 {
        return 0.0;
    }
    if final_value <= 0.0 {
        return -1.0;
    }
    (final_value / initial).powf(CALENDAR_DAYS_PER_YEAR / days_elapsed as f64) - 1.0
}

/// Sample standard deviation, or None when undefined or zero.
fn std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let sd = values.std_dev();
    (sd.is_finite() && sd > MIN_STD_DEV).then_some(sd)
}

pub fn annual_volatility(returns: &[f64], periods_per_year: f64) -> f64 {
    std_dev(returns)
        .map(|sd| sd * periods_per_year.sqrt())
        .unwrap_or(0.0)
}

/// (mean - rf_daily) / std * sqrt(periods). 0.0 when std is zero or undefined.
pub fn sharpe_ratio(rs: &ReturnSeries, risk_free_annual: f64) -> f64 {
    let Some(sd) = std_dev(&rs.returns) else {
        return 0.0;
    };
    let rf_daily = risk_free_annual / rs.periods_per_year;
    (rs.returns.iter().mean() - rf_daily) / sd * rs.periods_per_year.sqrt()
}

/// Same numerator as Sharpe; denominator is the std of negative returns only.
pub fn sortino_ratio(rs: &ReturnSeries, risk_free_annual: f64) -> f64 {
    if rs.returns.is_empty() {
        return 0.0;
    }
    let downside: Vec<f64> = rs.returns.iter().copied().filter(|r| *r < 0.0).collect();
    let Some(downside_dev) = std_dev(&downside) else {
        return 0.0;
    };
    let rf_daily = risk_free_annual / rs.periods_per_year;
    (rs.returns.iter().mean() - rf_daily) / downside_dev * rs.periods_per_year.sqrt()
}

/// annualized return / Ulcer Index; 0.0 when the index is zero.
pub fn ulcer_performance_index(annualized_return: f64, ulcer: f64) -> f64 {
    if ulcer > 0.0 {
        annualized_return / ulcer
    } else {
        0.0
    }
}

/// CAGR / |max drawdown pct|; 0.0 without a drawdown.
pub fn mar_ratio(cagr: f64, max_drawdown_pct: f64) -> f64 {
    if max_drawdown_pct < 0.0 {
        cagr / max_drawdown_pct.abs()
    } else {
        0.0
    }
}

/// Kelly fraction f* = p - (1 - p) / b from per-day P/L, clipped to [0, 1].
///
/// b = average win / average loss magnitude. Zero-P/L days are ignored.
pub fn kelly_criterion(pl: &[f64]) -> f64 {
    let wins: Vec<f64> = pl.iter().copied().filter(|v| *v > 0.0).collect();
    let losses: Vec<f64> = pl.iter().copied().filter(|v| *v < 0.0).map(f64::abs).collect();

    if wins.is_empty() {
        return 0.0;
    }
    if losses.is_empty() {
        return 1.0;
    }

    let p = wins.len() as f64 / (wins.len() + losses.len()) as f64;
    let avg_win = wins.iter().sum::<f64>() / wins.len() as f64;
    let avg_loss = losses.iter().sum::<f64>() / losses.len() as f64;
    let b = avg_win / avg_loss;

    (p - (1.0 - p) / b).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, Default)]
struct PlStats {
    win_rate: f64,
    profit_factor: f64,
    average: f64,
    best: f64,
    worst: f64,
}

fn pl_stats(pl: &[f64]) -> PlStats {
    if pl.is_empty() {
        return PlStats::default();
    }

    let gross_profit: f64 = pl.iter().filter(|v| **v > 0.0).sum();
    let gross_loss: f64 = pl.iter().filter(|v| **v < 0.0).map(|v| v.abs()).sum();
    let wins = pl.iter().filter(|v| **v > 0.0).count();
    let decided = pl.iter().filter(|v| **v != 0.0).count();

    PlStats {
        win_rate: if decided > 0 { wins as f64 / decided as f64 } else { 0.0 },
        profit_factor: if gross_loss > 0.0 { gross_profit / gross_loss } else { 0.0 },
        average: pl.iter().sum::<f64>() / pl.len() as f64,
        best: pl.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        worst: pl.iter().copied().fold(f64::INFINITY, f64::min),
    }
}

/// Calendar-month returns, compounding from each month's opening account value.
///
/// The first month opens at `starting_capital`; later months open at the prior
/// month's last account value.
pub fn monthly_returns(series: &DailySeries, starting_capital: f64) -> Vec<MonthlyReturn> {
    let mut out = Vec::new();
    let mut open = starting_capital;
    let mut current: Option<(i32, u32)> = None;
    let mut last_value = starting_capital;

    for r in series.records() {
        let ym = year_month(r.date);
        match current {
            Some(cur) if cur != ym => {
                out.push(month_return(cur, open, last_value));
                open = last_value;
                current = Some(ym);
            }
            None => current = Some(ym),
            _ => {}
        }
        last_value = r.account_value;
    }

    if let Some(cur) = current {
        out.push(month_return(cur, open, last_value));
    }
    out
}

fn month_return(ym: (i32, u32), open: f64, close: f64) -> MonthlyReturn {
    MonthlyReturn {
        year: ym.0,
        month: ym.1,
        return_pct: if open > 0.0 { close / open - 1.0 } else { 0.0 },
    }
}

fn year_month(date: NaiveDate) -> (i32, u32) {
    (date.year(), date.month())
}

/// Scalar read-outs the optimizer can maximize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    #[default]
    Sharpe,
    Sortino,
    Mar,
    Cagr,
    Upi,
}

impl Objective {
    pub fn as_str(&self) -> &'static str {
        match self {
            Objective::Sharpe => "sharpe",
            Objective::Sortino => "sortino",
            Objective::Mar => "mar",
            Objective::Cagr => "cagr",
            Objective::Upi => "upi",
        }
    }

    /// The metric this objective reads from a result.
    pub fn value(&self, result: &AnalysisResult) -> f64 {
        match self {
            Objective::Sharpe => result.sharpe_ratio,
            Objective::Sortino => result.sortino_ratio,
            Objective::Mar => result.mar_ratio,
            Objective::Cagr => result.cagr,
            Objective::Upi => result.upi,
        }
    }
}

impl std::str::FromStr for Objective {
    type Err = blend_core::BlendError;

    fn from_str(s: &str) -> BlendResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "sharpe" => Ok(Objective::Sharpe),
            "sortino" => Ok(Objective::Sortino),
            "mar" => Ok(Objective::Mar),
            "cagr" => Ok(Objective::Cagr),
            "upi" => Ok(Objective::Upi),
            other => Err(blend_core::BlendError::Configuration(format!(
                "unknown objective '{}'",
                other
            ))),
        }
    }
}
