use blend_core::DailyRecord;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Distance from the running peak on one date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrawdownPoint {
    pub date: NaiveDate,
    /// value - peak (<= 0)
    pub amount: f64,
    /// (value - peak) / peak (<= 0), decimal fraction
    pub percent: f64,
}

/// Worst drawdown of a series. Both fields are <= 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MaxDrawdown {
    pub amount: f64,
    pub amount_date: Option<NaiveDate>,
    pub percent: f64,
    pub date: Option<NaiveDate>,
}

/// Running-peak drawdown for every record. The peak starts at `starting_capital`.
pub fn drawdown_curve(records: &[DailyRecord], starting_capital: f64) -> Vec<DrawdownPoint> {
    let mut peak = starting_capital;
    records
        .iter()
        .map(|r| {
            if r.account_value > peak {
                peak = r.account_value;
            }
            let amount = r.account_value - peak;
            let percent = if peak > 0.0 { amount / peak } else { 0.0 };
            DrawdownPoint {
                date: r.date,
                amount,
                percent,
            }
        })
        .collect()
}

/// Most negative amount and percent drawdown. Ties keep the earliest date.
pub fn max_drawdown(curve: &[DrawdownPoint]) -> MaxDrawdown {
    let mut worst = MaxDrawdown::default();
    for p in curve {
        if p.amount < worst.amount {
            worst.amount = p.amount;
            worst.amount_date = Some(p.date);
        }
        if p.percent < worst.percent {
            worst.percent = p.percent;
            worst.date = Some(p.date);
        }
    }
    worst
}

/// Ulcer Index - sqrt(mean(DD_i^2)) over every point, DD as a decimal fraction.
pub fn ulcer_index(curve: &[DrawdownPoint]) -> f64 {
    if curve.is_empty() {
        return 0.0;
    }
    let mean_sq = curve.iter().map(|p| p.percent.powi(2)).sum::<f64>() / curve.len() as f64;
    mean_sq.sqrt()
}

/// Time spent under water.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DrawdownDuration {
    /// Longest calendar span from the first day under a peak to recovery
    /// (or to the last date if still under water).
    pub max_duration_days: i64,
    /// Fraction of points below the running peak.
    pub time_in_drawdown: f64,
}

pub fn drawdown_duration(curve: &[DrawdownPoint]) -> DrawdownDuration {
    if curve.is_empty() {
        return DrawdownDuration::default();
    }

    let mut longest = 0i64;
    let mut started: Option<NaiveDate> = None;
    let mut under = 0usize;

    for p in curve {
        if p.amount < 0.0 {
            under += 1;
            started.get_or_insert(p.date);
        } else if let Some(start) = started.take() {
            longest = longest.max((p.date - start).num_days());
        }
    }

    // Ongoing drawdown at the end of the series
    if let (Some(start), Some(last)) = (started, curve.last()) {
        longest = longest.max((last.date - start).num_days());
    }

    DrawdownDuration {
        max_duration_days: longest,
        time_in_drawdown: under as f64 / curve.len() as f64,
    }
}

/// Conditional Value at Risk (expected shortfall) in dollars.
///
/// Mean of the worst `ceil(n * confidence_level)` daily returns, scaled by
/// `starting_capital`. Negative means an expected loss. Empty input or an
/// empty tail gives 0.0.
pub fn conditional_value_at_risk(
    returns: &[f64],
    confidence_level: f64,
    starting_capital: f64,
) -> f64 {
    let mut sorted: Vec<f64> = returns.iter().copied().filter(|r| r.is_finite()).collect();
    if sorted.is_empty() || !(confidence_level > 0.0) {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let n_tail = ((sorted.len() as f64 * confidence_level).ceil() as usize).min(sorted.len());
    if n_tail == 0 {
        return 0.0;
    }

    let tail = &sorted[..n_tail];
    tail.iter().sum::<f64>() / n_tail as f64 * starting_capital
}
