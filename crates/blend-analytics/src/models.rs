use blend_core::WeightVector;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Snapshot of every derived metric for one (strategies, weights, config) tuple.
///
/// Created once per analysis and never mutated; a change of inputs produces a
/// new result. Percent-like fields are decimal fractions, never x100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub strategy_ids: Vec<String>,
    /// Present for blended portfolios
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<WeightVector>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,

    pub starting_capital: f64,
    pub final_account_value: f64,
    pub total_pl: f64,
    pub total_return: f64,
    pub cagr: f64,
    pub annual_volatility: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,

    /// Dollar drawdown from the running peak (<= 0)
    pub max_drawdown: f64,
    /// Fractional drawdown from the running peak (<= 0)
    pub max_drawdown_pct: f64,
    pub max_drawdown_date: Option<NaiveDate>,
    pub max_drawdown_duration_days: i64,
    pub time_in_drawdown: f64,
    pub ulcer_index: f64,
    pub upi: f64,
    /// Expected shortfall in dollars (negative = expected loss)
    pub cvar: f64,
    pub kelly_criterion: f64,
    pub mar_ratio: f64,
    pub recovery_factor: f64,

    pub win_rate: f64,
    pub profit_factor: f64,
    pub average_daily_pl: f64,
    pub best_day_pl: f64,
    pub worst_day_pl: f64,
    pub trading_days: usize,
    /// Annualization factor actually used
    pub periods_per_year: f64,

    pub monthly_returns: Vec<MonthlyReturn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonthlyReturn {
    pub year: i32,
    pub month: u32,
    pub return_pct: f64,
}
