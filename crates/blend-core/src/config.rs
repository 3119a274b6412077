use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BlendError, BlendResult};
use crate::types::WeightingMethod;

/// Parameters of one analysis request.
///
/// All rates are decimal fractions (0.02 = 2%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub weighting_method: WeightingMethod,
    /// Capital the blended (or single) account starts from. Must be > 0.
    pub starting_capital: f64,
    /// Annual risk-free rate used by Sharpe / Sortino.
    pub risk_free_rate: f64,
    /// Trailing window of the account-value SMA gate; 0 disables the gate.
    pub sma_window: usize,
    /// Drop non-trading days (zero P/L, or below the SMA gate) from return series.
    pub use_trading_filter: bool,
    /// Tail fraction for CVaR (0.05 = worst 5% of days).
    pub confidence_level: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            weighting_method: WeightingMethod::Equal,
            starting_capital: 100_000.0,
            risk_free_rate: 0.02,
            sma_window: 20,
            use_trading_filter: false,
            confidence_level: 0.05,
        }
    }
}

impl AnalysisConfig {
    pub fn with_starting_capital(mut self, starting_capital: f64) -> Self {
        self.starting_capital = starting_capital;
        self
    }

    pub fn with_risk_free_rate(mut self, rate: f64) -> Self {
        self.risk_free_rate = rate;
        self
    }

    pub fn with_trading_filter(mut self, enabled: bool, sma_window: usize) -> Self {
        self.use_trading_filter = enabled;
        self.sma_window = sma_window;
        self
    }

    pub fn validate(&self) -> BlendResult<()> {
        if !(self.starting_capital.is_finite() && self.starting_capital > 0.0) {
            return Err(BlendError::Configuration(format!(
                "starting_capital must be > 0, got {}",
                self.starting_capital
            )));
        }
        if !(self.risk_free_rate.is_finite() && self.risk_free_rate >= 0.0) {
            return Err(BlendError::Configuration(format!(
                "risk_free_rate must be >= 0, got {}",
                self.risk_free_rate
            )));
        }
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(BlendError::Configuration(format!(
                "confidence_level must be in (0, 1), got {}",
                self.confidence_level
            )));
        }
        Ok(())
    }

    /// Load from `BLEND_*` environment variables, falling back to defaults.
    pub fn from_env() -> BlendResult<Self> {
        let defaults = Self::default();
        let config = Self {
            weighting_method: env_or("BLEND_WEIGHTING_METHOD", defaults.weighting_method)?,
            starting_capital: env_or("BLEND_STARTING_CAPITAL", defaults.starting_capital)?,
            risk_free_rate: env_or("BLEND_RISK_FREE_RATE", defaults.risk_free_rate)?,
            sma_window: env_or("BLEND_SMA_WINDOW", defaults.sma_window)?,
            use_trading_filter: env_or("BLEND_USE_TRADING_FILTER", defaults.use_trading_filter)?,
            confidence_level: env_or("BLEND_CONFIDENCE_LEVEL", defaults.confidence_level)?,
        };
        config.validate()?;
        Ok(config)
    }
}

fn env_or<T>(name: &str, default: T) -> BlendResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| BlendError::Configuration(format!("{}={}: {}", name, raw, e))),
        Err(_) => Ok(default),
    }
}
