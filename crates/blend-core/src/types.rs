use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{BlendError, BlendResult};

/// One trading day of a strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyRecord {
    pub date: NaiveDate,
    /// P/L realised on this day, in dollars
    pub pl: f64,
    pub cumulative_pl: f64,
    pub account_value: f64,
}

impl DailyRecord {
    pub fn new(date: NaiveDate, pl: f64, cumulative_pl: f64, account_value: f64) -> Self {
        Self {
            date,
            pl,
            cumulative_pl,
            account_value,
        }
    }
}

/// Ordered daily records for one strategy.
///
/// Dates are unique and strictly increasing; every numeric column is finite.
/// Construction goes through [`DailySeries::new`] so the invariant holds for
/// every value the engine sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSeries")]
pub struct DailySeries {
    id: String,
    records: Vec<DailyRecord>,
}

#[derive(Deserialize)]
struct RawSeries {
    id: String,
    records: Vec<DailyRecord>,
}

impl TryFrom<RawSeries> for DailySeries {
    type Error = BlendError;

    fn try_from(raw: RawSeries) -> BlendResult<Self> {
        DailySeries::new(raw.id, raw.records)
    }
}

impl DailySeries {
    pub fn new(id: impl Into<String>, records: Vec<DailyRecord>) -> BlendResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(BlendError::InvalidSeries("strategy id is empty".to_string()));
        }

        for pair in records.windows(2) {
            if pair[1].date <= pair[0].date {
                return Err(BlendError::InvalidSeries(format!(
                    "{}: dates must be strictly increasing ({} follows {})",
                    id, pair[1].date, pair[0].date
                )));
            }
        }

        if let Some(bad) = records.iter().find(|r| {
            !(r.pl.is_finite() && r.cumulative_pl.is_finite() && r.account_value.is_finite())
        }) {
            return Err(BlendError::InvalidSeries(format!(
                "{}: non-finite value on {}",
                id, bad.date
            )));
        }

        Ok(Self { id, records })
    }

    /// Build a series from a daily P/L stream, deriving cumulative P/L and
    /// account value from `starting_capital`.
    pub fn from_pl(
        id: impl Into<String>,
        starting_capital: f64,
        days: impl IntoIterator<Item = (NaiveDate, f64)>,
    ) -> BlendResult<Self> {
        let mut cumulative = 0.0;
        let records = days
            .into_iter()
            .map(|(date, pl)| {
                cumulative += pl;
                DailyRecord::new(date, pl, cumulative, starting_capital + cumulative)
            })
            .collect();
        Self::new(id, records)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn records(&self) -> &[DailyRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.records.first().map(|r| r.date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.records.last().map(|r| r.date)
    }

    pub fn final_account_value(&self) -> Option<f64> {
        self.records.last().map(|r| r.account_value)
    }

    /// Sum of daily P/L.
    pub fn total_pl(&self) -> f64 {
        self.records.iter().map(|r| r.pl).sum()
    }

    pub fn pl_values(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.pl).collect()
    }

    pub fn account_values(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.account_value).collect()
    }
}

/// Per-strategy scale multipliers.
///
/// A weight is a multiplier on the strategy's dollar P/L, not a share of
/// capital: 1.0 means "the full strategy", 2.0 doubles it, 0.0 removes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightVector(BTreeMap<String, f64>);

impl WeightVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full weight (1.0) for every strategy. Never 1/N.
    pub fn equal<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(ids.into_iter().map(|id| (id.into(), 1.0)).collect())
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self(pairs.into_iter().map(|(id, w)| (id.into(), w)).collect())
    }

    pub fn set(&mut self, id: impl Into<String>, weight: f64) {
        self.0.insert(id.into(), weight);
    }

    pub fn get(&self, id: &str) -> Option<f64> {
        self.0.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Weights ordered like `ids`. Fails unless the key set equals `ids` exactly.
    pub fn aligned_to(&self, ids: &[&str]) -> BlendResult<Vec<f64>> {
        if self.0.len() != ids.len() {
            return Err(BlendError::Configuration(format!(
                "weight vector has {} entries but {} strategies are being blended",
                self.0.len(),
                ids.len()
            )));
        }

        ids.iter()
            .map(|id| {
                let w = self.get(id).ok_or_else(|| {
                    BlendError::Configuration(format!("no weight given for strategy '{}'", id))
                })?;
                if !w.is_finite() {
                    return Err(BlendError::Configuration(format!(
                        "weight for '{}' is not finite",
                        id
                    )));
                }
                Ok(w)
            })
            .collect()
    }
}

/// How weights are chosen when a blend is requested
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightingMethod {
    #[default]
    Equal,
    Custom,
}

impl WeightingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            WeightingMethod::Equal => "equal",
            WeightingMethod::Custom => "custom",
        }
    }
}

impl std::str::FromStr for WeightingMethod {
    type Err = BlendError;

    fn from_str(s: &str) -> BlendResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "equal" => Ok(WeightingMethod::Equal),
            "custom" => Ok(WeightingMethod::Custom),
            other => Err(BlendError::Configuration(format!(
                "unknown weighting method '{}' (expected equal or custom)",
                other
            ))),
        }
    }
}

/// Resolve the weight vector for a blend request.
///
/// `Equal` ignores `custom` and gives every strategy 1.0. `Custom` requires a
/// vector whose keys match `ids` exactly.
pub fn resolve_weights(
    method: WeightingMethod,
    ids: &[&str],
    custom: Option<&WeightVector>,
) -> BlendResult<WeightVector> {
    match method {
        WeightingMethod::Equal => Ok(WeightVector::equal(ids.iter().copied())),
        WeightingMethod::Custom => {
            let weights = custom.ok_or_else(|| {
                BlendError::Configuration("custom weighting requires a weight vector".to_string())
            })?;
            weights.aligned_to(ids)?;
            Ok(weights.clone())
        }
    }
}
