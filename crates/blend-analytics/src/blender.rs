//! Weighted combination of strategy P/L streams.
//!
//! Blended P/L on a date is the sum of each strategy's P/L times its weight.
//! Cumulative P/L and account value are re-derived from that sum and a single
//! starting capital; component account values are never added together.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use blend_core::{BlendError, BlendResult, DailySeries, WeightVector};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Strategies re-indexed onto the union of their dates.
///
/// A strategy without a record on some date contributes 0 P/L there.
#[derive(Debug, Clone)]
pub struct AlignedBook {
    ids: Vec<String>,
    dates: Vec<NaiveDate>,
    /// pl[strategy][date]
    pl: Vec<Vec<f64>>,
}

impl AlignedBook {
    pub fn new(series: &[DailySeries]) -> BlendResult<Self> {
        if series.is_empty() {
            return Err(BlendError::Configuration(
                "at least one strategy is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = series.iter().find(|s| !seen.insert(s.id())) {
            return Err(BlendError::Configuration(format!(
                "strategy '{}' given more than once",
                dup.id()
            )));
        }

        let axis: BTreeSet<NaiveDate> = series
            .iter()
            .flat_map(|s| s.records().iter().map(|r| r.date))
            .collect();
        let dates: Vec<NaiveDate> = axis.into_iter().collect();
        let index: BTreeMap<NaiveDate, usize> =
            dates.iter().enumerate().map(|(i, d)| (*d, i)).collect();

        let pl = series
            .iter()
            .map(|s| {
                let mut column = vec![0.0; dates.len()];
                for r in s.records() {
                    column[index[&r.date]] = r.pl;
                }
                column
            })
            .collect();

        Ok(Self {
            ids: series.iter().map(|s| s.id().to_string()).collect(),
            dates,
            pl,
        })
    }

    pub fn ids(&self) -> Vec<&str> {
        self.ids.iter().map(String::as_str).collect()
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn strategy_count(&self) -> usize {
        self.ids.len()
    }

    /// P/L column of one strategy on the shared axis.
    pub fn column(&self, index: usize) -> &[f64] {
        &self.pl[index]
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.ids
            .iter()
            .zip(&self.pl)
            .map(|(id, pl)| (id.as_str(), pl.as_slice()))
    }

    /// Blend with weights given in `ids()` order.
    pub fn blend_with(&self, weights: &[f64], starting_capital: f64) -> BlendResult<DailySeries> {
        if weights.len() != self.ids.len() {
            return Err(BlendError::Configuration(format!(
                "expected {} weights, got {}",
                self.ids.len(),
                weights.len()
            )));
        }
        check_capital(starting_capital)?;

        let days = self.dates.iter().enumerate().map(|(d, date)| {
            let pl: f64 = self
                .pl
                .iter()
                .zip(weights)
                .map(|(column, w)| column[d] * w)
                .sum();
            (*date, pl)
        });

        DailySeries::from_pl(blend_id(&self.ids), starting_capital, days.collect::<Vec<_>>())
    }

    /// Blend with a keyed weight vector whose keys must equal the strategy set.
    pub fn blend(
        &self,
        weights: &WeightVector,
        starting_capital: f64,
    ) -> BlendResult<BlendedSeries> {
        let ids = self.ids();
        let aligned = weights.aligned_to(&ids)?;
        let series = self.blend_with(&aligned, starting_capital)?;

        let contributions = self
            .ids
            .iter()
            .zip(&self.pl)
            .zip(&aligned)
            .map(|((id, column), w)| (id.clone(), column.iter().sum::<f64>() * w))
            .collect();

        Ok(BlendedSeries {
            series,
            weights: weights.clone(),
            contributions,
        })
    }
}

/// A synthetic strategy built from weighted components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlendedSeries {
    pub series: DailySeries,
    pub weights: WeightVector,
    /// Weighted total P/L contributed by each strategy
    pub contributions: BTreeMap<String, f64>,
}

impl BlendedSeries {
    pub fn total_pl(&self) -> f64 {
        self.series.total_pl()
    }
}

/// Blend `series` under `weights` from one shared `starting_capital`.
pub fn blend(
    series: &[DailySeries],
    weights: &WeightVector,
    starting_capital: f64,
) -> BlendResult<BlendedSeries> {
    let book = AlignedBook::new(series)?;
    tracing::debug!(
        strategies = book.strategy_count(),
        days = book.dates().len(),
        "blending series"
    );
    book.blend(weights, starting_capital)
}

/// Equal weighting: every strategy at full scale (1.0).
pub fn blend_equal(series: &[DailySeries], starting_capital: f64) -> BlendResult<BlendedSeries> {
    let weights = WeightVector::equal(series.iter().map(|s| s.id().to_string()));
    blend(series, &weights, starting_capital)
}

fn check_capital(starting_capital: f64) -> BlendResult<()> {
    if starting_capital.is_finite() && starting_capital > 0.0 {
        Ok(())
    } else {
        Err(BlendError::Configuration(format!(
            "starting capital must be > 0, got {}",
            starting_capital
        )))
    }
}

fn blend_id(ids: &[String]) -> String {
    format!("blend({})", ids.join("+"))
}
