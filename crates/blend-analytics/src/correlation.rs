//! Pairwise P/L correlation with zero-exclusion.
//!
//! A day where either strategy shows exactly 0 (or NaN) P/L is treated as a
//! day the strategy did not trade and is dropped from the pair. Fewer than two
//! remaining days leaves the correlation undefined (NaN).

use std::collections::BTreeMap;

use blend_core::{BlendResult, DailySeries};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::blender::AlignedBook;

pub const MIN_VALID_PAIRS: usize = 2;

/// Correlation of one pair plus the number of days it was computed from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairCorrelation {
    /// NaN when fewer than [`MIN_VALID_PAIRS`] days survive filtering
    pub value: f64,
    pub valid_pairs: usize,
}

impl PairCorrelation {
    pub fn is_defined(&self) -> bool {
        !self.value.is_nan()
    }
}

/// Pearson correlation over the days both series traded.
///
/// Arrays of different length are compared up to the shorter one; indexes
/// past the end count as missing. Zero variance on either side gives 0.0.
pub fn pairwise(a: &[f64], b: &[f64]) -> PairCorrelation {
    let (xs, ys): (Vec<f64>, Vec<f64>) = a
        .iter()
        .zip(b)
        .filter(|(x, y)| traded(**x) && traded(**y))
        .map(|(x, y)| (*x, *y))
        .unzip();

    let n = xs.len();
    if n < MIN_VALID_PAIRS {
        return PairCorrelation {
            value: f64::NAN,
            valid_pairs: n,
        };
    }
    // The mean of a constant series can be off by an ulp, leaving tiny
    // deviations that would otherwise correlate perfectly.
    if is_flat(&xs) || is_flat(&ys) {
        return PairCorrelation {
            value: 0.0,
            valid_pairs: n,
        };
    }

    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = ys.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(&ys) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    let denom = (var_x * var_y).sqrt();
    let value = if denom == 0.0 || !denom.is_finite() {
        0.0
    } else {
        (cov / denom).clamp(-1.0, 1.0)
    };

    PairCorrelation {
        value,
        valid_pairs: n,
    }
}

/// Shorthand for `pairwise(a, b).value`.
pub fn pearson_nonzero(a: &[f64], b: &[f64]) -> f64 {
    pairwise(a, b).value
}

fn is_flat(values: &[f64]) -> bool {
    values.iter().all(|v| *v == values[0])
}

fn traded(v: f64) -> bool {
    v != 0.0 && !v.is_nan()
}

/// Symmetric correlation matrix keyed by strategy id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    pub ids: Vec<String>,
    /// Undefined cells are NaN in memory and `null` on the wire
    #[serde(with = "nan_as_null")]
    pub values: Vec<Vec<f64>>,
    pub valid_pairs: Vec<Vec<usize>>,
}

impl CorrelationMatrix {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|s| s == id)
    }

    /// Cell for a pair of ids. `None` for an unknown id or an undefined cell.
    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        let (i, j) = (self.index_of(a)?, self.index_of(b)?);
        let v = self.values[i][j];
        (!v.is_nan()).then_some(v)
    }

    pub fn valid_pairs(&self, a: &str, b: &str) -> Option<usize> {
        let (i, j) = (self.index_of(a)?, self.index_of(b)?);
        Some(self.valid_pairs[i][j])
    }

    /// Mean of the defined off-diagonal cells.
    pub fn average_correlation(&self) -> Option<f64> {
        let mut sum = 0.0;
        let mut count = 0usize;
        for i in 0..self.len() {
            for j in (i + 1)..self.len() {
                let v = self.values[i][j];
                if !v.is_nan() {
                    sum += v;
                    count += 1;
                }
            }
        }
        (count > 0).then(|| sum / count as f64)
    }
}

/// Full matrix over a name -> daily P/L mapping.
///
/// The diagonal is 1.0. Each unordered pair is computed once and mirrored.
pub fn correlation_matrix(pl_by_id: &BTreeMap<String, Vec<f64>>) -> CorrelationMatrix {
    let ids: Vec<String> = pl_by_id.keys().cloned().collect();
    let columns: Vec<&[f64]> = pl_by_id.values().map(Vec::as_slice).collect();
    build(ids, &columns)
}

/// Full matrix over series aligned onto their union date axis.
pub fn correlation_matrix_for_series(series: &[DailySeries]) -> BlendResult<CorrelationMatrix> {
    let book = AlignedBook::new(series)?;
    tracing::debug!(
        strategies = book.strategy_count(),
        days = book.dates().len(),
        "building correlation matrix"
    );
    let ids = book.ids().into_iter().map(str::to_string).collect();
    let columns: Vec<&[f64]> = book.columns().map(|(_, pl)| pl).collect();
    Ok(build(ids, &columns))
}

fn build(ids: Vec<String>, columns: &[&[f64]]) -> CorrelationMatrix {
    let n = ids.len();

    let pairs: Vec<(usize, usize)> = (0..n)
        .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
        .collect();
    let cells: Vec<(usize, usize, PairCorrelation)> = pairs
        .par_iter()
        .map(|&(i, j)| (i, j, pairwise(columns[i], columns[j])))
        .collect();

    let mut values = vec![vec![f64::NAN; n]; n];
    let mut valid_pairs = vec![vec![0usize; n]; n];
    for i in 0..n {
        values[i][i] = 1.0;
        valid_pairs[i][i] = columns[i].iter().filter(|v| traded(**v)).count();
    }
    for (i, j, cell) in cells {
        values[i][j] = cell.value;
        values[j][i] = cell.value;
        valid_pairs[i][j] = cell.valid_pairs;
        valid_pairs[j][i] = cell.valid_pairs;
    }

    CorrelationMatrix {
        ids,
        values,
        valid_pairs,
    }
}

mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(values: &[Vec<f64>], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let rows: Vec<Vec<Option<f64>>> = values
            .iter()
            .map(|row| row.iter().map(|v| (!v.is_nan()).then_some(*v)).collect())
            .collect();
        rows.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Vec<f64>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let rows: Vec<Vec<Option<f64>>> = Vec::deserialize(deserializer)?;
        Ok(rows
            .into_iter()
            .map(|row| row.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_self_correlation_is_exactly_one() {
        let a = [120.5, -40.0, 0.0, 310.25, -95.75, 12.0];
        assert_eq!(pearson_nonzero(&a, &a), 1.0);
    }

    #[test]
    fn test_perfect_negative() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [-2.0, -4.0, -6.0, -8.0];
        assert_relative_eq!(pearson_nonzero(&a, &b), -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_days_are_excluded() {
        // Without exclusion the shared zeros would pull the estimate toward 0.
        let a = [1.0, 0.0, 2.0, 0.0, 3.0, 5.0];
        let b = [2.0, 7.0, 4.0, 0.0, 6.0, 0.0];
        let c = pairwise(&a, &b);
        assert_eq!(c.valid_pairs, 3);
        assert_relative_eq!(c.value, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_nan_and_length_mismatch_count_as_missing() {
        let a = [1.0, f64::NAN, 2.0, 3.0, 9.0];
        let b = [3.0, 4.0, 5.0, 7.0];
        assert_eq!(pairwise(&a, &b).valid_pairs, 3);
    }

    #[test]
    fn test_fewer_than_two_pairs_is_undefined() {
        let a = [1.0, 0.0, 0.0];
        let b = [2.0, 3.0, 4.0];
        let c = pairwise(&a, &b);
        assert!(c.value.is_nan());
        assert!(!c.is_defined());
        assert!(pearson_nonzero(&[], &[]).is_nan());
    }

    #[test]
    fn test_zero_variance_is_zero() {
        let a = [5.0, 5.0, 5.0, 5.0];
        let b = [1.0, -2.0, 3.0, 4.0];
        assert_eq!(pearson_nonzero(&a, &b), 0.0);
    }

    #[test]
    fn test_constant_series_with_inexact_mean_are_uncorrelated() {
        // The mean of [0.1; 3] is not exactly 0.1
        assert_eq!(pearson_nonzero(&[0.1; 3], &[0.2; 3]), 0.0);
        assert_eq!(pearson_nonzero(&[0.7; 5], &[0.7; 5]), 0.0);
        assert_eq!(pearson_nonzero(&[12.34; 4], &[1.0, 2.0, 3.0, 5.0]), 0.0);

        // Zero days are dropped before the flatness check
        let c = pairwise(&[0.1, 0.0, 0.1, 0.1], &[0.2, 0.3, 0.2, 0.2]);
        assert_eq!(c.valid_pairs, 3);
        assert_eq!(c.value, 0.0);
    }

    fn sample() -> BTreeMap<String, Vec<f64>> {
        let mut m = BTreeMap::new();
        m.insert("alpha".to_string(), vec![10.0, -5.0, 0.0, 20.0, -15.0, 8.0]);
        m.insert("beta".to_string(), vec![12.0, -3.0, 7.0, 0.0, -10.0, 9.0]);
        m.insert("gamma".to_string(), vec![-4.0, 6.0, 1.0, -9.0, 0.0, -2.0]);
        m.insert("idle".to_string(), vec![0.0, 0.0, 0.0, 3.0, 0.0, 0.0]);
        m
    }

    #[test]
    fn test_matrix_symmetric_with_unit_diagonal() {
        let m = correlation_matrix(&sample());
        assert_eq!(m.len(), 4);
        for i in 0..m.len() {
            assert_eq!(m.values[i][i], 1.0);
            for j in 0..m.len() {
                let (a, b) = (m.values[i][j], m.values[j][i]);
                assert!(a == b || (a.is_nan() && b.is_nan()));
            }
        }
        // "idle" traded only once
        assert_eq!(m.get("alpha", "idle"), None);
        assert_eq!(m.valid_pairs("alpha", "idle"), Some(1));
        assert!(m.get("alpha", "beta").is_some());
        assert_eq!(m.get("alpha", "nope"), None);
    }

    #[test]
    fn test_average_skips_undefined_cells() {
        let m = correlation_matrix(&sample());
        let defined = [
            m.get("alpha", "beta").unwrap(),
            m.get("alpha", "gamma").unwrap(),
            m.get("beta", "gamma").unwrap(),
        ];
        let expected = defined.iter().sum::<f64>() / 3.0;
        assert_relative_eq!(m.average_correlation().unwrap(), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_undefined_cell_serializes_as_null() {
        let m = correlation_matrix(&sample());
        let json = serde_json::to_value(&m).unwrap();
        assert!(json["values"][0][3].is_null());
        assert_eq!(json["values"][0][0], 1.0);

        let back: CorrelationMatrix = serde_json::from_value(json).unwrap();
        assert!(back.values[0][3].is_nan());
    }
}
