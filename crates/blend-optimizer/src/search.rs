//! Weight search over the box `[0, upper_bound]^n`.
//!
//! Every candidate is scored by blending the aligned P/L matrix and running
//! the metrics engine on the result. Candidates for one generation are drawn
//! sequentially from a seeded RNG and scored in parallel, so a fixed seed
//! reproduces the same weights regardless of thread count.

use blend_analytics::{AlignedBook, MetricsEngine, Objective};
use blend_core::{AnalysisConfig, BlendError, BlendResult, DailySeries, WeightVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::settings::{SearchMethod, SearchSettings};

/// How a search ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationStatus {
    /// Population spread fell within tolerance, or the grid was exhausted
    Converged,
    MaxIterations,
    /// Deadline passed; the result is the best candidate seen so far
    TimedOut,
    /// Caller cancelled; the result is the best candidate seen so far
    Cancelled,
}

impl OptimizationStatus {
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            OptimizationStatus::Converged | OptimizationStatus::MaxIterations
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub weights: WeightVector,
    pub objective: Objective,
    pub objective_value: f64,
    /// e.g. `differential_evolution(sharpe)`
    pub method: String,
    pub status: OptimizationStatus,
    pub iterations: usize,
    pub evaluations: usize,
    pub seed: u64,
}

impl OptimizationResult {
    pub fn is_complete(&self) -> bool {
        self.status.is_complete()
    }
}

pub struct WeightOptimizer {
    settings: SearchSettings,
}

impl WeightOptimizer {
    pub fn new(settings: SearchSettings) -> BlendResult<Self> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    /// Blocking search. Callers on an async runtime should offload it.
    ///
    /// Cancellation and the optional timeout are checked between iterations;
    /// when either fires the best candidate so far is returned with status
    /// `Cancelled` / `TimedOut`.
    pub fn optimize(
        &self,
        series: &[DailySeries],
        config: &AnalysisConfig,
        cancel: &CancelToken,
    ) -> BlendResult<OptimizationResult> {
        if series.is_empty() {
            return Err(BlendError::InsufficientData(
                "no strategies to optimize".to_string(),
            ));
        }
        config.validate()?;

        let book = AlignedBook::new(series)?;
        let cancel = match self.settings.timeout() {
            Some(timeout) => cancel.limited_to(timeout),
            None => cancel.clone(),
        };

        info!(
            strategies = book.strategy_count(),
            days = book.dates().len(),
            method = self.settings.method.as_str(),
            objective = self.settings.objective.as_str(),
            seed = self.settings.seed,
            "Starting weight search"
        );

        let scorer = Scorer {
            book: &book,
            config,
            objective: self.settings.objective,
        };

        let outcome = match self.settings.method {
            SearchMethod::DifferentialEvolution => self.differential_evolution(&scorer, &cancel),
            SearchMethod::Grid => self.grid_search(&scorer, &cancel),
        };

        if !outcome.best_value.is_finite() {
            return Err(BlendError::Optimization(
                "no candidate produced a finite objective value".to_string(),
            ));
        }

        let weights =
            WeightVector::from_pairs(book.ids().into_iter().zip(outcome.best.iter().copied()));

        let result = OptimizationResult {
            weights,
            objective: self.settings.objective,
            objective_value: outcome.best_value,
            method: self.settings.method_label(),
            status: outcome.status,
            iterations: outcome.iterations,
            evaluations: outcome.evaluations,
            seed: self.settings.seed,
        };

        if result.is_complete() {
            info!(
                status = ?result.status,
                objective_value = result.objective_value,
                iterations = result.iterations,
                evaluations = result.evaluations,
                "Weight search finished"
            );
        } else {
            warn!(
                status = ?result.status,
                objective_value = result.objective_value,
                iterations = result.iterations,
                "Weight search interrupted, returning best candidate so far"
            );
        }

        Ok(result)
    }

    fn differential_evolution(&self, scorer: &Scorer<'_>, cancel: &CancelToken) -> Outcome {
        let s = &self.settings;
        let dim = scorer.book.strategy_count();
        let pop_size = s.population_size;
        let mut rng = StdRng::seed_from_u64(s.seed);

        // Equal weighting is always a candidate
        let mut population: Vec<Vec<f64>> = Vec::with_capacity(pop_size);
        population.push(equal_weights(dim, s.upper_bound));
        while population.len() < pop_size {
            population.push((0..dim).map(|_| rng.gen_range(0.0..=s.upper_bound)).collect());
        }

        let mut fitness = scorer.score_all(&population);
        let mut outcome = Outcome::new(OptimizationStatus::MaxIterations);
        outcome.evaluations = population.len();

        for _ in 0..s.max_iterations {
            if let Some(stop) = cancel.interruption() {
                outcome.status = stop;
                break;
            }

            let trials: Vec<Vec<f64>> = (0..pop_size)
                .map(|i| {
                    let a = pick_distinct(&mut rng, pop_size, &[i]);
                    let b = pick_distinct(&mut rng, pop_size, &[i, a]);
                    let c = pick_distinct(&mut rng, pop_size, &[i, a, b]);
                    let forced = rng.gen_range(0..dim);
                    (0..dim)
                        .map(|j| {
                            if j == forced || rng.gen::<f64>() < s.crossover {
                                let v = population[a][j]
                                    + s.mutation * (population[b][j] - population[c][j]);
                                v.clamp(0.0, s.upper_bound)
                            } else {
                                population[i][j]
                            }
                        })
                        .collect()
                })
                .collect();

            let trial_fitness = scorer.score_all(&trials);
            outcome.evaluations += trials.len();
            outcome.iterations += 1;

            for (i, (trial, value)) in trials.into_iter().zip(trial_fitness).enumerate() {
                if value >= fitness[i] {
                    population[i] = trial;
                    fitness[i] = value;
                }
            }

            if spread(&fitness) <= s.tolerance {
                outcome.status = OptimizationStatus::Converged;
                break;
            }
        }

        let best = best_index(&fitness);
        outcome.best = population.swap_remove(best);
        outcome.best_value = fitness[best];
        outcome
    }

    fn grid_search(&self, scorer: &Scorer<'_>, cancel: &CancelToken) -> Outcome {
        let s = &self.settings;
        let dim = scorer.book.strategy_count();

        let mut candidates = vec![equal_weights(dim, s.upper_bound)];
        candidates.extend(lattice(dim, s.upper_bound, s.grid_steps, s.max_grid_points));

        let mut outcome = Outcome::new(OptimizationStatus::Converged);

        for (batch_no, batch) in candidates.chunks(s.population_size).enumerate() {
            // The first batch always runs so there is something to return
            if batch_no > 0 {
                if batch_no >= s.max_iterations {
                    outcome.status = OptimizationStatus::MaxIterations;
                    break;
                }
                if let Some(stop) = cancel.interruption() {
                    outcome.status = stop;
                    break;
                }
            }

            let scores = scorer.score_all(batch);
            outcome.evaluations += batch.len();
            outcome.iterations += 1;

            let i = best_index(&scores);
            if scores[i] > outcome.best_value {
                outcome.best_value = scores[i];
                outcome.best = batch[i].clone();
            }
        }

        outcome
    }
}

#[derive(Debug)]
struct Outcome {
    best: Vec<f64>,
    best_value: f64,
    status: OptimizationStatus,
    iterations: usize,
    evaluations: usize,
}

impl Outcome {
    fn new(status: OptimizationStatus) -> Self {
        Self {
            best: Vec::new(),
            best_value: f64::NEG_INFINITY,
            status,
            iterations: 0,
            evaluations: 0,
        }
    }
}

struct Scorer<'a> {
    book: &'a AlignedBook,
    config: &'a AnalysisConfig,
    objective: Objective,
}

impl Scorer<'_> {
    /// Objective value of one weight vector; failures and non-finite values
    /// score as negative infinity.
    fn score(&self, weights: &[f64]) -> f64 {
        let value = self
            .book
            .blend_with(weights, self.config.starting_capital)
            .and_then(|series| MetricsEngine::analyze(&series, self.config))
            .map(|result| self.objective.value(&result));
        match value {
            Ok(v) if v.is_finite() => v,
            _ => f64::NEG_INFINITY,
        }
    }

    fn score_all(&self, candidates: &[Vec<f64>]) -> Vec<f64> {
        candidates.par_iter().map(|w| self.score(w)).collect()
    }
}

fn equal_weights(dim: usize, upper_bound: f64) -> Vec<f64> {
    vec![1.0_f64.min(upper_bound); dim]
}

fn pick_distinct(rng: &mut StdRng, n: usize, exclude: &[usize]) -> usize {
    loop {
        let k = rng.gen_range(0..n);
        if !exclude.contains(&k) {
            return k;
        }
    }
}

/// First index of the maximum; NaN never wins.
fn best_index(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

fn spread(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let d = max - min;
    if d.is_nan() {
        f64::INFINITY
    } else {
        d
    }
}

/// Evenly spaced lattice over `[0, upper]^dim`.
///
/// Steps per axis shrink so the full lattice fits in `max_points` where
/// possible (never below 2); anything beyond `max_points` is cut.
fn lattice(dim: usize, upper: f64, steps: usize, max_points: usize) -> Vec<Vec<f64>> {
    let exp = u32::try_from(dim).unwrap_or(u32::MAX);
    let mut per_axis = 2;
    while per_axis < steps
        && (per_axis + 1)
            .checked_pow(exp)
            .is_some_and(|points| points <= max_points)
    {
        per_axis += 1;
    }
    let steps = per_axis;
    let axis: Vec<f64> = (0..steps)
        .map(|k| upper * k as f64 / (steps - 1) as f64)
        .collect();

    let mut grid = Vec::new();
    let mut idx = vec![0usize; dim];
    loop {
        grid.push(idx.iter().map(|&k| axis[k]).collect());
        if grid.len() >= max_points {
            return grid;
        }

        // Odometer increment
        let mut d = 0;
        loop {
            if d == dim {
                return grid;
            }
            idx[d] += 1;
            if idx[d] < steps {
                break;
            }
            idx[d] = 0;
            d += 1;
        }
    }
}
