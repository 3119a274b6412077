use std::time::Duration;

use blend_analytics::Objective;
use blend_core::{BlendError, BlendResult};
use serde::{Deserialize, Serialize};

/// Search strategy over the weight box.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    /// Seeded population search (rand/1/bin)
    #[default]
    DifferentialEvolution,
    /// Exhaustive lattice, capped at `max_grid_points`
    Grid,
}

impl SearchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMethod::DifferentialEvolution => "differential_evolution",
            SearchMethod::Grid => "grid",
        }
    }
}

impl std::str::FromStr for SearchMethod {
    type Err = BlendError;

    fn from_str(s: &str) -> BlendResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "de" | "differential_evolution" => Ok(SearchMethod::DifferentialEvolution),
            "grid" => Ok(SearchMethod::Grid),
            other => Err(BlendError::Configuration(format!(
                "unknown search method '{}'",
                other
            ))),
        }
    }
}

/// Knobs of one optimization run. Every weight is searched in `[0, upper_bound]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub method: SearchMethod,
    pub objective: Objective,
    /// Per-strategy cap; 3.0 allows moderate leverage
    pub upper_bound: f64,
    pub population_size: usize,
    /// Generations (DE) or evaluation batches (grid)
    pub max_iterations: usize,
    pub seed: u64,
    /// Stop once the population's objective spread falls to this value
    pub tolerance: f64,
    /// Differential weight F
    pub mutation: f64,
    /// Crossover probability CR
    pub crossover: f64,
    /// Lattice points per axis
    pub grid_steps: usize,
    pub max_grid_points: usize,
    /// Wall-clock limit; the best candidate so far is returned when it elapses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            method: SearchMethod::DifferentialEvolution,
            objective: Objective::Sharpe,
            upper_bound: 3.0,
            population_size: 20,
            max_iterations: 100,
            seed: 42,
            tolerance: 1e-8,
            mutation: 0.7,
            crossover: 0.9,
            grid_steps: 7,
            max_grid_points: 1_000,
            timeout_ms: None,
        }
    }
}

impl SearchSettings {
    pub fn with_method(mut self, method: SearchMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_objective(mut self, objective: Objective) -> Self {
        self.objective = objective;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_upper_bound(mut self, upper_bound: f64) -> Self {
        self.upper_bound = upper_bound;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// e.g. `differential_evolution(sharpe)`
    pub fn method_label(&self) -> String {
        format!("{}({})", self.method.as_str(), self.objective.as_str())
    }

    pub fn validate(&self) -> BlendResult<()> {
        if !(self.upper_bound.is_finite() && self.upper_bound > 0.0) {
            return Err(BlendError::Configuration(format!(
                "upper_bound must be > 0, got {}",
                self.upper_bound
            )));
        }
        if self.population_size < 4 {
            return Err(BlendError::Configuration(
                "population_size must be at least 4".to_string(),
            ));
        }
        if !(self.mutation > 0.0 && self.mutation <= 2.0) {
            return Err(BlendError::Configuration(format!(
                "mutation must be in (0, 2], got {}",
                self.mutation
            )));
        }
        if !(0.0..=1.0).contains(&self.crossover) {
            return Err(BlendError::Configuration(format!(
                "crossover must be in [0, 1], got {}",
                self.crossover
            )));
        }
        if self.max_iterations == 0 {
            return Err(BlendError::Configuration(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if !(self.tolerance >= 0.0) {
            return Err(BlendError::Configuration("tolerance must be >= 0".to_string()));
        }
        if self.grid_steps < 2 || self.max_grid_points == 0 {
            return Err(BlendError::Configuration(
                "grid needs at least 2 steps and 1 point".to_string(),
            ));
        }
        Ok(())
    }
}
