use std::sync::Arc;

use blend_analytics::{blend, AnalysisResult, MetricsEngine};
use blend_core::{
    resolve_weights, AnalysisConfig, BlendError, BlendResult, SeriesStore, WeightVector,
    WeightingMethod,
};
use chrono::{DateTime, Utc};
use tracing::info;

use crate::cache::{CacheKey, CachedOptimization, NewResultNotice, OptimizationCache};
use crate::cancel::CancelToken;
use crate::search::WeightOptimizer;
use crate::settings::SearchSettings;

/// Request-facing entry point: loads series by id, optimizes through the
/// shared cache, and invalidates when a strategy's data changes.
pub struct PortfolioOptimizer {
    store: Arc<dyn SeriesStore>,
    cache: Arc<OptimizationCache>,
    settings: SearchSettings,
    config: AnalysisConfig,
}

impl PortfolioOptimizer {
    pub fn new(
        store: Arc<dyn SeriesStore>,
        cache: Arc<OptimizationCache>,
        settings: SearchSettings,
        config: AnalysisConfig,
    ) -> BlendResult<Self> {
        settings.validate()?;
        config.validate()?;
        Ok(Self {
            store,
            cache,
            settings,
            config,
        })
    }

    pub fn cache(&self) -> &OptimizationCache {
        &self.cache
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn key_for(&self, ids: &[&str]) -> CacheKey {
        CacheKey::from_search(ids, &self.settings, &self.config)
    }

    /// Optimize weights for `ids`, serving a stored result when one is valid.
    /// Blocking.
    pub fn optimize(&self, ids: &[&str], cancel: &CancelToken) -> BlendResult<CachedOptimization> {
        let key = self.key_for(ids);
        if key.portfolio_ids().is_empty() {
            return Err(BlendError::InsufficientData(
                "no portfolio ids given".to_string(),
            ));
        }

        self.cache.get_or_compute(&key, || {
            let ids: Vec<&str> = key.portfolio_ids().iter().map(String::as_str).collect();
            let series = self.store.load_many(&ids)?;
            WeightOptimizer::new(self.settings.clone())?.optimize(&series, &self.config, cancel)
        })
    }

    /// Call after new data lands for `portfolio_id`.
    pub fn series_updated(&self, portfolio_id: &str) -> usize {
        let dropped = self.cache.invalidate_portfolio(portfolio_id);
        info!(portfolio = portfolio_id, dropped, "Strategy data updated");
        dropped
    }

    pub fn notice(&self, ids: &[&str], applied_at: Option<DateTime<Utc>>) -> NewResultNotice {
        self.cache.notice(&self.key_for(ids), applied_at)
    }

    /// Metrics of the blend of `ids`: custom weights when given, otherwise
    /// the configured weighting method.
    pub fn analyze(
        &self,
        ids: &[&str],
        custom: Option<&WeightVector>,
    ) -> BlendResult<AnalysisResult> {
        let series = self.store.load_many(ids)?;
        let method = if custom.is_some() {
            WeightingMethod::Custom
        } else {
            self.config.weighting_method
        };
        let weights = resolve_weights(method, ids, custom)?;
        let blended = blend(&series, &weights, self.config.starting_capital)?;
        MetricsEngine::analyze_blend(&blended.series, &blended.weights, &self.config)
    }
}
