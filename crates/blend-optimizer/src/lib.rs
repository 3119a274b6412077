pub mod cache;
pub mod cancel;
pub mod search;
pub mod service;
pub mod settings;

#[cfg(test)]
mod tests;

pub use cache::{
    CacheEntry, CacheKey, CacheSettings, CacheStats, CachedOptimization, Clock, ManualClock,
    NewResultNotice, OptimizationCache, SystemClock, CACHED_MARKER,
};
pub use cancel::CancelToken;
pub use search::{OptimizationResult, OptimizationStatus, WeightOptimizer};
pub use service::PortfolioOptimizer;
pub use settings::{SearchMethod, SearchSettings};
