use std::collections::HashMap;
use std::sync::RwLock;

use crate::{BlendError, BlendResult, DailySeries};

/// Source of uploaded strategy series (the storage collaborator).
pub trait SeriesStore: Send + Sync {
    fn load(&self, id: &str) -> BlendResult<DailySeries>;

    fn load_many(&self, ids: &[&str]) -> BlendResult<Vec<DailySeries>> {
        ids.iter().map(|id| self.load(id)).collect()
    }
}

/// Process-local store, used by the CLI and tests.
#[derive(Default)]
pub struct InMemorySeriesStore {
    series: RwLock<HashMap<String, DailySeries>>,
}

impl InMemorySeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a series; returns true when an older copy was replaced.
    pub fn insert(&self, series: DailySeries) -> bool {
        let mut guard = self.series.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(series.id().to_string(), series).is_some()
    }

    pub fn ids(&self) -> Vec<String> {
        let guard = self.series.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = guard.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl SeriesStore for InMemorySeriesStore {
    fn load(&self, id: &str) -> BlendResult<DailySeries> {
        let guard = self.series.read().unwrap_or_else(|e| e.into_inner());
        guard
            .get(id)
            .cloned()
            .ok_or_else(|| BlendError::Configuration(format!("unknown strategy '{}'", id)))
    }
}
