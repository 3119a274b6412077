//! Optimization result cache.
//!
//! One slot per canonical key. Each slot has a gate mutex held for the whole
//! of a computation, so concurrent requests for the same key run the search
//! once while different keys proceed in parallel. The stored entry sits behind
//! its own lock so reads never wait on a running search.
//!
//! Invalidation bumps the slot epoch; a search that started under an older
//! epoch still returns its result to its caller but does not store it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};

use blend_core::{AnalysisConfig, BlendError, BlendResult, WeightVector};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::search::OptimizationResult;
use crate::settings::SearchSettings;

/// Marker appended to the method label of a result served from the cache.
pub const CACHED_MARKER: &str = " (cached)";

/// Time source; injected so tests can drive expiry.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Canonical identity of an optimization request.
///
/// Ids are trimmed, deduplicated and sorted; the method is lowercased; all
/// whitespace is removed from the parameter string. Requests that differ only
/// in id order or parameter spacing map to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    portfolio_ids: Vec<String>,
    method: String,
    params: String,
}

impl CacheKey {
    pub fn new<I, S>(ids: I, method: &str, params: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut portfolio_ids: Vec<String> = ids
            .into_iter()
            .map(|id| id.as_ref().trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        portfolio_ids.sort();
        portfolio_ids.dedup();

        Self {
            portfolio_ids,
            method: method.trim().to_lowercase(),
            params: params.chars().filter(|c| !c.is_whitespace()).collect(),
        }
    }

    /// Key from a loose `k=v, k2 = v2` parameter string.
    ///
    /// Pairs are sorted by lowercased key, so parameter order does not matter
    /// either. Fragments without `=` are kept as bare flags.
    pub fn from_raw<I, S>(ids: I, method: &str, raw_params: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut pairs: Vec<(String, String)> = raw_params
            .split([',', ';'])
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.trim().to_lowercase(), v.trim().to_string()),
                None => (p.to_lowercase(), String::new()),
            })
            .collect();
        pairs.sort();

        let params = pairs
            .iter()
            .map(|(k, v)| if v.is_empty() { k.clone() } else { format!("{}={}", k, v) })
            .collect::<Vec<_>>()
            .join(";");
        Self::new(ids, method, &params)
    }

    /// Key for a typed request. Timeouts are left out because interrupted
    /// runs are never stored.
    pub fn from_search<I, S>(ids: I, settings: &SearchSettings, config: &AnalysisConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let params = format!(
            "objective={};upper={};pop={};iters={};seed={};tol={};f={};cr={};steps={};points={};\
             capital={};rf={};sma={};filter={};conf={}",
            settings.objective.as_str(),
            settings.upper_bound,
            settings.population_size,
            settings.max_iterations,
            settings.seed,
            settings.tolerance,
            settings.mutation,
            settings.crossover,
            settings.grid_steps,
            settings.max_grid_points,
            config.starting_capital,
            config.risk_free_rate,
            config.sma_window,
            config.use_trading_filter,
            config.confidence_level,
        );
        Self::new(ids, settings.method.as_str(), &params)
    }

    pub fn portfolio_ids(&self) -> &[String] {
        &self.portfolio_ids
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &str {
        &self.params
    }

    pub fn contains(&self, id: &str) -> bool {
        self.portfolio_ids.binary_search_by(|p| p.as_str().cmp(id)).is_ok()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.portfolio_ids.join(","), self.method, self.params)
    }
}

/// A stored optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub result: OptimizationResult,
    /// Strictly increasing across every write to this cache
    pub computed_at: DateTime<Utc>,
    pub sequence: u64,
}

/// What a caller gets back from [`OptimizationCache::get_or_compute`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedOptimization {
    pub weights: WeightVector,
    /// Search label, with [`CACHED_MARKER`] appended on a hit
    pub method: String,
    pub last_optimized: DateTime<Utc>,
    pub from_cache: bool,
    /// False when the result was computed but not stored
    pub stored: bool,
    pub result: OptimizationResult,
}

impl CachedOptimization {
    fn hit(entry: &CacheEntry) -> Self {
        Self {
            weights: entry.result.weights.clone(),
            method: format!("{}{}", entry.result.method, CACHED_MARKER),
            last_optimized: entry.computed_at,
            from_cache: true,
            stored: true,
            result: entry.result.clone(),
        }
    }

    fn fresh(result: OptimizationResult, computed_at: DateTime<Utc>, stored: bool) -> Self {
        Self {
            weights: result.weights.clone(),
            method: result.method.clone(),
            last_optimized: computed_at,
            from_cache: false,
            stored,
            result,
        }
    }
}

/// "A newer optimization exists than the one the caller applied."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewResultNotice {
    pub available: bool,
    pub computed_at: Option<DateTime<Utc>>,
    pub applied_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Entries older than this are recomputed; `None` keeps them until invalidated
    pub max_age_secs: Option<i64>,
}

impl CacheSettings {
    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            max_age_secs: Some(max_age.num_seconds()),
        }
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::seconds)
    }

    pub fn validate(&self) -> BlendResult<()> {
        match self.max_age_secs {
            Some(secs) if secs <= 0 => Err(BlendError::Cache(format!(
                "cache max age must be > 0 seconds, got {}",
                secs
            ))),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub stale_drops: u64,
}

#[derive(Default)]
struct Slot {
    gate: Mutex<()>,
    entry: RwLock<Option<CacheEntry>>,
    epoch: AtomicU64,
}

impl Slot {
    fn read(&self) -> Option<CacheEntry> {
        self.entry.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, Option<CacheEntry>> {
        self.entry.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared optimization cache. Construct once and pass by reference (or `Arc`).
pub struct OptimizationCache {
    slots: DashMap<CacheKey, Arc<Slot>>,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
    last_stamp: Mutex<Option<DateTime<Utc>>>,
    sequence: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    stale_drops: AtomicU64,
}

impl OptimizationCache {
    pub fn new(settings: CacheSettings) -> BlendResult<Self> {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: CacheSettings, clock: Arc<dyn Clock>) -> BlendResult<Self> {
        settings.validate()?;
        Ok(Self {
            slots: DashMap::new(),
            clock,
            settings,
            last_stamp: Mutex::new(None),
            sequence: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            stale_drops: AtomicU64::new(0),
        })
    }

    fn slot(&self, key: &CacheKey) -> Arc<Slot> {
        if let Some(slot) = self.slots.get(key) {
            return Arc::clone(slot.value());
        }
        Arc::clone(self.slots.entry(key.clone()).or_default().value())
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        match self.settings.max_age() {
            Some(max_age) => self.clock.now() - entry.computed_at < max_age,
            None => true,
        }
    }

    /// The slot's entry if still fresh. An expired entry is dropped on the way
    /// out unless a newer one replaced it meanwhile.
    fn read_fresh(&self, slot: &Slot) -> Option<CacheEntry> {
        let entry = slot.read()?;
        if self.is_fresh(&entry) {
            return Some(entry);
        }
        let mut stored = slot.write_guard();
        if stored.as_ref().is_some_and(|e| e.sequence == entry.sequence) {
            *stored = None;
        }
        None
    }

    /// Forget slots that hold no entry and that no caller is using.
    fn prune_idle(&self) {
        self.slots
            .retain(|_, slot| Arc::strong_count(slot) > 1 || slot.read().is_some());
    }

    /// Next write timestamp: the clock, nudged forward if needed so that every
    /// write is strictly later than the previous one. Call it with the slot's
    /// entry lock held so stamp order matches write order.
    fn next_stamp(&self) -> (DateTime<Utc>, u64) {
        let mut last = self.last_stamp.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();
        let stamp = match *last {
            Some(prev) if now <= prev => prev + Duration::microseconds(1),
            _ => now,
        };
        *last = Some(stamp);
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        (stamp, seq)
    }

    /// Cached result for `key`, or run `compute` and store its result.
    ///
    /// `compute` runs at most once at a time per key. Incomplete results
    /// (cancelled, timed out) and results computed across an invalidation are
    /// returned but not stored. Errors from `compute` propagate and leave the
    /// slot untouched.
    pub fn get_or_compute<F>(&self, key: &CacheKey, compute: F) -> BlendResult<CachedOptimization>
    where
        F: FnOnce() -> BlendResult<OptimizationResult>,
    {
        let slot = self.slot(key);
        let _gate = slot.gate.lock().unwrap_or_else(|e| e.into_inner());

        let had_entry = slot.read().is_some();
        if let Some(entry) = self.read_fresh(&slot) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Optimization cache hit");
            return Ok(CachedOptimization::hit(&entry));
        }
        if had_entry {
            debug!(key = %key, "Optimization cache entry expired");
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        info!(key = %key, "Optimization cache miss, computing");
        self.run_and_store(key, &slot, compute)
    }

    /// Recompute regardless of what is stored, then store (last writer wins).
    pub fn refresh<F>(&self, key: &CacheKey, compute: F) -> BlendResult<CachedOptimization>
    where
        F: FnOnce() -> BlendResult<OptimizationResult>,
    {
        let slot = self.slot(key);
        let _gate = slot.gate.lock().unwrap_or_else(|e| e.into_inner());
        self.misses.fetch_add(1, Ordering::Relaxed);
        info!(key = %key, "Refreshing optimization");
        self.run_and_store(key, &slot, compute)
    }

    fn run_and_store<F>(
        &self,
        key: &CacheKey,
        slot: &Slot,
        compute: F,
    ) -> BlendResult<CachedOptimization>
    where
        F: FnOnce() -> BlendResult<OptimizationResult>,
    {
        let epoch = slot.epoch.load(Ordering::SeqCst);
        let result = compute()?;

        if !result.is_complete() {
            warn!(key = %key, status = ?result.status, "Not caching incomplete optimization");
            return Ok(CachedOptimization::fresh(result, self.clock.now(), false));
        }

        // Hold the entry lock across the epoch check and the stamp so an
        // invalidation or a concurrent store cannot slip in before the write.
        let mut stored = slot.write_guard();
        if slot.epoch.load(Ordering::SeqCst) != epoch {
            self.stale_drops.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, "Portfolio data changed during optimization, result not cached");
            return Ok(CachedOptimization::fresh(result, self.clock.now(), false));
        }

        let (computed_at, sequence) = self.next_stamp();
        *stored = Some(CacheEntry {
            key: key.clone(),
            result: result.clone(),
            computed_at,
            sequence,
        });
        Ok(CachedOptimization::fresh(result, computed_at, true))
    }

    /// Store an externally computed result. Incomplete results are rejected
    /// (returns `None`).
    pub fn store(&self, key: &CacheKey, result: OptimizationResult) -> Option<CacheEntry> {
        if !result.is_complete() {
            return None;
        }
        let slot = self.slot(key);
        let mut stored = slot.write_guard();
        let (computed_at, sequence) = self.next_stamp();
        let entry = CacheEntry {
            key: key.clone(),
            result,
            computed_at,
            sequence,
        };
        *stored = Some(entry.clone());
        Some(entry)
    }

    /// Current valid entry without computing or counting a hit.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        let slot = self.slots.get(key).map(|s| Arc::clone(s.value()))?;
        self.read_fresh(&slot)
    }

    /// Drop the entry for `key` and fence off any search already running for it.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let Some(slot) = self.slots.get(key).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        self.invalidate_slot(&slot);
        drop(slot);
        self.prune_idle();
        info!(key = %key, "Invalidated cached optimization");
        true
    }

    fn invalidate_slot(&self, slot: &Slot) {
        let mut entry = slot.write_guard();
        slot.epoch.fetch_add(1, Ordering::SeqCst);
        *entry = None;
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Invalidate every key that includes `portfolio_id`. Returns how many.
    pub fn invalidate_portfolio(&self, portfolio_id: &str) -> usize {
        let id = portfolio_id.trim();
        let affected: Vec<Arc<Slot>> = self
            .slots
            .iter()
            .filter(|e| e.key().contains(id))
            .map(|e| Arc::clone(e.value()))
            .collect();
        let count = affected.len();
        for slot in affected {
            self.invalidate_slot(&slot);
        }
        self.prune_idle();
        info!(portfolio = id, keys = count, "Invalidated optimizations for portfolio");
        count
    }

    pub fn clear(&self) {
        let all: Vec<Arc<Slot>> = self.slots.iter().map(|e| Arc::clone(e.value())).collect();
        let count = all.len();
        for slot in all {
            self.invalidate_slot(&slot);
        }
        self.prune_idle();
        info!(keys = count, "Cleared optimization cache");
    }

    /// Number of valid entries.
    pub fn len(&self) -> usize {
        let all: Vec<Arc<Slot>> = self.slots.iter().map(|e| Arc::clone(e.value())).collect();
        all.iter().filter(|s| self.read_fresh(s).is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an entry newer than `applied_at` exists. Counts neither as a
    /// hit nor a miss.
    pub fn notice(&self, key: &CacheKey, applied_at: Option<DateTime<Utc>>) -> NewResultNotice {
        let computed_at = self.peek(key).map(|e| e.computed_at);
        let available = match (computed_at, applied_at) {
            (Some(computed), Some(applied)) => computed > applied,
            (Some(_), None) => true,
            (None, _) => false,
        };
        NewResultNotice {
            available,
            computed_at,
            applied_at,
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            stale_drops: self.stale_drops.load(Ordering::Relaxed),
        }
    }
}
