use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;

use approx::assert_relative_eq;
use blend_analytics::{blend, blend_equal, MetricsEngine, Objective};
use blend_core::{AnalysisConfig, BlendResult, DailySeries, InMemorySeriesStore, WeightVector};
use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::cache::{CacheKey, CacheSettings, ManualClock, OptimizationCache, CACHED_MARKER};
use crate::cancel::CancelToken;
use crate::search::{OptimizationResult, OptimizationStatus, WeightOptimizer};
use crate::service::PortfolioOptimizer;
use crate::settings::{SearchMethod, SearchSettings};

fn strategy(id: &str, drift: f64, amplitude: f64, phase: f64) -> DailySeries {
    let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
    let days: Vec<(NaiveDate, f64)> = (0..120)
        .map(|i| {
            let pl = drift + amplitude * ((i as f64) * 0.9 + phase).sin();
            (start + Duration::days(i), pl)
        })
        .collect();
    DailySeries::from_pl(id, 100_000.0, days).unwrap()
}

fn book() -> Vec<DailySeries> {
    vec![
        strategy("trend", 120.0, 400.0, 0.0),
        strategy("carry", 60.0, 150.0, 2.1),
        strategy("bleeder", -40.0, 300.0, 4.0),
    ]
}

fn quick() -> SearchSettings {
    let mut s = SearchSettings::default();
    s.population_size = 8;
    s.max_iterations = 15;
    s
}

fn t0() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
}

fn canned(weight: f64) -> OptimizationResult {
    OptimizationResult {
        weights: WeightVector::from_pairs([("a", weight), ("b", 1.0)]),
        objective: Objective::Sharpe,
        objective_value: 1.25,
        method: "differential_evolution(sharpe)".to_string(),
        status: OptimizationStatus::MaxIterations,
        iterations: 10,
        evaluations: 80,
        seed: 42,
    }
}

fn key() -> CacheKey {
    CacheKey::new(["a", "b"], "differential_evolution", "seed=42")
}

// ---- WeightOptimizer ----

#[test]
fn test_same_seed_same_weights() {
    let series = book();
    let config = AnalysisConfig::default();
    let optimizer = WeightOptimizer::new(quick()).unwrap();

    let a = optimizer.optimize(&series, &config, &CancelToken::new()).unwrap();
    let b = optimizer.optimize(&series, &config, &CancelToken::new()).unwrap();
    assert_eq!(a.weights, b.weights);
    assert_eq!(a.objective_value, b.objective_value);
    assert_eq!(a.method, "differential_evolution(sharpe)");
    assert!(a.is_complete());
}

#[test]
fn test_result_never_worse_than_equal_weighting() {
    let series = book();
    let config = AnalysisConfig::default();
    let result = WeightOptimizer::new(quick())
        .unwrap()
        .optimize(&series, &config, &CancelToken::new())
        .unwrap();

    let equal = blend_equal(&series, config.starting_capital).unwrap();
    let baseline = MetricsEngine::analyze(&equal.series, &config).unwrap().sharpe_ratio;
    assert!(result.objective_value >= baseline);

    // The reported value is reproducible from the returned weights
    let replay = blend(&series, &result.weights, config.starting_capital).unwrap();
    let replay_sharpe = MetricsEngine::analyze(&replay.series, &config).unwrap().sharpe_ratio;
    assert_relative_eq!(result.objective_value, replay_sharpe, max_relative = 1e-12);

    for (_, w) in result.weights.iter() {
        assert!((0.0..=3.0).contains(&w));
    }
    assert_eq!(result.weights.len(), 3);
}

#[test]
fn test_grid_search_covers_lattice() {
    let series = book();
    let mut settings = quick().with_method(SearchMethod::Grid);
    settings.grid_steps = 3;
    settings.max_iterations = 1_000;
    let result = WeightOptimizer::new(settings)
        .unwrap()
        .optimize(&series, &AnalysisConfig::default(), &CancelToken::new())
        .unwrap();

    // equal-weight seed + 3^3 lattice points
    assert_eq!(result.evaluations, 1 + 27);
    assert_eq!(result.status, OptimizationStatus::Converged);
    assert_eq!(result.method, "grid(sharpe)");
    for (_, w) in result.weights.iter() {
        assert!(w == 0.0 || w == 1.0 || w == 1.5 || w == 3.0);
    }
}

#[test]
fn test_grid_search_scores_first_batch_within_iteration_cap() {
    let series = book();
    let config = AnalysisConfig::default();
    let mut settings = quick().with_method(SearchMethod::Grid).with_max_iterations(1);
    settings.grid_steps = 3;
    let result = WeightOptimizer::new(settings)
        .unwrap()
        .optimize(&series, &config, &CancelToken::new())
        .unwrap();

    // 28 candidates in batches of 8: only the first batch is scored
    assert_eq!(result.iterations, 1);
    assert_eq!(result.evaluations, 8);
    assert_eq!(result.status, OptimizationStatus::MaxIterations);

    // The equal-weight seed leads the first batch
    let equal = blend_equal(&series, config.starting_capital).unwrap();
    let baseline = MetricsEngine::analyze(&equal.series, &config).unwrap().sharpe_ratio;
    assert!(result.objective_value >= baseline);
}

#[test]
fn test_optimizer_rejects_zero_iterations() {
    for method in [SearchMethod::DifferentialEvolution, SearchMethod::Grid] {
        let settings = quick().with_method(method).with_max_iterations(0);
        assert!(WeightOptimizer::new(settings).is_err());
    }
}

#[test]
fn test_cancelled_search_returns_best_so_far() {
    let token = CancelToken::new();
    token.cancel();
    let result = WeightOptimizer::new(quick())
        .unwrap()
        .optimize(&book(), &AnalysisConfig::default(), &token)
        .unwrap();

    assert_eq!(result.status, OptimizationStatus::Cancelled);
    assert_eq!(result.iterations, 0);
    assert_eq!(result.evaluations, 8);
    assert!(result.objective_value.is_finite());
    assert!(!result.is_complete());
}

#[test]
fn test_timeout_marks_result_timed_out() {
    let settings = quick().with_timeout(StdDuration::ZERO);
    let result = WeightOptimizer::new(settings)
        .unwrap()
        .optimize(&book(), &AnalysisConfig::default(), &CancelToken::new())
        .unwrap();
    assert_eq!(result.status, OptimizationStatus::TimedOut);
}

#[test]
fn test_optimizer_rejects_empty_input() {
    let optimizer = WeightOptimizer::new(quick()).unwrap();
    assert!(optimizer
        .optimize(&[], &AnalysisConfig::default(), &CancelToken::new())
        .is_err());
}

// ---- OptimizationCache ----

#[test]
fn test_second_request_is_cached_and_identical() {
    let cache = OptimizationCache::new(CacheSettings::default()).unwrap();
    let series = book();
    let config = AnalysisConfig::default();
    let settings = quick();
    let key = CacheKey::from_search(["trend", "carry", "bleeder"], &settings, &config);
    let runs = AtomicUsize::new(0);

    let run = || -> BlendResult<OptimizationResult> {
        runs.fetch_add(1, Ordering::SeqCst);
        WeightOptimizer::new(settings.clone())?.optimize(&series, &config, &CancelToken::new())
    };

    let first = cache.get_or_compute(&key, run).unwrap();
    let second = cache
        .get_or_compute(&key, || {
            runs.fetch_add(1, Ordering::SeqCst);
            WeightOptimizer::new(settings.clone())?.optimize(&series, &config, &CancelToken::new())
        })
        .unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(first.weights, second.weights);
    for (id, w) in first.weights.iter() {
        assert_eq!(w.to_bits(), second.weights.get(id).unwrap().to_bits());
    }
    assert!(second.method.ends_with(CACHED_MARKER));
    assert_eq!(second.method, format!("{}{}", first.method, CACHED_MARKER));
    assert_eq!(first.last_optimized, second.last_optimized);
    assert_eq!(cache.stats().hits, 1);
}

#[test]
fn test_concurrent_burst_computes_once() {
    let cache = OptimizationCache::new(CacheSettings::default()).unwrap();
    let runs = AtomicUsize::new(0);
    let key = key();

    let outcomes: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    cache
                        .get_or_compute(&key, || {
                            runs.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(StdDuration::from_millis(50));
                            Ok(canned(0.5))
                        })
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(outcomes.iter().filter(|o| !o.from_cache).count(), 1);
    assert!(outcomes.iter().all(|o| o.weights == outcomes[0].weights));
}

#[test]
fn test_different_keys_compute_independently() {
    let cache = OptimizationCache::new(CacheSettings::default()).unwrap();
    let runs = AtomicUsize::new(0);
    let keys = [key(), CacheKey::new(["a", "c"], "grid", "")];

    thread::scope(|scope| {
        for k in &keys {
            let (cache, runs) = (&cache, &runs);
            scope.spawn(move || {
                cache
                    .get_or_compute(k, || {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(canned(1.0))
                    })
                    .unwrap();
            });
        }
    });

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(cache.len(), 2);
}

#[test]
fn test_invalidation_forces_recompute() {
    let cache = OptimizationCache::new(CacheSettings::default()).unwrap();
    let key = key();
    let other = CacheKey::new(["c", "d"], "grid", "");

    cache.get_or_compute(&key, || Ok(canned(0.5))).unwrap();
    cache.get_or_compute(&other, || Ok(canned(0.5))).unwrap();
    assert_eq!(cache.len(), 2);

    assert_eq!(cache.invalidate_portfolio("a"), 1);
    assert!(cache.peek(&key).is_none());
    assert!(cache.peek(&other).is_some());

    let again = cache.get_or_compute(&key, || Ok(canned(2.0))).unwrap();
    assert!(!again.from_cache);
    assert_eq!(again.weights.get("a"), Some(2.0));

    assert!(cache.invalidate(&other));
    assert!(!cache.invalidate(&CacheKey::new(["zzz"], "grid", "")));
    cache.clear();
    assert!(cache.is_empty());
}

#[test]
fn test_invalidation_during_compute_is_not_stored() {
    let cache = OptimizationCache::new(CacheSettings::default()).unwrap();
    let key = key();

    let out = cache
        .get_or_compute(&key, || {
            // New data lands while the search is running
            cache.invalidate_portfolio("b");
            Ok(canned(0.5))
        })
        .unwrap();

    assert!(!out.stored);
    assert!(cache.peek(&key).is_none());
    assert_eq!(cache.stats().stale_drops, 1);
}

#[test]
fn test_incomplete_result_is_returned_not_cached() {
    let cache = OptimizationCache::new(CacheSettings::default()).unwrap();
    let key = key();
    let mut partial = canned(0.5);
    partial.status = OptimizationStatus::TimedOut;

    let out = cache.get_or_compute(&key, || Ok(partial.clone())).unwrap();
    assert_eq!(out.result.status, OptimizationStatus::TimedOut);
    assert!(!out.stored);
    assert!(cache.peek(&key).is_none());
    assert!(cache.store(&key, partial).is_none());
}

#[test]
fn test_compute_error_propagates() {
    let cache = OptimizationCache::new(CacheSettings::default()).unwrap();
    let key = key();
    let err = cache.get_or_compute(&key, || {
        Err(blend_core::BlendError::Optimization("boom".to_string()))
    });
    assert!(err.is_err());
    assert!(cache.peek(&key).is_none());
}

#[test]
fn test_entries_expire_after_max_age() {
    let clock = Arc::new(ManualClock::new(t0()));
    let settings = CacheSettings::with_max_age(Duration::minutes(10));
    let cache = OptimizationCache::with_clock(settings, clock.clone()).unwrap();
    let key = key();
    let runs = AtomicUsize::new(0);
    let compute = || -> BlendResult<OptimizationResult> {
        runs.fetch_add(1, Ordering::SeqCst);
        Ok(canned(0.5))
    };

    cache.get_or_compute(&key, compute).unwrap();
    clock.advance(Duration::minutes(9));
    assert!(cache.get_or_compute(&key, compute).unwrap().from_cache);
    clock.advance(Duration::minutes(2));
    assert!(!cache.get_or_compute(&key, compute).unwrap().from_cache);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn test_last_writer_wins_with_increasing_timestamps() {
    // Frozen clock: timestamps must still strictly increase
    let clock = Arc::new(ManualClock::new(t0()));
    let cache = OptimizationCache::with_clock(CacheSettings::default(), clock).unwrap();
    let key = key();

    let first = cache.refresh(&key, || Ok(canned(0.5))).unwrap();
    let second = cache.refresh(&key, || Ok(canned(0.75))).unwrap();
    let third = cache.store(&key, canned(1.25)).unwrap();

    assert!(second.last_optimized > first.last_optimized);
    assert!(third.computed_at > second.last_optimized);

    let stored = cache.peek(&key).unwrap();
    assert_eq!(stored.result.weights.get("a"), Some(1.25));
    assert_eq!(stored.sequence, 3);
}

#[test]
fn test_concurrent_writes_keep_latest_stamp() {
    // Frozen clock so every stamp comes from the monotonic nudge
    let clock = Arc::new(ManualClock::new(t0()));
    let cache = OptimizationCache::with_clock(CacheSettings::default(), clock).unwrap();
    let key = key();

    let stamps: Vec<DateTime<Utc>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let (cache, key) = (&cache, &key);
                scope.spawn(move || {
                    (0..25)
                        .map(|i| {
                            let w = (t * 100 + i) as f64;
                            if i % 2 == 0 {
                                cache.store(key, canned(w)).unwrap().computed_at
                            } else {
                                cache.refresh(key, || Ok(canned(w))).unwrap().last_optimized
                            }
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    let latest = stamps.iter().max().copied().unwrap();
    let stored = cache.peek(&key).unwrap();
    assert_eq!(stored.computed_at, latest);
    assert_eq!(stored.sequence, 200);
}

#[test]
fn test_notice_reports_newer_result() {
    let clock = Arc::new(ManualClock::new(t0()));
    let cache = OptimizationCache::with_clock(CacheSettings::default(), clock.clone()).unwrap();
    let key = key();

    assert!(!cache.notice(&key, None).available);

    let applied = cache.get_or_compute(&key, || Ok(canned(0.5))).unwrap().last_optimized;
    let notice = cache.notice(&key, Some(applied));
    assert!(!notice.available);
    assert_eq!(notice.computed_at, Some(applied));

    clock.advance(Duration::hours(1));
    cache.refresh(&key, || Ok(canned(0.6))).unwrap();
    assert!(cache.notice(&key, Some(applied)).available);

    // Notices are not lookups
    assert_eq!(cache.stats().hits, 0);
}

#[test]
fn test_cache_entry_serializes() {
    let cache = OptimizationCache::new(CacheSettings::default()).unwrap();
    let entry = cache.store(&key(), canned(0.5)).unwrap();
    let json = serde_json::to_value(&entry).unwrap();
    assert_eq!(json["result"]["status"], "max_iterations");
    assert_eq!(json["result"]["weights"]["a"], 0.5);
}

// ---- PortfolioOptimizer ----

#[test]
fn test_service_caches_by_canonical_ids() {
    let store = Arc::new(InMemorySeriesStore::new());
    for s in book() {
        store.insert(s);
    }
    let cache = Arc::new(OptimizationCache::new(CacheSettings::default()).unwrap());
    let service =
        PortfolioOptimizer::new(store.clone(), cache, quick(), AnalysisConfig::default()).unwrap();

    let first = service.optimize(&["trend", "carry"], &CancelToken::new()).unwrap();
    let second = service.optimize(&[" carry", "trend"], &CancelToken::new()).unwrap();
    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(first.weights, second.weights);

    // New data for one strategy invalidates every key that includes it
    store.insert(strategy("carry", 80.0, 150.0, 2.1));
    assert_eq!(service.series_updated("carry"), 1);
    let third = service.optimize(&["trend", "carry"], &CancelToken::new()).unwrap();
    assert!(!third.from_cache);
    assert!(service.notice(&["trend", "carry"], Some(first.last_optimized)).available);
}

#[test]
fn test_service_analyze_uses_full_weights() {
    let store = Arc::new(InMemorySeriesStore::new());
    for s in book() {
        store.insert(s);
    }
    let cache = Arc::new(OptimizationCache::new(CacheSettings::default()).unwrap());
    let service =
        PortfolioOptimizer::new(store, cache, quick(), AnalysisConfig::default()).unwrap();

    let equal = service.analyze(&["trend", "carry"], None).unwrap();
    let trend_only = service
        .analyze(
            &["trend", "carry"],
            Some(&WeightVector::from_pairs([("trend", 1.0), ("carry", 0.0)])),
        )
        .unwrap();
    assert!(equal.total_pl > trend_only.total_pl);
    assert!(service.optimize(&[], &CancelToken::new()).is_err());
    assert!(service.analyze(&["missing"], None).is_err());
}
