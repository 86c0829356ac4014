//! Sliding-window time series of funding rates, mark prices and spreads.
//!
//! One ring buffer per (venue, symbol) series, owned by the store. Writers
//! append monotonically; readers see raw samples, never interpolations.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::model::units::Price;
use crate::model::VenueId;

/// Spread samples at or below this are counted as "dropped to zero".
const ZERO_SPREAD_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Samples older than this are pruned on append.
    pub retention_secs: i64,
    /// Half-life of the exponential weighting in hours.
    pub half_life_hours: f64,
    /// Below this many samples, the weighted average falls back to the
    /// newest raw sample.
    pub min_samples: usize,
    /// Two venues' samples pair up when their timestamps are within this.
    pub match_tolerance_secs: i64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig {
            retention_secs: 30 * 24 * 3600,
            half_life_hours: 24.0,
            min_samples: 6,
            match_tolerance_secs: 300,
        }
    }
}

/// Volatility profile of a spread series over a window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SpreadVolatilityMetrics {
    /// 1.0 = rock stable, 0.0 = noise.
    pub stability_score: f64,
    /// Largest per-hour absolute change observed.
    pub max_hourly_change: f64,
    /// Direction reversals between consecutive samples.
    pub reversal_count: u32,
    /// Times the spread collapsed to ~zero from above.
    pub drops_to_zero_count: u32,
}

// ── Series ──────────────────────────────────────────────────────────

/// Monotonic (timestamp, value) ring. Capacity is enforced by time-based
/// pruning rather than a fixed length.
#[derive(Debug, Default)]
struct Series {
    points: VecDeque<(i64, f64)>,
}

impl Series {
    /// Append one sample. Out-of-order timestamps are rejected.
    fn push(&mut self, ts: i64, value: f64, retention_secs: i64) -> bool {
        if let Some(&(last, _)) = self.points.back() {
            if ts < last {
                return false;
            }
        }
        self.points.push_back((ts, value));
        let cutoff = ts - retention_secs;
        while let Some(&(front, _)) = self.points.front() {
            if front < cutoff {
                self.points.pop_front();
            } else {
                break;
            }
        }
        true
    }

    /// Samples with `ts >= from`, located by binary search.
    fn window(&self, from: i64) -> impl Iterator<Item = &(i64, f64)> {
        let start = self.points.partition_point(|&(ts, _)| ts < from);
        self.points.range(start..)
    }

    fn latest(&self) -> Option<(i64, f64)> {
        self.points.back().copied()
    }

    fn len(&self) -> usize {
        self.points.len()
    }
}

type SeriesHandle = Arc<RwLock<Series>>;

// ── Store ───────────────────────────────────────────────────────────

/// Multi-reader store with a lock per series; the outer maps are only
/// locked to find or create a series handle.
pub struct HistoricalStore {
    config: HistoryConfig,
    funding: RwLock<HashMap<(VenueId, String), SeriesHandle>>,
    marks: RwLock<HashMap<(VenueId, String), SeriesHandle>>,
    spreads: RwLock<HashMap<(String, VenueId, VenueId), SeriesHandle>>,
}

impl HistoricalStore {
    pub fn new(config: HistoryConfig) -> Self {
        HistoricalStore {
            config,
            funding: RwLock::new(HashMap::new()),
            marks: RwLock::new(HashMap::new()),
            spreads: RwLock::new(HashMap::new()),
        }
    }

    fn series<K: std::hash::Hash + Eq + Clone>(
        map: &RwLock<HashMap<K, SeriesHandle>>,
        key: &K,
    ) -> SeriesHandle {
        if let Some(handle) = map.read().unwrap().get(key) {
            return handle.clone();
        }
        map.write()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    fn existing<K: std::hash::Hash + Eq>(
        map: &RwLock<HashMap<K, SeriesHandle>>,
        key: &K,
    ) -> Option<SeriesHandle> {
        map.read().unwrap().get(key).cloned()
    }

    // ── Writers ─────────────────────────────────────────────────────

    /// Record a per-interval funding rate sample. Returns false when the
    /// timestamp is older than the series tail.
    pub fn record_funding(&self, venue: &str, symbol: &str, ts: i64, per_interval: f64) -> bool {
        let key = (venue.to_string(), symbol.to_string());
        let handle = Self::series(&self.funding, &key);
        let ok = handle
            .write()
            .unwrap()
            .push(ts, per_interval, self.config.retention_secs);
        if !ok {
            tracing::debug!(venue, symbol, ts, "rejected out-of-order funding sample");
        }
        ok
    }

    pub fn record_mark(&self, venue: &str, symbol: &str, ts: i64, price: Price) -> bool {
        let key = (venue.to_string(), symbol.to_string());
        let handle = Self::series(&self.marks, &key);
        let ok = handle
            .write()
            .unwrap()
            .push(ts, price.0, self.config.retention_secs);
        ok
    }

    pub fn record_spread(
        &self,
        symbol: &str,
        long_venue: &str,
        short_venue: &str,
        ts: i64,
        spread: f64,
    ) -> bool {
        let key = (
            symbol.to_string(),
            long_venue.to_string(),
            short_venue.to_string(),
        );
        let handle = Self::series(&self.spreads, &key);
        let ok = handle
            .write()
            .unwrap()
            .push(ts, spread, self.config.retention_secs);
        ok
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Exponentially-weighted average funding rate with the configured
    /// half-life. Falls back to the newest raw sample below `min_samples`;
    /// `None` when the series is empty.
    pub fn weighted_average_rate(&self, venue: &str, symbol: &str, now: i64) -> Option<f64> {
        let key = (venue.to_string(), symbol.to_string());
        let handle = Self::existing(&self.funding, &key)?;
        let series = handle.read().unwrap();
        let latest = series.latest()?;
        if series.len() < self.config.min_samples {
            return Some(latest.1);
        }
        let half_life_secs = self.config.half_life_hours * 3600.0;
        let mut weighted = 0.0;
        let mut weight_sum = 0.0;
        for &(ts, value) in series.points.iter() {
            let age = (now - ts).max(0) as f64;
            let weight = 0.5_f64.powf(age / half_life_secs);
            weighted += value * weight;
            weight_sum += weight;
        }
        if weight_sum <= 0.0 {
            return Some(latest.1);
        }
        Some(weighted / weight_sum)
    }

    /// Mean |long − short| over timestamp-matched samples of the two
    /// venues' funding series in the window. `None` when nothing matches.
    pub fn average_spread(
        &self,
        symbol: &str,
        long_venue: &str,
        short_venue: &str,
        window_secs: i64,
        now: i64,
    ) -> Option<f64> {
        let long_key = (long_venue.to_string(), symbol.to_string());
        let short_key = (short_venue.to_string(), symbol.to_string());
        let long_handle = Self::existing(&self.funding, &long_key)?;
        let short_handle = Self::existing(&self.funding, &short_key)?;
        let long_series = long_handle.read().unwrap();
        let short_series = short_handle.read().unwrap();

        let from = now - window_secs;
        let shorts: Vec<(i64, f64)> = short_series.window(from).copied().collect();
        if shorts.is_empty() {
            return None;
        }

        let tolerance = self.config.match_tolerance_secs;
        let mut sum = 0.0;
        let mut count = 0usize;
        let mut cursor = 0usize;
        for &(ts, long_rate) in long_series.window(from) {
            // Both series are monotonic, so the match cursor only advances
            while cursor + 1 < shorts.len() && shorts[cursor].0 < ts - tolerance {
                cursor += 1;
            }
            let (short_ts, short_rate) = shorts[cursor];
            if (short_ts - ts).abs() <= tolerance {
                sum += (long_rate - short_rate).abs();
                count += 1;
            }
        }
        if count == 0 {
            return None;
        }
        Some(sum / count as f64)
    }

    /// Volatility metrics of the recorded spread series over a window.
    pub fn spread_volatility_metrics(
        &self,
        symbol: &str,
        long_venue: &str,
        short_venue: &str,
        window_secs: i64,
        now: i64,
    ) -> SpreadVolatilityMetrics {
        let key = (
            symbol.to_string(),
            long_venue.to_string(),
            short_venue.to_string(),
        );
        let Some(handle) = Self::existing(&self.spreads, &key) else {
            return SpreadVolatilityMetrics::default();
        };
        let series = handle.read().unwrap();
        let points: Vec<(i64, f64)> = series.window(now - window_secs).copied().collect();
        if points.len() < 2 {
            return SpreadVolatilityMetrics {
                stability_score: 0.0,
                ..Default::default()
            };
        }

        let mut max_hourly_change = 0.0_f64;
        let mut reversal_count = 0u32;
        let mut drops_to_zero_count = 0u32;
        let mut prev_delta = 0.0_f64;
        for pair in points.windows(2) {
            let (t0, v0) = pair[0];
            let (t1, v1) = pair[1];
            let dt_hours = ((t1 - t0).max(1)) as f64 / 3600.0;
            let delta = v1 - v0;
            max_hourly_change = max_hourly_change.max(delta.abs() / dt_hours);
            if prev_delta * delta < 0.0 {
                reversal_count += 1;
            }
            if delta.abs() > 0.0 {
                prev_delta = delta;
            }
            if v0 > ZERO_SPREAD_EPSILON && v1 <= ZERO_SPREAD_EPSILON {
                drops_to_zero_count += 1;
            }
        }

        let n = points.len() as f64;
        let mean = points.iter().map(|&(_, v)| v).sum::<f64>() / n;
        let var = points
            .iter()
            .map(|&(_, v)| (v - mean).powi(2))
            .sum::<f64>()
            / (n - 1.0);
        let cv = if mean.abs() > 0.0 {
            var.sqrt() / mean.abs()
        } else {
            f64::INFINITY
        };
        let mut stability = if cv.is_finite() { 1.0 / (1.0 + cv) } else { 0.0 };
        stability -= 0.05 * drops_to_zero_count as f64;

        SpreadVolatilityMetrics {
            stability_score: stability.clamp(0.0, 1.0),
            max_hourly_change,
            reversal_count,
            drops_to_zero_count,
        }
    }

    /// Most recent recorded mark price for a series.
    pub fn latest_mark(&self, venue: &str, symbol: &str) -> Option<Price> {
        let key = (venue.to_string(), symbol.to_string());
        let handle = Self::existing(&self.marks, &key)?;
        let latest = handle.read().unwrap().latest()?;
        Some(Price(latest.1))
    }

    /// Raw funding samples for quality gating.
    pub fn historical_funding(&self, venue: &str, symbol: &str) -> Vec<(i64, f64)> {
        let key = (venue.to_string(), symbol.to_string());
        match Self::existing(&self.funding, &key) {
            Some(handle) => handle.read().unwrap().points.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Number of funding samples held for a series.
    pub fn funding_sample_count(&self, venue: &str, symbol: &str) -> usize {
        let key = (venue.to_string(), symbol.to_string());
        Self::existing(&self.funding, &key)
            .map(|h| h.read().unwrap().len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_samples_are_rejected() {
        let store = HistoricalStore::new(HistoryConfig::default());
        assert!(store.record_funding("a", "ETH", 100, 0.0003));
        assert!(!store.record_funding("a", "ETH", 50, 0.0004));
        assert_eq!(store.funding_sample_count("a", "ETH"), 1);
    }

    #[test]
    fn weighted_average_falls_back_below_min_samples() {
        let store = HistoricalStore::new(HistoryConfig {
            min_samples: 10,
            ..Default::default()
        });
        store.record_funding("a", "ETH", 100, 0.0001);
        store.record_funding("a", "ETH", 200, 0.0005);
        // Two samples < min: newest raw value wins
        assert_eq!(store.weighted_average_rate("a", "ETH", 300), Some(0.0005));
    }

    #[test]
    fn recent_samples_dominate_the_weighted_average() {
        let store = HistoricalStore::new(HistoryConfig {
            min_samples: 2,
            half_life_hours: 1.0,
            ..Default::default()
        });
        let now = 100_000;
        // Old sample far beyond several half-lives, then a recent one
        store.record_funding("a", "ETH", now - 10 * 3600, 0.001);
        store.record_funding("a", "ETH", now, 0.0002);
        let avg = store.weighted_average_rate("a", "ETH", now).unwrap();
        assert!((avg - 0.0002).abs() < 1e-4, "avg {avg} should be near recent");
    }

    #[test]
    fn average_spread_matches_within_tolerance() {
        let store = HistoricalStore::new(HistoryConfig::default());
        for i in 0..5 {
            let ts = 1000 + i * 600;
            store.record_funding("a", "ETH", ts, 0.0003);
            store.record_funding("b", "ETH", ts + 60, 0.0001);
        }
        let avg = store
            .average_spread("ETH", "a", "b", 10_000, 5000)
            .unwrap();
        assert!((avg - 0.0002).abs() < 1e-9);
    }

    #[test]
    fn retention_prunes_old_samples() {
        let store = HistoricalStore::new(HistoryConfig {
            retention_secs: 1000,
            ..Default::default()
        });
        store.record_funding("a", "ETH", 0, 0.1);
        store.record_funding("a", "ETH", 2000, 0.2);
        assert_eq!(store.funding_sample_count("a", "ETH"), 1);
    }

    #[test]
    fn stable_spread_scores_high() {
        let store = HistoricalStore::new(HistoryConfig::default());
        for i in 0..24 {
            store.record_spread("ETH", "a", "b", i * 3600, 0.00025);
        }
        let m = store.spread_volatility_metrics("ETH", "a", "b", 100 * 3600, 24 * 3600);
        assert!(m.stability_score > 0.9);
        assert_eq!(m.reversal_count, 0);
        assert_eq!(m.drops_to_zero_count, 0);
    }
}
