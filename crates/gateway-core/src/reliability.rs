//! Per-slug reliability scoring. Records are kept in a bounded
//! in-process ring per slug; `getScore` recomputes from the raw samples but
//! caches the result for 60s so a thundering herd of pricing-engine polls
//! doesn't re-sort the same window repeatedly.

use chrono::{DateTime, Utc};
use gateway_types::{ReliabilityRecordPoint, ReliabilityScore, MAX_RELIABILITY_ENTRIES};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};

const SCORE_CACHE_TTL: Duration = Duration::from_secs(60);
const LATENCY_FLOOR_MS: f64 = 100.0;
const LATENCY_CEIL_MS: f64 = 5000.0;

pub struct ReliabilityAggregator {
    records: RwLock<HashMap<String, VecDeque<ReliabilityRecordPoint>>>,
    cache: RwLock<HashMap<String, (ReliabilityScore, Instant)>>,
}

impl ReliabilityAggregator {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// `record`: append the point, trimming the oldest excess once the
    /// per-slug window exceeds [`MAX_RELIABILITY_ENTRIES`].
    pub fn record(&self, slug: &str, point: ReliabilityRecordPoint) {
        let mut records = self.records.write().unwrap();
        let window = records.entry(slug.to_string()).or_insert_with(VecDeque::new);
        window.push_back(point);
        while window.len() > MAX_RELIABILITY_ENTRIES {
            window.pop_front();
        }
        drop(records);
        self.cache.write().unwrap().remove(slug);
    }

    /// `getScore`, with a 60s cached result per slug.
    pub fn get_score(&self, slug: &str) -> ReliabilityScore {
        if let Some((score, at)) = self.cache.read().unwrap().get(slug) {
            if at.elapsed() < SCORE_CACHE_TTL {
                return *score;
            }
        }

        let score = self.compute_score(slug);
        self.cache
            .write()
            .unwrap()
            .insert(slug.to_string(), (score, Instant::now()));
        score
    }

    fn compute_score(&self, slug: &str) -> ReliabilityScore {
        let records = self.records.read().unwrap();
        let Some(window) = records.get(slug) else {
            return ReliabilityScore::all_green_defaults();
        };

        let non_rate_limited: Vec<&ReliabilityRecordPoint> = window
            .iter()
            .filter(|p| p.status_code != 429)
            .collect();
        let n = non_rate_limited.len();
        if n == 0 {
            return ReliabilityScore::all_green_defaults();
        }

        let error_count = non_rate_limited
            .iter()
            .filter(|p| p.status_code >= 400)
            .count();
        let server_error_count = non_rate_limited
            .iter()
            .filter(|p| p.status_code >= 500)
            .count();
        let error_rate = error_count as f64 / n as f64;
        let uptime = (n - server_error_count) as f64 / n as f64;

        let mut latencies: Vec<u64> = window.iter().map(|p| p.latency_ms).collect();
        latencies.sort_unstable();
        let p50 = percentile(&latencies, 0.50);
        let p95 = percentile(&latencies, 0.95);
        let p99 = percentile(&latencies, 0.99);

        let latency_score = latency_score_for(p95 as f64);
        let quality = (uptime * 100.0 * 0.6 + latency_score * 0.4).round().clamp(0.0, 100.0) as u8;

        ReliabilityScore {
            error_rate,
            uptime,
            p50_latency_ms: p50,
            p95_latency_ms: p95,
            p99_latency_ms: p99,
            latency_score,
            quality_score: quality,
            sample_count: n,
        }
    }
}

impl Default for ReliabilityAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// `idx = max(0, min(ceil(p*n) - 1, n - 1))` over the ascending-sorted array.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    let n = sorted.len();
    if n == 0 {
        return 0;
    }
    let raw_idx = (p * n as f64).ceil() as i64 - 1;
    let idx = raw_idx.clamp(0, n as i64 - 1) as usize;
    sorted[idx]
}

/// Linear interpolation between 100 at `LATENCY_FLOOR_MS` and 0 at `LATENCY_CEIL_MS`.
fn latency_score_for(p95_ms: f64) -> f64 {
    if p95_ms <= LATENCY_FLOOR_MS {
        100.0
    } else if p95_ms >= LATENCY_CEIL_MS {
        0.0
    } else {
        100.0 * (LATENCY_CEIL_MS - p95_ms) / (LATENCY_CEIL_MS - LATENCY_FLOOR_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(latency_ms: u64, status_code: u16) -> ReliabilityRecordPoint {
        ReliabilityRecordPoint {
            latency_ms,
            status_code,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn no_records_returns_all_green() {
        let aggregator = ReliabilityAggregator::new();
        assert_eq!(aggregator.get_score("unknown"), ReliabilityScore::all_green_defaults());
    }

    #[test]
    fn all_429s_returns_all_green() {
        let aggregator = ReliabilityAggregator::new();
        for _ in 0..5 {
            aggregator.record("rate-limited-only", point(50, 429));
        }
        assert_eq!(
            aggregator.get_score("rate-limited-only"),
            ReliabilityScore::all_green_defaults()
        );
    }

    #[test]
    fn errors_and_uptime_exclude_429_from_denominator() {
        let aggregator = ReliabilityAggregator::new();
        aggregator.record("mixed", point(50, 200));
        aggregator.record("mixed", point(50, 200));
        aggregator.record("mixed", point(50, 500));
        aggregator.record("mixed", point(10, 429));

        let score = aggregator.get_score("mixed");
        assert_eq!(score.sample_count, 3);
        assert!((score.error_rate - (1.0 / 3.0)).abs() < 1e-9);
        assert!((score.uptime - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn latency_score_is_100_at_floor_and_0_at_ceiling() {
        assert_eq!(latency_score_for(50.0), 100.0);
        assert_eq!(latency_score_for(100.0), 100.0);
        assert_eq!(latency_score_for(5000.0), 0.0);
        assert_eq!(latency_score_for(10_000.0), 0.0);
        assert!((latency_score_for(2550.0) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn trims_oldest_beyond_max_entries() {
        let aggregator = ReliabilityAggregator::new();
        for i in 0..(MAX_RELIABILITY_ENTRIES + 10) {
            aggregator.record("busy", point(i as u64, 200));
        }
        let records = aggregator.records.read().unwrap();
        assert_eq!(records.get("busy").unwrap().len(), MAX_RELIABILITY_ENTRIES);
    }
}
