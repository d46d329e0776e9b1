use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of per-slug call records retained.
pub const MAX_RELIABILITY_ENTRIES: usize = 1000;

/// A single recorded call outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReliabilityRecordPoint {
    pub latency_ms: u64,
    pub status_code: u16,
    pub timestamp: DateTime<Utc>,
}

/// The composite reliability score returned by `getScore`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ReliabilityScore {
    pub error_rate: f64,
    pub uptime: f64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
    pub latency_score: f64,
    pub quality_score: u8,
    pub sample_count: usize,
}

impl ReliabilityScore {
    /// All-green defaults returned when there are no non-429 samples.
    pub fn all_green_defaults() -> Self {
        Self {
            error_rate: 0.0,
            uptime: 1.0,
            p50_latency_ms: 0,
            p95_latency_ms: 0,
            p99_latency_ms: 0,
            latency_score: 100.0,
            quality_score: 100,
            sample_count: 0,
        }
    }
}
