//! Z-score anomaly detection against calibrated metric baselines
//!
//! Baselines hold per-metric statistics with a TTL. Detection compares a
//! current value to its baseline: past 2σ is a warning, past 3σ is critical.

use chrono::{DateTime, Duration, Utc};
use nexus_common::Severity;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Statistical baseline for one metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineMetric {
    pub mean: f64,
    pub std: f64,
    pub p50: f64,
    pub p95: f64,
    pub expires_at: DateTime<Utc>,
}

/// Result of one anomaly check.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyVerdict {
    pub anomaly: bool,
    pub severity: Severity,
    pub z_score: f64,
    pub evidence: String,
}

/// Z-score detector over the calibrated baselines.
pub struct AnomalyDetector {
    baselines: RwLock<HashMap<String, BaselineMetric>>,
}

impl AnomalyDetector {
    pub fn new() -> Self {
        AnomalyDetector {
            baselines: RwLock::new(HashMap::new()),
        }
    }

    /// Calibrate a metric's baseline from observed samples.
    pub fn calibrate(&self, metric: &str, samples: &[f64], ttl_hours: i64) {
        if samples.is_empty() {
            return;
        }

        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let variance =
            samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / samples.len() as f64;

        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let percentile = |p: f64| {
            let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };

        self.baselines.write().insert(
            metric.to_string(),
            BaselineMetric {
                mean,
                std: variance.sqrt(),
                p50: percentile(0.50),
                p95: percentile(0.95),
                expires_at: Utc::now() + Duration::hours(ttl_hours),
            },
        );
    }

    pub fn baseline(&self, metric: &str) -> Option<BaselineMetric> {
        let baselines = self.baselines.read();
        baselines
            .get(metric)
            .filter(|b| b.expires_at > Utc::now())
            .cloned()
    }

    /// Compare a current value to its baseline.
    pub fn detect(&self, metric: &str, current_value: f64) -> AnomalyVerdict {
        let Some(baseline) = self.baseline(metric) else {
            return AnomalyVerdict {
                anomaly: false,
                severity: Severity::Green,
                z_score: 0.0,
                evidence: format!("No baseline for {metric}"),
            };
        };

        let z_score = if baseline.std == 0.0 {
            0.0
        } else {
            (current_value - baseline.mean) / baseline.std
        };

        if z_score > 3.0 {
            AnomalyVerdict {
                anomaly: true,
                severity: Severity::Red,
                z_score,
                evidence: format!("{metric} is {z_score:.1}sigma above baseline"),
            }
        } else if z_score > 2.0 {
            AnomalyVerdict {
                anomaly: true,
                severity: Severity::Yellow,
                z_score,
                evidence: format!("{metric} is {z_score:.1}sigma above baseline"),
            }
        } else {
            AnomalyVerdict {
                anomaly: false,
                severity: Severity::Green,
                z_score,
                evidence: format!("{metric} is {z_score:.1}sigma from baseline (normal)"),
            }
        }
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new()
    }
}
