//! In-process metrics capability.
//!
//! Components receive an `Arc<Metrics>` and record counters and timing
//! samples; nothing here performs IO. The server periodically drains pending
//! samples into the cache (`performance:metrics:{name}` lists) and runs the
//! pure [`evaluate_thresholds`] function over the latest values to produce
//! alerts for `performance:alerts`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Samples retained per metric for trend evaluation.
const WINDOW_CAP: usize = 1000;

/// Cooldown between repeated alerts for the same metric.
pub const ALERT_COOLDOWN: Duration = Duration::from_secs(600);

/// One recorded observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Warning/critical bounds for one metric. A metric alerts when its latest
/// value reaches the bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
}

/// An alert produced by threshold evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAlert {
    pub metric: String,
    pub severity: AlertSeverity,
    pub value: f64,
    pub threshold: f64,
    pub at: DateTime<Utc>,
}

/// Default thresholds for the metrics the core emits.
pub fn default_thresholds() -> BTreeMap<String, Threshold> {
    BTreeMap::from([
        (
            "llm_response_time_ms".to_string(),
            Threshold {
                warning: 10_000.0,
                critical: 30_000.0,
            },
        ),
        (
            "graph_query_time_ms".to_string(),
            Threshold {
                warning: 1_000.0,
                critical: 2_000.0,
            },
        ),
        (
            "cache_latency_ms".to_string(),
            Threshold {
                warning: 100.0,
                critical: 500.0,
            },
        ),
        (
            "background_queue_size".to_string(),
            Threshold {
                warning: 100.0,
                critical: 500.0,
            },
        ),
        (
            "websocket_dropped_frames".to_string(),
            Threshold {
                warning: 10.0,
                critical: 100.0,
            },
        ),
    ])
}

/// Point-in-time view of the counters and the latest sample per metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub latest: BTreeMap<String, f64>,
}

/// Shared metrics recorder.
#[derive(Default)]
pub struct Metrics {
    counters: DashMap<String, u64>,
    windows: Mutex<HashMap<String, VecDeque<MetricSample>>>,
    pending: Mutex<Vec<MetricSample>>,
    last_alerts: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a named counter.
    pub fn incr(&self, name: &str) {
        self.incr_by(name, 1);
    }

    pub fn incr_by(&self, name: &str, by: u64) {
        *self.counters.entry(name.to_string()).or_insert(0) += by;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).map(|v| *v).unwrap_or(0)
    }

    /// Record a timing/gauge observation.
    pub fn observe(&self, name: &str, value: f64) {
        let sample = MetricSample {
            name: name.to_string(),
            value,
            timestamp: Utc::now(),
        };
        {
            let mut windows = self.windows.lock();
            let window = windows.entry(name.to_string()).or_default();
            if window.len() == WINDOW_CAP {
                window.pop_front();
            }
            window.push_back(sample.clone());
        }
        self.pending.lock().push(sample);
    }

    /// Record a duration in milliseconds.
    pub fn observe_duration(&self, name: &str, elapsed: Duration) {
        self.observe(name, elapsed.as_secs_f64() * 1000.0);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        let latest = self
            .windows
            .lock()
            .iter()
            .filter_map(|(name, window)| window.back().map(|s| (name.clone(), s.value)))
            .collect();
        MetricsSnapshot { counters, latest }
    }

    /// Take all samples accumulated since the last drain, for persistence.
    pub fn drain_pending(&self) -> Vec<MetricSample> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Evaluate thresholds over the current snapshot, honoring the
    /// per-metric alert cooldown.
    pub fn check_thresholds(&self, thresholds: &BTreeMap<String, Threshold>) -> Vec<PerformanceAlert> {
        let snapshot = self.snapshot();
        let now = Utc::now();
        let mut last_alerts = self.last_alerts.lock();
        let alerts = evaluate_thresholds(&snapshot.latest, thresholds, &last_alerts, ALERT_COOLDOWN, now);
        for alert in &alerts {
            last_alerts.insert(alert.metric.clone(), alert.at);
        }
        alerts
    }
}

/// Pure threshold evaluation over the latest value per metric.
///
/// A metric alerts at `critical` severity first; otherwise at `warning`.
/// Metrics alerted within `cooldown` of `now` are suppressed.
pub fn evaluate_thresholds(
    latest: &BTreeMap<String, f64>,
    thresholds: &BTreeMap<String, Threshold>,
    last_alerts: &HashMap<String, DateTime<Utc>>,
    cooldown: Duration,
    now: DateTime<Utc>,
) -> Vec<PerformanceAlert> {
    let cooldown = chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::seconds(600));
    let mut alerts = Vec::new();

    for (name, threshold) in thresholds {
        let Some(&value) = latest.get(name) else {
            continue;
        };
        let (severity, bound) = if value >= threshold.critical {
            (AlertSeverity::Critical, threshold.critical)
        } else if value >= threshold.warning {
            (AlertSeverity::Warning, threshold.warning)
        } else {
            continue;
        };

        if let Some(last) = last_alerts.get(name) {
            if now - *last < cooldown {
                continue;
            }
        }

        alerts.push(PerformanceAlert {
            metric: name.clone(),
            severity,
            value,
            threshold: bound,
            at: now,
        });
    }

    alerts
}
