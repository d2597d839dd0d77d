//! Persists metric samples and alerts to the cache.
//!
//! Samples land in `performance:metrics:{name}` lists (cap 1000), alerts in
//! `performance:alerts` (cap 100). Flushing is best effort: metric loss must
//! never fail the operation that produced the sample.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use callsheet_core::metrics::{Metrics, Threshold};

use crate::{keys, Cache};

/// Drains pending samples from a [`Metrics`] recorder into the cache and
/// evaluates thresholds, appending any alerts.
pub struct MetricsSink {
    cache: Arc<dyn Cache>,
    thresholds: BTreeMap<String, Threshold>,
}

impl MetricsSink {
    pub fn new(cache: Arc<dyn Cache>, thresholds: BTreeMap<String, Threshold>) -> Self {
        Self { cache, thresholds }
    }

    /// One flush cycle. Returns the number of alerts raised.
    pub async fn flush(&self, metrics: &Metrics) -> usize {
        for sample in metrics.drain_pending() {
            let key = keys::metric(&sample.name);
            match serde_json::to_vec(&sample) {
                Ok(bytes) => {
                    if let Err(e) = self
                        .cache
                        .lpush_capped(&key, &bytes, keys::METRICS_LIST_CAP)
                        .await
                    {
                        warn!(metric = %sample.name, error = %e, "metric flush failed");
                    }
                }
                Err(e) => warn!(metric = %sample.name, error = %e, "metric serialize failed"),
            }
        }

        let alerts = metrics.check_thresholds(&self.thresholds);
        for alert in &alerts {
            match serde_json::to_vec(alert) {
                Ok(bytes) => {
                    if let Err(e) = self
                        .cache
                        .lpush_capped(keys::PERFORMANCE_ALERTS, &bytes, keys::ALERTS_LIST_CAP)
                        .await
                    {
                        warn!(metric = %alert.metric, error = %e, "alert flush failed");
                    }
                }
                Err(e) => warn!(metric = %alert.metric, error = %e, "alert serialize failed"),
            }
        }
        alerts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryCache;
    use callsheet_core::metrics::{default_thresholds, MetricSample, PerformanceAlert};

    #[tokio::test]
    async fn flush_persists_samples_and_alerts() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let sink = MetricsSink::new(Arc::clone(&cache), default_thresholds());
        let metrics = Metrics::new();

        metrics.observe("graph_query_time_ms", 12.0);
        metrics.observe("llm_response_time_ms", 45_000.0); // critical

        let raised = sink.flush(&metrics).await;
        assert_eq!(raised, 1);

        let samples = cache
            .lrange(&keys::metric("graph_query_time_ms"), 0, -1)
            .await
            .unwrap();
        assert_eq!(samples.len(), 1);
        let sample: MetricSample = serde_json::from_slice(&samples[0]).unwrap();
        assert_eq!(sample.value, 12.0);

        let alerts = cache.lrange(keys::PERFORMANCE_ALERTS, 0, -1).await.unwrap();
        assert_eq!(alerts.len(), 1);
        let alert: PerformanceAlert = serde_json::from_slice(&alerts[0]).unwrap();
        assert_eq!(alert.metric, "llm_response_time_ms");
    }

    #[tokio::test]
    async fn second_flush_is_empty_without_new_samples() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let sink = MetricsSink::new(Arc::clone(&cache), default_thresholds());
        let metrics = Metrics::new();

        metrics.observe("cache_latency_ms", 3.0);
        sink.flush(&metrics).await;
        sink.flush(&metrics).await;

        let samples = cache
            .lrange(&keys::metric("cache_latency_ms"), 0, -1)
            .await
            .unwrap();
        assert_eq!(samples.len(), 1);
    }
}
