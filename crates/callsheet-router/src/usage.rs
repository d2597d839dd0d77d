//! Per-provider usage counters and cost estimation.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use callsheet_cache::{keys, Cache};
use callsheet_core::message::TokenUsage;

/// USD per 1K prompt / completion tokens, matched by model-name substring.
/// First match wins; unknown models fall back to the flat default.
const COST_TABLE: [(&str, f64, f64); 5] = [
    ("gpt-4o-mini", 0.000_15, 0.000_6),
    ("gpt-4o", 0.002_5, 0.01),
    ("text-embedding-3-small", 0.000_02, 0.0),
    ("Llama-3.1-70B", 0.000_88, 0.000_88),
    ("Llama-3.1-8B", 0.000_18, 0.000_18),
];

const DEFAULT_COST_PER_1K: f64 = 0.001;

/// Estimate the USD cost of one call.
pub fn estimate_cost(model: &str, usage: &TokenUsage) -> f64 {
    let (prompt_rate, completion_rate) = COST_TABLE
        .iter()
        .find(|(fragment, _, _)| model.contains(fragment))
        .map(|(_, p, c)| (*p, *c))
        .unwrap_or((DEFAULT_COST_PER_1K, DEFAULT_COST_PER_1K));

    f64::from(usage.prompt_tokens) / 1000.0 * prompt_rate
        + f64::from(usage.completion_tokens) / 1000.0 * completion_rate
}

/// Accumulated counters for one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_estimate: f64,
}

/// In-process usage accounting, flushed compactly to the cache.
#[derive(Default)]
pub struct UsageTracker {
    providers: DashMap<String, ProviderUsage>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, provider: &str, model: &str, usage: &TokenUsage) {
        let cost = estimate_cost(model, usage);
        let mut entry = self.providers.entry(provider.to_string()).or_default();
        entry.requests += 1;
        entry.prompt_tokens += u64::from(usage.prompt_tokens);
        entry.completion_tokens += u64::from(usage.completion_tokens);
        entry.cost_estimate += cost;
    }

    pub fn usage_for(&self, provider: &str) -> ProviderUsage {
        self.providers
            .get(provider)
            .map(|entry| *entry.value())
            .unwrap_or_default()
    }

    pub fn total_requests(&self) -> u64 {
        self.providers.iter().map(|e| e.requests).sum()
    }

    pub fn total_tokens(&self) -> u64 {
        self.providers
            .iter()
            .map(|e| e.prompt_tokens + e.completion_tokens)
            .sum()
    }

    /// Persist a compact snapshot under `performance:metrics:llm_usage`.
    /// Best effort; accounting must never fail a completed call.
    pub async fn persist_summary(&self, cache: &Arc<dyn Cache>) {
        let snapshot: std::collections::BTreeMap<String, ProviderUsage> = self
            .providers
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        let Ok(bytes) = serde_json::to_vec(&snapshot) else {
            return;
        };
        if let Err(e) = cache
            .lpush_capped(&keys::metric("llm_usage"), &bytes, keys::METRICS_LIST_CAP)
            .await
        {
            warn!(error = %e, "failed to persist llm usage summary");
        }
    }
}
