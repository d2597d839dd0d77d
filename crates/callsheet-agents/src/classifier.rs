//! Rule-based query classifier.
//!
//! Pure function over the message text: keyword buckets per agent type
//! produce a score and a confidence. The orchestrator is the only caller
//! and falls back to a small LLM call below the confidence threshold,
//! preferring the rule result on a tie.

use callsheet_core::message::AgentKind;

/// Below this confidence the orchestrator consults the LLM.
pub const CONFIDENCE_THRESHOLD: f32 = 0.25;

const SALES_KEYWORDS: &[&str] = &[
    "sale", "sales", "deal", "deals", "revenue", "client", "clients", "pitch",
    "pipeline", "lead", "leads", "pricing", "quote", "contract", "budget",
    "negotiation", "prospect",
];

const TALENT_KEYWORDS: &[&str] = &[
    "director", "directors", "crew", "cinematographer", "editor", "producer",
    "writer", "talent", "hire", "hiring", "availability", "union", "casting",
    "portfolio", "reel", "freelancer",
];

const ANALYTICS_KEYWORDS: &[&str] = &[
    "report", "reports", "performance", "roi", "trend", "trends", "metric",
    "metrics", "compare", "comparison", "analyze", "analysis", "statistics",
    "forecast", "benchmark",
];

/// Classification with per-bucket scores, for tie detection.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub agent: AgentKind,
    pub confidence: f32,
    pub scores: [(AgentKind, u32); 3],
}

impl Classification {
    /// Runner-up bucket when its score is close enough to make the query
    /// genuinely cross-domain; drives multi-agent dispatch.
    pub fn contested_runner_up(&self) -> Option<AgentKind> {
        let mut sorted = self.scores;
        sorted.sort_by(|a, b| b.1.cmp(&a.1));
        let (best, second) = (sorted[0], sorted[1]);
        if second.1 > 0 && best.1 > 0 && second.1 * 2 >= best.1 {
            Some(second.0)
        } else {
            None
        }
    }
}

fn bucket_score(text: &str, keywords: &[&str]) -> u32 {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| word.to_lowercase())
        .filter(|word| keywords.contains(&word.as_str()))
        .count() as u32
}

/// Classify a user query. Deterministic; ties and empty matches default to
/// the sales agent at zero confidence.
pub fn classify(text: &str) -> Classification {
    let lowered = text.to_lowercase();
    let scores = [
        (AgentKind::Sales, bucket_score(&lowered, SALES_KEYWORDS)),
        (AgentKind::Talent, bucket_score(&lowered, TALENT_KEYWORDS)),
        (AgentKind::Analytics, bucket_score(&lowered, ANALYTICS_KEYWORDS)),
    ];

    let total: u32 = scores.iter().map(|(_, s)| s).sum();
    // stable order makes Sales win exact ties, matching the default agent
    let best = scores
        .iter()
        .max_by_key(|(_, score)| score)
        .copied()
        .unwrap_or((AgentKind::Sales, 0));

    let confidence = if total == 0 {
        0.0
    } else {
        best.1 as f32 / (total as f32 + 2.0)
    };

    Classification {
        agent: if best.1 == 0 { AgentKind::Sales } else { best.0 },
        confidence,
        scores,
    }
}
