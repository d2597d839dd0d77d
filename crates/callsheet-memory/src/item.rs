//! Memory items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use callsheet_core::error::{Error, Result};
use callsheet_graph::EMBEDDING_DIM;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Semantic,
    Episodic,
    Procedural,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Semantic => "semantic",
            MemoryType::Episodic => "episodic",
            MemoryType::Procedural => "procedural",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "semantic" => Some(MemoryType::Semantic),
            "episodic" => Some(MemoryType::Episodic),
            "procedural" => Some(MemoryType::Procedural),
            _ => None,
        }
    }
}

/// A persistent, embedded, user-owned memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub user_id: String,
    pub memory_type: MemoryType,
    /// Importance in [0,1]. Re-estimable, but never drops below the floor
    /// earned through access.
    pub importance: f32,
    pub content: String,
    pub embedding: Vec<f32>,
    pub summary: String,
    pub summary_embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u32,
    pub source_turn_refs: Vec<String>,
    /// Set when a consolidation pass folded this item into a semantic one.
    /// Superseded items are retained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
}

impl MemoryItem {
    pub fn new(
        user_id: impl Into<String>,
        memory_type: MemoryType,
        content: impl Into<String>,
        summary: impl Into<String>,
        importance: f32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            memory_type,
            importance: importance.clamp(0.0, 1.0),
            content: content.into(),
            embedding: Vec::new(),
            summary: summary.into(),
            summary_embedding: Vec::new(),
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            source_turn_refs: Vec::new(),
            superseded_by: None,
        }
    }

    pub fn with_source_turns(mut self, refs: Vec<String>) -> Self {
        self.source_turn_refs = refs;
        self
    }

    /// Both embeddings must be attached and correctly sized before a write.
    pub fn validate_embeddings(&self) -> Result<()> {
        for (name, vector) in [("embedding", &self.embedding), ("summary_embedding", &self.summary_embedding)] {
            if vector.len() != EMBEDDING_DIM {
                return Err(Error::data_integrity(format!(
                    "{name} has {} dimensions, expected {EMBEDDING_DIM}",
                    vector.len()
                )));
            }
        }
        Ok(())
    }

    /// Importance floor earned through access; frequently recalled memories
    /// resist down-ranking.
    pub fn accessed_floor(&self) -> f32 {
        (self.access_count as f32 * 0.02).min(0.5)
    }

    /// Re-estimate importance, clamped to [floor, 1].
    pub fn reestimate_importance(&mut self, new_importance: f32) {
        self.importance = new_importance.clamp(self.accessed_floor(), 1.0);
    }

    /// Record a read. `access_count` only ever increments.
    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed_at = Utc::now();
    }
}
