//! Three-tier memory.
//!
//! Tier 1: agent-graph checkpoints in the cache ([`checkpoint`]).
//! Tier 2: long-lived semantic/episodic/procedural items in the graph store
//! with vector indexes ([`manager`]), fed by background extraction and
//! compacted by consolidation ([`worker`]).
//! Tier 3: short-TTL conversation/memory context in the cache
//! ([`context`], [`conversation`]).

pub mod checkpoint;
pub mod context;
pub mod conversation;
pub mod item;
pub mod manager;
pub mod vectors;
pub mod worker;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use context::MemoryContextCache;
pub use conversation::ConversationStore;
pub use item::{MemoryItem, MemoryType};
pub use manager::{MemoryGraph, MemoryManager, MemoryRecall};
pub use worker::{ConsolidationSweeper, ExtractionTask, ExtractionWorkerPool};
