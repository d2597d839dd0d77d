//! Background-task queue over a cache sorted set.
//!
//! Tasks are JSON members of `memory:background_tasks`, scored by
//! `(priority, enqueued_at)` so a single `zpopmin` dequeues the most urgent,
//! oldest task. Lower priority numbers run first.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use callsheet_core::error::{Error, Result};

use crate::{keys, Cache};

/// Multiplier separating the priority band from the millisecond timestamp in
/// the zset score. Timestamps stay below 1e13 ms until the year 2286, and
/// `priority * SCALE + millis` stays exactly representable in an f64 for the
/// priorities in use.
const PRIORITY_SCALE: f64 = 1.0e13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ExtractMemory,
    ConsolidateMemory,
    Reindex,
}

/// A queued unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub id: String,
    pub kind: TaskKind,
    /// Lower runs sooner. Extraction enqueues at 5, consolidation at 8,
    /// reindexing at 9.
    pub priority: i32,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

impl BackgroundTask {
    pub fn new(kind: TaskKind, priority: i32, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            priority,
            payload,
            enqueued_at: Utc::now(),
        }
    }

    fn score(&self) -> f64 {
        f64::from(self.priority) * PRIORITY_SCALE + self.enqueued_at.timestamp_millis() as f64
    }
}

/// Handle to the shared background queue.
#[derive(Clone)]
pub struct TaskQueue {
    cache: Arc<dyn Cache>,
}

impl TaskQueue {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    pub async fn enqueue(&self, task: &BackgroundTask) -> Result<()> {
        let member = serde_json::to_vec(task)
            .map_err(|e| Error::internal(format!("serialize background task: {e}")))?;
        self.cache
            .zadd(keys::BACKGROUND_TASKS, &member, task.score())
            .await
    }

    /// Pop the most urgent task, if any. A member that fails to parse is
    /// dropped (it can never succeed) and surfaced as `DataIntegrity`.
    pub async fn dequeue(&self) -> Result<Option<BackgroundTask>> {
        let Some((member, _score)) = self.cache.zpopmin(keys::BACKGROUND_TASKS).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&member)
            .map(Some)
            .map_err(|e| Error::data_integrity(format!("corrupt background task dropped: {e}")))
    }

    pub async fn len(&self) -> Result<u64> {
        self.cache.zcard(keys::BACKGROUND_TASKS).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryCache;

    fn queue() -> TaskQueue {
        TaskQueue::new(Arc::new(MemoryCache::new()))
    }

    fn task(kind: TaskKind, priority: i32) -> BackgroundTask {
        BackgroundTask::new(kind, priority, serde_json::json!({"conversation_id": "c1"}))
    }

    #[tokio::test]
    async fn dequeue_orders_by_priority_then_age() {
        let queue = queue();

        let mut old_low = task(TaskKind::Reindex, 9);
        old_low.enqueued_at = Utc::now() - chrono::Duration::minutes(5);
        let urgent = task(TaskKind::ExtractMemory, 5);
        let mut older_urgent = task(TaskKind::ExtractMemory, 5);
        older_urgent.enqueued_at = Utc::now() - chrono::Duration::minutes(2);

        queue.enqueue(&old_low).await.unwrap();
        queue.enqueue(&urgent).await.unwrap();
        queue.enqueue(&older_urgent).await.unwrap();

        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, older_urgent.id);
        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, urgent.id);
        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, old_low.id);
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tasks_round_trip() {
        let queue = queue();
        let original = task(TaskKind::ConsolidateMemory, 8);
        queue.enqueue(&original).await.unwrap();
        let popped = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(popped, original);
    }

    #[tokio::test]
    async fn len_reflects_queue_depth() {
        let queue = queue();
        assert!(queue.is_empty().await.unwrap());
        queue.enqueue(&task(TaskKind::ExtractMemory, 5)).await.unwrap();
        queue.enqueue(&task(TaskKind::ExtractMemory, 5)).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[test]
    fn score_keeps_priority_dominant() {
        let mut urgent_new = task(TaskKind::ExtractMemory, 1);
        urgent_new.enqueued_at = Utc::now();
        let mut lazy_old = task(TaskKind::Reindex, 2);
        lazy_old.enqueued_at = Utc::now() - chrono::Duration::days(30);
        assert!(urgent_new.score() < lazy_old.score());
    }
}
