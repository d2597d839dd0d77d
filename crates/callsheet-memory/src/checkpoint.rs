//! Short-term checkpoint store.
//!
//! Agent-graph state is snapshotted per conversation step under
//! `checkpoint:{thread_id}:{step}` with a separate latest-step pointer.
//! Checkpoints for a conversation always form a prefix-contiguous sequence:
//! saving step k discards everything above k, so resuming from k replays
//! exactly the recorded history.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use callsheet_cache::{keys, Cache};
use callsheet_core::error::{Error, Result};

/// One snapshot of agent state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint<S> {
    pub thread_id: String,
    pub step: u32,
    pub state: S,
    pub recorded_at: DateTime<Utc>,
}

impl<S> Checkpoint<S> {
    pub fn new(thread_id: impl Into<String>, step: u32, state: S) -> Self {
        Self {
            thread_id: thread_id.into(),
            step,
            state,
            recorded_at: Utc::now(),
        }
    }
}

/// Cache-backed checkpoint store for one state type.
pub struct CheckpointStore<S> {
    cache: Arc<dyn Cache>,
    _state: PhantomData<fn() -> S>,
}

impl<S> CheckpointStore<S>
where
    S: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            cache,
            _state: PhantomData,
        }
    }

    async fn latest_step(&self, thread_id: &str) -> Result<Option<u32>> {
        let Some(bytes) = self.cache.get(&keys::checkpoint_latest(thread_id)).await? else {
            return Ok(None);
        };
        let text = String::from_utf8(bytes)
            .map_err(|e| Error::internal(format!("corrupt latest pointer: {e}")))?;
        text.parse()
            .map(Some)
            .map_err(|e| Error::internal(format!("corrupt latest pointer: {e}")))
    }

    /// Persist a checkpoint. Saving step k truncates any checkpoints above
    /// k, keeping the sequence prefix-contiguous; a gap beyond latest+1 is a
    /// caller bug surfaced as `DataIntegrity`.
    pub async fn save(&self, checkpoint: &Checkpoint<S>) -> Result<()> {
        let latest = self.latest_step(&checkpoint.thread_id).await?;
        if let Some(latest) = latest {
            if checkpoint.step > latest + 1 {
                return Err(Error::data_integrity(format!(
                    "checkpoint step {} would leave a gap (latest is {latest})",
                    checkpoint.step
                )));
            }
            // rewinding to k discards everything above k
            for stale in (checkpoint.step + 1)..=latest {
                self.cache
                    .delete(&keys::checkpoint(&checkpoint.thread_id, stale))
                    .await?;
            }
        } else if checkpoint.step != 0 {
            return Err(Error::data_integrity(format!(
                "first checkpoint for {} must be step 0, got {}",
                checkpoint.thread_id, checkpoint.step
            )));
        }

        // JSON, not a compact binary codec: agent states embed arbitrary
        // tool-argument JSON, which a non-self-describing format cannot
        // round-trip
        let bytes = serde_json::to_vec(checkpoint)
            .map_err(|e| Error::internal(format!("serialize checkpoint: {e}")))?;
        self.cache
            .set(&keys::checkpoint(&checkpoint.thread_id, checkpoint.step), &bytes, None)
            .await?;
        self.cache
            .set(
                &keys::checkpoint_latest(&checkpoint.thread_id),
                checkpoint.step.to_string().as_bytes(),
                None,
            )
            .await?;
        debug!(thread_id = %checkpoint.thread_id, step = checkpoint.step, "checkpoint saved");
        Ok(())
    }

    pub async fn load(&self, thread_id: &str, step: u32) -> Result<Option<Checkpoint<S>>> {
        let Some(bytes) = self.cache.get(&keys::checkpoint(thread_id, step)).await? else {
            return Ok(None);
        };
        let checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| Error::internal(format!("deserialize checkpoint: {e}")))?;
        Ok(Some(checkpoint))
    }

    /// Latest checkpoint for a conversation, if any.
    pub async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint<S>>> {
        match self.latest_step(thread_id).await? {
            Some(step) => self.load(thread_id, step).await,
            None => Ok(None),
        }
    }

    /// Resume bookkeeping: discard all checkpoints above `step`.
    pub async fn truncate_after(&self, thread_id: &str, step: u32) -> Result<()> {
        if let Some(latest) = self.latest_step(thread_id).await? {
            for stale in (step + 1)..=latest {
                self.cache.delete(&keys::checkpoint(thread_id, stale)).await?;
            }
            if latest > step {
                self.cache
                    .set(
                        &keys::checkpoint_latest(thread_id),
                        step.to_string().as_bytes(),
                        None,
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
