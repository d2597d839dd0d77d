//! Conversation persistence over the cache.
//!
//! Conversations are never destroyed; inactivity archiving is a logical
//! flag, not a deletion.

use std::sync::Arc;

use callsheet_cache::{get_json, keys, set_json, Cache};
use callsheet_core::error::{Error, Result};
use callsheet_core::message::{Conversation, Turn};

#[derive(Clone)]
pub struct ConversationStore {
    cache: Arc<dyn Cache>,
}

impl ConversationStore {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    pub async fn load(&self, thread_id: &str) -> Result<Option<Conversation>> {
        get_json(self.cache.as_ref(), &keys::conversation(thread_id)).await
    }

    pub async fn save(&self, conversation: &Conversation) -> Result<()> {
        set_json(
            self.cache.as_ref(),
            &keys::conversation(&conversation.id),
            conversation,
            None,
        )
        .await
    }

    /// Load-or-create for the owning user. A conversation owned by another
    /// user is a `Forbidden` error, not a silent new thread.
    pub async fn load_or_create(&self, thread_id: &str, user_id: &str) -> Result<Conversation> {
        match self.load(thread_id).await? {
            Some(conversation) if conversation.user_id == user_id => Ok(conversation),
            Some(conversation) => Err(Error::forbidden(format!(
                "conversation {thread_id} belongs to {}",
                conversation.user_id
            ))),
            None => Ok(Conversation::new(thread_id, user_id)),
        }
    }

    /// Append a turn and persist. Writing to an archived conversation
    /// quietly un-archives it.
    pub async fn append_turn(&self, conversation: &mut Conversation, turn: Turn) -> Result<()> {
        conversation.archived_at = None;
        conversation.push_turn(turn);
        self.save(conversation).await
    }

    /// Flag a conversation as archived for inactivity. Administrative path;
    /// the record is retained in full.
    pub async fn archive(&self, thread_id: &str) -> Result<bool> {
        let Some(mut conversation) = self.load(thread_id).await? else {
            return Ok(false);
        };
        if conversation.archived_at.is_none() {
            conversation.archived_at = Some(chrono::Utc::now());
            self.save(&conversation).await?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callsheet_cache::test_support::MemoryCache;

    fn store() -> ConversationStore {
        ConversationStore::new(Arc::new(MemoryCache::new()))
    }

    #[tokio::test]
    async fn create_append_reload() {
        let store = store();
        let mut conversation = store.load_or_create("c1", "u1").await.unwrap();
        assert!(conversation.turns.is_empty());

        store
            .append_turn(&mut conversation, Turn::user("hello"))
            .await
            .unwrap();
        store
            .append_turn(&mut conversation, Turn::assistant("hi"))
            .await
            .unwrap();

        let reloaded = store.load("c1").await.unwrap().unwrap();
        assert_eq!(reloaded.turns.len(), 2);
        assert_eq!(reloaded.user_id, "u1");
    }

    #[tokio::test]
    async fn archiving_retains_and_unarchives_on_write() {
        let store = store();
        let mut conversation = store.load_or_create("c1", "u1").await.unwrap();
        store
            .append_turn(&mut conversation, Turn::user("hello"))
            .await
            .unwrap();

        assert!(store.archive("c1").await.unwrap());
        let archived = store.load("c1").await.unwrap().unwrap();
        assert!(archived.is_archived());
        assert_eq!(archived.turns.len(), 1, "archival retains history");

        let mut reopened = store.load_or_create("c1", "u1").await.unwrap();
        store
            .append_turn(&mut reopened, Turn::user("back again"))
            .await
            .unwrap();
        assert!(!store.load("c1").await.unwrap().unwrap().is_archived());

        assert!(!store.archive("missing").await.unwrap());
    }

    #[tokio::test]
    async fn other_users_conversation_is_forbidden() {
        let store = store();
        let mut conversation = store.load_or_create("c1", "u1").await.unwrap();
        store
            .append_turn(&mut conversation, Turn::user("mine"))
            .await
            .unwrap();

        let err = store.load_or_create("c1", "u2").await.unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }
}
