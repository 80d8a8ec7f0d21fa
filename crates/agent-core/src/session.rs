//! Conversation Storage
//!
//! The loop reads and appends history through [`ConversationStore`]. History
//! is append-only: the store offers no way to rewrite or remove a content.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::message::{Content, Conversation};

/// Custom-metadata key holding the checkpoint list
pub const CHECKPOINTS_KEY: &str = "checkpoints";

/// Unique conversation identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot marker recorded after a turn that appended to history
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub conversation_id: ConversationId,
    /// History length at the time of the checkpoint
    pub history_len: usize,
    pub iteration: u32,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(conversation_id: ConversationId, history_len: usize, iteration: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id,
            history_len,
            iteration,
            created_at: Utc::now(),
        }
    }
}

/// Conversation store collaborator
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Append one content to the end of the history
    async fn append_content(&self, id: &ConversationId, content: Content) -> Result<()>;

    /// Full history snapshot; unknown conversations are empty
    async fn get_history(&self, id: &ConversationId) -> Result<Vec<Content>>;

    async fn get_custom_metadata(&self, id: &ConversationId, key: &str) -> Result<Option<Value>>;

    async fn set_custom_metadata(&self, id: &ConversationId, key: &str, value: Value) -> Result<()>;

    /// Append a checkpoint to the list under [`CHECKPOINTS_KEY`] and return the list
    async fn record_checkpoint(&self, checkpoint: Checkpoint) -> Result<Vec<Checkpoint>> {
        let id = checkpoint.conversation_id.clone();
        let mut checkpoints = self.checkpoints(&id).await?;
        checkpoints.push(checkpoint);
        self.set_custom_metadata(&id, CHECKPOINTS_KEY, serde_json::to_value(&checkpoints)?)
            .await?;
        Ok(checkpoints)
    }

    async fn checkpoints(&self, id: &ConversationId) -> Result<Vec<Checkpoint>> {
        match self.get_custom_metadata(id, CHECKPOINTS_KEY).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| AgentError::Session(format!("corrupt checkpoint list: {e}"))),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Default)]
struct StoredConversation {
    conversation: Conversation,
    metadata: HashMap<String, Value>,
    updated_at: Option<DateTime<Utc>>,
}

/// In-memory conversation store (server default, sub-agent private store)
#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: RwLock<HashMap<ConversationId, StoredConversation>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known conversations
    pub async fn len(&self) -> usize {
        self.conversations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conversations.read().await.is_empty()
    }

    /// Conversation ids, most recently updated first
    pub async fn list(&self, limit: usize) -> Vec<ConversationId> {
        let conversations = self.conversations.read().await;
        let mut ids: Vec<_> = conversations
            .iter()
            .map(|(id, stored)| (stored.updated_at, id.clone()))
            .collect();
        ids.sort_by(|a, b| b.0.cmp(&a.0));
        ids.into_iter().take(limit).map(|(_, id)| id).collect()
    }

    pub async fn delete(&self, id: &ConversationId) {
        self.conversations.write().await.remove(id);
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn append_content(&self, id: &ConversationId, content: Content) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let stored = conversations.entry(id.clone()).or_default();
        stored.conversation.push(content);
        stored.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn get_history(&self, id: &ConversationId) -> Result<Vec<Content>> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(id)
            .map(|s| s.conversation.contents().to_vec())
            .unwrap_or_default())
    }

    async fn get_custom_metadata(&self, id: &ConversationId, key: &str) -> Result<Option<Value>> {
        let conversations = self.conversations.read().await;
        Ok(conversations.get(id).and_then(|s| s.metadata.get(key).cloned()))
    }

    async fn set_custom_metadata(&self, id: &ConversationId, key: &str, value: Value) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let stored = conversations.entry(id.clone()).or_default();
        stored.metadata.insert(key.to_string(), value);
        stored.updated_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_appends_in_order() {
        let store = MemoryConversationStore::new();
        let id = ConversationId::new();

        store.append_content(&id, Content::user("one")).await.unwrap();
        store.append_content(&id, Content::assistant("two")).await.unwrap();

        let history = store.get_history(&id).await.unwrap();
        let texts: Vec<_> = history.iter().map(Content::text).collect();
        assert_eq!(texts, vec!["one", "two"]);
        assert!(store.get_history(&ConversationId::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_custom_metadata_roundtrip() {
        let store = MemoryConversationStore::new();
        let id = ConversationId::from_string("c-1");

        assert_eq!(store.get_custom_metadata(&id, "k").await.unwrap(), None);
        store.set_custom_metadata(&id, "k", json!({"a": 1})).await.unwrap();
        assert_eq!(store.get_custom_metadata(&id, "k").await.unwrap(), Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_checkpoints_accumulate() {
        let store = MemoryConversationStore::new();
        let id = ConversationId::new();

        store.record_checkpoint(Checkpoint::new(id.clone(), 2, 1)).await.unwrap();
        let all = store.record_checkpoint(Checkpoint::new(id.clone(), 4, 2)).await.unwrap();

        assert_eq!(all.len(), 2);
        assert_eq!(store.checkpoints(&id).await.unwrap()[1].history_len, 4);
    }
}
