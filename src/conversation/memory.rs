use std::collections::HashMap;

use tokio::sync::RwLock;

use super::{ChatMessage, ConversationStore, NewChatMessage};
use crate::error::StoreError;

/// Conversation history kept in process memory, grouped by author.
#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    by_author: RwLock<HashMap<String, Vec<ChatMessage>>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored messages across authors.
    pub async fn len(&self) -> usize {
        self.by_author.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Every stored message with the given question text.
    pub async fn find_by_question(&self, question: &str) -> Vec<ChatMessage> {
        self.by_author
            .read()
            .await
            .values()
            .flatten()
            .filter(|m| m.question == question)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn insert(&self, message: NewChatMessage) -> Result<ChatMessage, StoreError> {
        let record = message.into_record();
        self.by_author
            .write()
            .await
            .entry(record.author_id.clone())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn history(
        &self,
        author_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let guard = self.by_author.read().await;
        Ok(guard
            .get(author_id)
            .map(|messages| {
                messages
                    .iter()
                    .rev()
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
