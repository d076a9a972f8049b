//! Persisted question/answer history.
//!
//! Records are append-only: every successful ask writes one new
//! [`ChatMessage`] and nothing in the service updates or deletes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryConversationStore;
pub use self::redis::RedisConversationStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub question: String,
    pub answer: String,
    pub model_used: String,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied by the pipeline; id and timestamp are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewChatMessage {
    pub question: String,
    pub answer: String,
    pub model_used: String,
    pub author_id: String,
}

impl NewChatMessage {
    pub fn into_record(self) -> ChatMessage {
        ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            question: self.question,
            answer: self.answer,
            model_used: self.model_used,
            author_id: self.author_id,
            created_at: Utc::now(),
        }
    }
}

#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
    async fn insert(&self, message: NewChatMessage) -> Result<ChatMessage, StoreError>;

    /// The author's messages, newest first, skipping `offset` and returning
    /// at most `limit`.
    async fn history(
        &self,
        author_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ChatMessage>, StoreError>;
}
