use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::time::timeout;

use super::{ChatMessage, ConversationStore, NewChatMessage};
use crate::error::StoreError;

/// History stored as one Redis list per author (`chat:history:<author>`),
/// newest entry at the head, each element a JSON-encoded [`ChatMessage`].
#[derive(Clone)]
pub struct RedisConversationStore {
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl RedisConversationStore {
    pub fn new(conn: ConnectionManager, op_timeout: Duration) -> Self {
        Self { conn, op_timeout }
    }

    fn key(author_id: &str) -> String {
        format!("chat:history:{}", author_id)
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        timeout(self.op_timeout, fut)
            .await
            .map_err(|_| StoreError::Unavailable("redis operation timed out".into()))?
            .map_err(StoreError::from)
    }
}

#[async_trait::async_trait]
impl ConversationStore for RedisConversationStore {
    async fn insert(&self, message: NewChatMessage) -> Result<ChatMessage, StoreError> {
        let record = message.into_record();
        let payload = serde_json::to_string(&record)?;
        let mut conn = self.conn.clone();
        let _: i64 = self
            .bounded(conn.lpush(Self::key(&record.author_id), payload))
            .await?;
        Ok(record)
    }

    async fn history(
        &self,
        author_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let start = offset as isize;
        let stop = (offset + limit - 1) as isize;
        let mut conn = self.conn.clone();
        let raw: Vec<String> = self
            .bounded(conn.lrange(Self::key(author_id), start, stop))
            .await?;
        raw.iter()
            .map(|item| serde_json::from_str::<ChatMessage>(item).map_err(StoreError::from))
            .collect()
    }
}
