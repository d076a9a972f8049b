//! Fixed-window request quota per subject.
//!
//! The [`RateLimiter`] owns the policy (limit and window length) and turns
//! counter-store results into [`RateDecision`]s.  The store performs the
//! check-and-increment as one atomic step so concurrent requests from the
//! same subject can never both pass on the same pre-increment count.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{AppError, StoreError};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryCounterStore;
pub use self::redis::RedisCounterStore;

/// Snapshot of one counter after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterState {
    pub count: u32,
    /// False when the counter was already at its ceiling.
    pub incremented: bool,
    /// Time left before the key expires.
    pub ttl: Duration,
}

/// A shared key/value store with expiring integer counters.
#[async_trait::async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key` unless its count already reached
    /// `ceiling`.  A missing key is created with a time-to-live of `window`.
    async fn increment(
        &self,
        key: &str,
        ceiling: u32,
        window: Duration,
    ) -> Result<CounterState, StoreError>;

    /// Read a counter without modifying it.
    async fn peek(&self, key: &str) -> Result<Option<CounterState>, StoreError>;

    async fn clear(&self, key: &str) -> Result<(), StoreError>;
}

/// Outcome of a quota check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    limit: u32,
    window: Duration,
    prefix: String,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, limit: u32, window: Duration) -> Self {
        Self {
            store,
            limit,
            window,
            prefix: "chatbot".to_string(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn key(&self, subject_id: &str) -> String {
        format!("{}:{}", self.prefix, subject_id)
    }

    /// Consume one request from the subject's quota if any is left.
    pub async fn check_and_increment(&self, subject_id: &str) -> Result<RateDecision, AppError> {
        let key = self.key(subject_id);
        let state = self
            .store
            .increment(&key, self.limit, self.window)
            .await
            .map_err(|err| {
                tracing::error!(subject = %subject_id, error = %err, "rate limit store failed; rejecting request");
                AppError::from(err)
            })?;
        let decision = self.decision(&state, state.incremented);
        if decision.allowed {
            tracing::debug!(subject = %subject_id, count = state.count, remaining = decision.remaining, "quota consumed");
        } else {
            tracing::info!(subject = %subject_id, limit = self.limit, reset_at = %decision.reset_at, "quota exhausted");
        }
        Ok(decision)
    }

    /// Current quota without consuming any of it.
    pub async fn status(&self, subject_id: &str) -> Result<RateDecision, AppError> {
        let key = self.key(subject_id);
        match self.store.peek(&key).await? {
            Some(state) => Ok(self.decision(&state, state.count < self.limit)),
            None => Ok(RateDecision {
                allowed: self.limit > 0,
                limit: self.limit,
                remaining: self.limit,
                reset_at: Utc::now() + to_chrono(self.window),
            }),
        }
    }

    /// Drop the subject's counter so a fresh window starts on the next request.
    pub async fn reset(&self, subject_id: &str) -> Result<(), AppError> {
        self.store.clear(&self.key(subject_id)).await?;
        tracing::info!(subject = %subject_id, "quota reset");
        Ok(())
    }

    fn decision(&self, state: &CounterState, allowed: bool) -> RateDecision {
        let remaining = if allowed {
            self.limit.saturating_sub(state.count)
        } else {
            0
        };
        RateDecision {
            allowed,
            limit: self.limit,
            remaining,
            reset_at: Utc::now() + to_chrono(state.ttl),
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    struct BrokenStore;

    #[async_trait::async_trait]
    impl CounterStore for BrokenStore {
        async fn increment(&self, _: &str, _: u32, _: Duration) -> Result<CounterState, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn peek(&self, _: &str) -> Result<Option<CounterState>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn clear(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    fn limiter(limit: u32) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryCounterStore::new()),
            limit,
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn remaining_counts_down_then_blocks() {
        let rl = limiter(3);
        let mut seen = Vec::new();
        for _ in 0..3 {
            let d = rl.check_and_increment("u1").await.unwrap();
            assert!(d.allowed);
            seen.push(d.remaining);
        }
        assert_eq!(seen, vec![2, 1, 0]);
        let blocked = rl.check_and_increment("u1").await.unwrap();
        assert!(!blocked.allowed);
        assert_eq!(blocked.remaining, 0);
        assert!(blocked.reset_at > Utc::now());
    }

    #[tokio::test]
    async fn subjects_are_independent() {
        let rl = limiter(1);
        assert!(rl.check_and_increment("a").await.unwrap().allowed);
        assert!(!rl.check_and_increment("a").await.unwrap().allowed);
        assert!(rl.check_and_increment("b").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn status_does_not_consume() {
        let rl = limiter(2);
        let fresh = rl.status("u1").await.unwrap();
        assert_eq!(fresh.remaining, 2);
        rl.check_and_increment("u1").await.unwrap();
        for _ in 0..3 {
            assert_eq!(rl.status("u1").await.unwrap().remaining, 1);
        }
    }

    #[tokio::test]
    async fn reset_restores_quota() {
        let rl = limiter(1);
        rl.check_and_increment("u1").await.unwrap();
        assert!(!rl.check_and_increment("u1").await.unwrap().allowed);
        rl.reset("u1").await.unwrap();
        let d = rl.check_and_increment("u1").await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 0);
    }

    #[tokio::test]
    async fn store_failure_fails_closed() {
        let rl = RateLimiter::new(Arc::new(BrokenStore), 10, Duration::from_secs(60));
        let err = rl.check_and_increment("u1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
