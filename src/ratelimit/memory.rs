use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use super::{CounterState, CounterStore};
use crate::error::StoreError;

/// Expired entries are swept once every this many increments.
const SWEEP_EVERY: u64 = 1024;

#[derive(Debug, Clone, Copy)]
struct Slot {
    count: u32,
    expires_at: Instant,
}

/// Single-process counter store.  Each key's read-modify-write happens under
/// the shard lock held by the `DashMap` entry, which makes the ceiling check
/// and the increment one atomic step.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    slots: DashMap<String, Slot>,
    ops: AtomicU64,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) counters.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots.iter().filter(|s| s.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(&self) {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.expires_at > now);
        let dropped = before.saturating_sub(self.slots.len());
        if dropped > 0 {
            tracing::trace!(dropped, "swept expired rate limit counters");
        }
    }
}

#[async_trait::async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(
        &self,
        key: &str,
        ceiling: u32,
        window: Duration,
    ) -> Result<CounterState, StoreError> {
        if self.ops.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep();
        }
        let now = Instant::now();
        let mut slot = self.slots.entry(key.to_string()).or_insert(Slot {
            count: 0,
            expires_at: now + window,
        });
        if slot.expires_at <= now {
            *slot = Slot {
                count: 0,
                expires_at: now + window,
            };
        }
        let incremented = slot.count < ceiling;
        if incremented {
            slot.count += 1;
        }
        Ok(CounterState {
            count: slot.count,
            incremented,
            ttl: slot.expires_at.saturating_duration_since(now),
        })
    }

    async fn peek(&self, key: &str) -> Result<Option<CounterState>, StoreError> {
        let now = Instant::now();
        Ok(self
            .slots
            .get(key)
            .filter(|slot| slot.expires_at > now)
            .map(|slot| CounterState {
                count: slot.count,
                incremented: false,
                ttl: slot.expires_at.saturating_duration_since(now),
            }))
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.slots.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn stops_at_ceiling() {
        let store = MemoryCounterStore::new();
        for expected in 1..=3 {
            let s = store.increment("k", 3, WINDOW).await.unwrap();
            assert_eq!(s.count, expected);
            assert!(s.incremented);
        }
        let s = store.increment("k", 3, WINDOW).await.unwrap();
        assert_eq!(s.count, 3);
        assert!(!s.incremented);
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_resets_count() {
        let store = MemoryCounterStore::new();
        store.increment("k", 1, WINDOW).await.unwrap();
        assert!(!store.increment("k", 1, WINDOW).await.unwrap().incremented);

        tokio::time::advance(Duration::from_secs(30)).await;
        let mid = store.increment("k", 1, WINDOW).await.unwrap();
        assert!(!mid.incremented);
        assert_eq!(mid.ttl, Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.peek("k").await.unwrap().is_none());
        let fresh = store.increment("k", 1, WINDOW).await.unwrap();
        assert!(fresh.incremented);
        assert_eq!(fresh.count, 1);
        assert_eq!(fresh.ttl, WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn window_is_fixed_from_first_increment() {
        let store = MemoryCounterStore::new();
        store.increment("k", 10, WINDOW).await.unwrap();
        tokio::time::advance(Duration::from_secs(59)).await;
        let s = store.increment("k", 10, WINDOW).await.unwrap();
        assert_eq!(s.count, 2);
        assert_eq!(s.ttl, Duration::from_secs(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_increments_never_overshoot() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut tasks = Vec::new();
        for _ in 0..64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.increment("hot", 5, WINDOW).await.unwrap().incremented
            }));
        }
        let mut admitted = 0;
        for t in tasks {
            if t.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
        assert_eq!(store.peek("hot").await.unwrap().unwrap().count, 5);
    }

    #[tokio::test]
    async fn clear_removes_counter() {
        let store = MemoryCounterStore::new();
        store.increment("k", 5, WINDOW).await.unwrap();
        assert_eq!(store.len(), 1);
        store.clear("k").await.unwrap();
        assert!(store.is_empty());
    }
}
