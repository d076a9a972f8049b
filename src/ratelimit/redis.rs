use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::time::timeout;

use super::{CounterState, CounterStore};
use crate::error::StoreError;

/// Compare-and-increment executed server side so the ceiling check and the
/// increment cannot interleave with another client.  Returns
/// `{count, incremented, pttl}`.  A counter found without an expiry gets
/// one, so a saturated key cannot block its subject forever.
const INCREMENT_BELOW: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local ceiling = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
if current >= ceiling then
  local ttl = redis.call('PTTL', KEYS[1])
  if ttl == -1 then
    redis.call('PEXPIRE', KEYS[1], window)
    ttl = window
  end
  return {current, 0, ttl}
end
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], window)
  ttl = window
end
return {count, 1, ttl}
"#;

/// Counter store shared by every gateway instance through Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    script: Script,
    op_timeout: Duration,
}

impl RedisCounterStore {
    pub fn new(conn: ConnectionManager, op_timeout: Duration) -> Self {
        Self {
            conn,
            script: Script::new(INCREMENT_BELOW),
            op_timeout,
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Unavailable(format!(
                "redis operation timed out after {}ms",
                self.op_timeout.as_millis()
            ))),
        }
    }
}

/// Redis reports -1 (no expiry) and -2 (missing key) as negative TTLs.
fn ttl_from_millis(pttl: i64, fallback: Duration) -> Duration {
    if pttl < 0 {
        fallback
    } else {
        Duration::from_millis(pttl as u64)
    }
}

#[async_trait::async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(
        &self,
        key: &str,
        ceiling: u32,
        window: Duration,
    ) -> Result<CounterState, StoreError> {
        let mut conn = self.conn.clone();
        let window_ms = window.as_millis().max(1) as u64;
        let mut invocation = self.script.key(key);
        invocation.arg(ceiling).arg(window_ms);
        let (count, incremented, pttl): (i64, i64, i64) =
            self.bounded(invocation.invoke_async(&mut conn)).await?;
        if count < 0 {
            return Err(StoreError::Corrupt(format!("negative counter for {}", key)));
        }
        Ok(CounterState {
            count: count as u32,
            incremented: incremented == 1,
            ttl: ttl_from_millis(pttl, window),
        })
    }

    async fn peek(&self, key: &str) -> Result<Option<CounterState>, StoreError> {
        let mut conn = self.conn.clone();
        let (count, pttl): (Option<i64>, i64) = self
            .bounded(redis::pipe().get(key).pttl(key).query_async(&mut conn))
            .await?;
        Ok(count.map(|count| CounterState {
            count: count.max(0) as u32,
            incremented: false,
            ttl: ttl_from_millis(pttl, Duration::ZERO),
        }))
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = self.bounded(conn.del(key)).await?;
        Ok(())
    }
}
