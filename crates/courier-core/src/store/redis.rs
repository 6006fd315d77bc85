//! Redis-backed store.
//!
//! Composite operations use a pipeline (enqueue) and server-side Lua
//! scripts (take/requeue) so a killed worker always leaves the keys in one
//! of the states the sweeper recognizes. The connection manager reconnects
//! on its own; command errors during an outage surface as retriable store
//! errors.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::{QueueKeys, Store};
use crate::error::CourierError;

/// LPOP the queue head and move its bookkeeping entry from the enqueued
/// set to the dequeued set in one atomic step.
///
/// KEYS: queue, enqueued, dequeued. ARGV: now_ms.
const TAKE_HEAD: &str = r#"
local blob = redis.call('LPOP', KEYS[1])
if blob then
  redis.call('ZREM', KEYS[2], blob)
  redis.call('ZADD', KEYS[3], ARGV[1], blob)
end
return blob
"#;

/// Move an in-flight blob back to the queue. The leading ZREM doubles as
/// the guard: if a release got there first, nothing happens.
///
/// KEYS: queue, noti, dequeued, enqueued. ARGV: now_ms, blob, sentinel.
const REQUEUE_INFLIGHT: &str = r#"
if redis.call('ZREM', KEYS[3], ARGV[2]) == 0 then
  return 0
end
redis.call('RPUSH', KEYS[1], ARGV[2])
redis.call('RPUSH', KEYS[2], ARGV[3])
redis.call('ZADD', KEYS[4], ARGV[1], ARGV[2])
return 1
"#;

pub struct RedisStore {
    con: ConnectionManager,
    take_head: Script,
    requeue_inflight: Script,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, CourierError> {
        let client = redis::Client::open(url)?;
        let con = ConnectionManager::new(client).await?;
        Ok(Self {
            con,
            take_head: Script::new(TAKE_HEAD),
            requeue_inflight: Script::new(REQUEUE_INFLIGHT),
        })
    }

    fn con(&self) -> ConnectionManager {
        self.con.clone()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn incr(&self, key: &str) -> Result<u64, CourierError> {
        let mut con = self.con();
        let next: u64 = con.incr(key, 1u64).await?;
        Ok(next)
    }

    async fn push_right(&self, key: &str, value: &[u8]) -> Result<(), CourierError> {
        let mut con = self.con();
        let _: () = con.rpush(key, value).await?;
        Ok(())
    }

    async fn push_right_many(
        &self,
        key: &str,
        value: &[u8],
        count: u64,
    ) -> Result<(), CourierError> {
        if count == 0 {
            return Ok(());
        }
        let mut con = self.con();
        let values = vec![value; count as usize];
        let _: () = con.rpush(key, values).await?;
        Ok(())
    }

    async fn pop_left(&self, key: &str) -> Result<Option<Vec<u8>>, CourierError> {
        let mut con = self.con();
        let value: Option<Vec<u8>> = redis::cmd("LPOP").arg(key).query_async(&mut con).await?;
        Ok(value)
    }

    async fn pop_left_many(&self, key: &str, count: u64) -> Result<(), CourierError> {
        if count == 0 {
            return Ok(());
        }
        let mut con = self.con();
        let _: Option<Vec<Vec<u8>>> = redis::cmd("LPOP")
            .arg(key)
            .arg(count)
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn blocking_pop_left(
        &self,
        key: &str,
        wait: Duration,
    ) -> Result<Option<Vec<u8>>, CourierError> {
        let mut con = self.con();
        // BLPOP returns [key, value] or nil on timeout. A zero timeout
        // would block forever, so floor it at one decisecond.
        let secs = wait.as_secs_f64().max(0.1);
        let popped: Option<(String, Vec<u8>)> = redis::cmd("BLPOP")
            .arg(key)
            .arg(secs)
            .query_async(&mut con)
            .await?;
        Ok(popped.map(|(_, value)| value))
    }

    async fn list_len(&self, key: &str) -> Result<u64, CourierError> {
        let mut con = self.con();
        let len: u64 = con.llen(key).await?;
        Ok(len)
    }

    async fn zset_add(&self, key: &str, score: f64, member: &[u8]) -> Result<(), CourierError> {
        let mut con = self.con();
        let _: () = con.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zset_remove(&self, key: &str, member: &[u8]) -> Result<bool, CourierError> {
        let mut con = self.con();
        let removed: u64 = con.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zset_range_below(
        &self,
        key: &str,
        max_score: f64,
    ) -> Result<Vec<(Vec<u8>, f64)>, CourierError> {
        let mut con = self.con();
        let members: Vec<(Vec<u8>, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max_score)
            .arg("WITHSCORES")
            .query_async(&mut con)
            .await?;
        Ok(members)
    }

    async fn enqueue_parts(
        &self,
        keys: &QueueKeys,
        blob: &[u8],
        now_ms: f64,
    ) -> Result<(), CourierError> {
        let mut con = self.con();
        // One round trip; the sweeper repairs the gap if the writes are
        // interrupted between commands.
        let _: () = redis::pipe()
            .rpush(&keys.queue, blob)
            .ignore()
            .rpush(&keys.noti, super::NOTI_SENTINEL)
            .ignore()
            .zadd(&keys.enqueued, blob, now_ms)
            .ignore()
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn take_head(
        &self,
        keys: &QueueKeys,
        now_ms: f64,
    ) -> Result<Option<Vec<u8>>, CourierError> {
        let mut con = self.con();
        let blob: Option<Vec<u8>> = self
            .take_head
            .key(&keys.queue)
            .key(&keys.enqueued)
            .key(&keys.dequeued)
            .arg(now_ms)
            .invoke_async(&mut con)
            .await?;
        Ok(blob)
    }

    async fn requeue_inflight(
        &self,
        keys: &QueueKeys,
        blob: &[u8],
        now_ms: f64,
    ) -> Result<bool, CourierError> {
        let mut con = self.con();
        let moved: u64 = self
            .requeue_inflight
            .key(&keys.queue)
            .key(&keys.noti)
            .key(&keys.dequeued)
            .key(&keys.enqueued)
            .arg(now_ms)
            .arg(blob)
            .arg(super::NOTI_SENTINEL)
            .invoke_async(&mut con)
            .await?;
        Ok(moved > 0)
    }
}
