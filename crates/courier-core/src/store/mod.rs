//! Store port: thin abstraction over the shared data store.
//!
//! The queue protocol needs an atomic counter, list push/pop (plus a
//! blocking pop), sorted-set add/remove/range-by-score, and three composite
//! operations that every implementation must apply atomically. The Redis
//! implementation is the production one; the in-memory implementation is
//! the seam for single-process tests, mirroring the same semantics.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CourierError;

/// Suffixes of the four bookkeeping keys hanging off a queue name.
pub const NOTI_SUFFIX: &str = "_noti";
pub const ID_SUFFIX: &str = "_id";
pub const ENQUEUED_SUFFIX: &str = "_enqueued";
pub const DEQUEUED_SUFFIX: &str = "_dequeued";

/// The placeholder byte pushed to the notification list, one per task.
pub const NOTI_SENTINEL: &[u8] = b"1";

/// The five keys of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    /// The queue itself: serialized tasks, append right / pop left.
    pub queue: String,
    /// Wake-up channel: one sentinel per enqueued task.
    pub noti: String,
    /// Monotonic id counter.
    pub id: String,
    /// id -> enqueue timestamp for every task currently in `queue`.
    pub enqueued: String,
    /// id -> dequeue timestamp for every in-flight task.
    pub dequeued: String,
}

impl QueueKeys {
    pub fn for_queue(name: &str) -> Self {
        Self {
            queue: name.to_string(),
            noti: format!("{name}{NOTI_SUFFIX}"),
            id: format!("{name}{ID_SUFFIX}"),
            enqueued: format!("{name}{ENQUEUED_SUFFIX}"),
            dequeued: format!("{name}{DEQUEUED_SUFFIX}"),
        }
    }
}

/// Data-store contract.
///
/// The composite operations (`enqueue_parts`, `take_head`,
/// `requeue_inflight`) specify *effects*; Redis realizes them with a
/// pipeline and server-side scripts, the in-memory store under one lock.
#[async_trait]
pub trait Store: Send + Sync {
    /// Atomically increment an integer counter and return the new value.
    async fn incr(&self, key: &str) -> Result<u64, CourierError>;

    async fn push_right(&self, key: &str, value: &[u8]) -> Result<(), CourierError>;

    /// Append `count` copies of `value` in one round trip.
    async fn push_right_many(
        &self,
        key: &str,
        value: &[u8],
        count: u64,
    ) -> Result<(), CourierError>;

    async fn pop_left(&self, key: &str) -> Result<Option<Vec<u8>>, CourierError>;

    /// Drop up to `count` elements from the head.
    async fn pop_left_many(&self, key: &str, count: u64) -> Result<(), CourierError>;

    /// Pop the head, blocking up to `wait`. `None` when the wait expires.
    async fn blocking_pop_left(
        &self,
        key: &str,
        wait: Duration,
    ) -> Result<Option<Vec<u8>>, CourierError>;

    async fn list_len(&self, key: &str) -> Result<u64, CourierError>;

    async fn zset_add(&self, key: &str, score: f64, member: &[u8]) -> Result<(), CourierError>;

    /// Remove a member; true if it was present.
    async fn zset_remove(&self, key: &str, member: &[u8]) -> Result<bool, CourierError>;

    /// All `(member, score)` pairs with score <= `max_score`.
    async fn zset_range_below(
        &self,
        key: &str,
        max_score: f64,
    ) -> Result<Vec<(Vec<u8>, f64)>, CourierError>;

    /// Enqueue writes, one pipelined round trip: append `blob` to the
    /// queue, append one sentinel to the notification list, add the blob to
    /// the enqueued set at `now_ms`.
    async fn enqueue_parts(
        &self,
        keys: &QueueKeys,
        blob: &[u8],
        now_ms: f64,
    ) -> Result<(), CourierError>;

    /// Atomic take: pop the queue head, move it from the enqueued set to
    /// the dequeued set at `now_ms`, return it. `None` when the queue is
    /// empty (a sentinel outran the queue - a valid transient).
    async fn take_head(
        &self,
        keys: &QueueKeys,
        now_ms: f64,
    ) -> Result<Option<Vec<u8>>, CourierError>;

    /// Atomic requeue: move `blob` from the dequeued set back to the queue,
    /// its sentinel and the enqueued set at `now_ms`. Returns false (and
    /// changes nothing) when the blob is no longer in-flight, so a
    /// concurrent release wins.
    async fn requeue_inflight(
        &self,
        keys: &QueueKeys,
        blob: &[u8],
        now_ms: f64,
    ) -> Result<bool, CourierError>;
}

/// Milliseconds since the epoch, as a sorted-set score.
pub(crate) fn now_ms() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_derive_from_queue_name() {
        let keys = QueueKeys::for_queue("default");
        assert_eq!(keys.queue, "default");
        assert_eq!(keys.noti, "default_noti");
        assert_eq!(keys.id, "default_id");
        assert_eq!(keys.enqueued, "default_enqueued");
        assert_eq!(keys.dequeued, "default_dequeued");
    }
}
