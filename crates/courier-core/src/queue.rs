//! The queue protocol: enqueue / dequeue / release / requeue over the five
//! store keys of one named queue.
//!
//! Invariants (whenever no worker is mid-operation):
//! - `len(<name>) == len(<name>_noti)`;
//! - every task in `<name>` has its blob in `<name>_enqueued` with its
//!   enqueue timestamp;
//! - every blob in `<name>_dequeued` is being executed by some worker;
//! - a task is in at most one of `<name>_enqueued` / `<name>_dequeued`;
//! - `<name>_id` only grows.
//!
//! The sweeper restores the first invariant after a crash; the composite
//! store operations keep the rest atomic.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::codec::{JsonCodec, TaskCodec};
use crate::error::CourierError;
use crate::store::{now_ms, QueueKeys, Store};
use crate::task::Task;

/// Default per-attempt timeout for tasks that carry none.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);

pub struct Queue {
    name: String,
    keys: QueueKeys,
    store: Arc<dyn Store>,
    codec: Arc<dyn TaskCodec>,
    default_timeout: Duration,
}

impl Queue {
    pub fn new(name: impl Into<String>, store: Arc<dyn Store>) -> Self {
        let name = name.into();
        Self {
            keys: QueueKeys::for_queue(&name),
            name,
            store,
            codec: Arc::new(JsonCodec),
            default_timeout: DEFAULT_TASK_TIMEOUT,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn TaskCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn codec(&self) -> &Arc<dyn TaskCodec> {
        &self.codec
    }

    /// Enqueue a task, assigning an id from the queue's counter if it has
    /// none. The three state writes go out as one pipelined round trip.
    /// Returns the task with its id populated and its serialized form
    /// cached.
    pub async fn enqueue(&self, mut task: Task) -> Result<Task, CourierError> {
        if task.id.is_none() {
            task.id = Some(self.store.incr(&self.keys.id).await?);
        }
        let blob = self.codec.encode(&task)?;
        self.store
            .enqueue_parts(&self.keys, &blob, now_ms())
            .await?;
        debug!(queue = %self.name, id = task.id, func = %task.func, "enqueued task");
        task.data = Some(blob);
        Ok(task)
    }

    /// Build and enqueue a call of a registered handler.
    pub async fn enqueue_call(
        &self,
        func: impl Into<String>,
        args: serde_json::Value,
        kwargs: serde_json::Value,
    ) -> Result<Task, CourierError> {
        self.enqueue(Task::new(func).with_args(args).with_kwargs(kwargs))
            .await
    }

    /// Two-step dequeue: block on the notification list for up to `wait`,
    /// then atomically take the queue head.
    ///
    /// `None` either when the wait expires with no work, or when the
    /// sentinel outran the queue (the sweeper's refill makes this a valid
    /// transient, not an error).
    pub async fn dequeue(&self, wait: Duration) -> Result<Option<Task>, CourierError> {
        let sentinel = self.store.blocking_pop_left(&self.keys.noti, wait).await?;
        if sentinel.is_none() {
            return Ok(None);
        }

        let Some(blob) = self.store.take_head(&self.keys, now_ms()).await? else {
            debug!(queue = %self.name, "notification without a task; leaving it to the sweeper");
            return Ok(None);
        };
        let task = self.codec.decode(&blob)?;
        debug!(queue = %self.name, id = task.id, "dequeued task");
        Ok(Some(task))
    }

    /// Remove the task from the in-flight set. Idempotent: both the child
    /// (happy path) and the monitor (safety net) call this, and releasing
    /// an already-released task is a no-op.
    pub async fn release(&self, task: &Task) -> Result<(), CourierError> {
        let blob = self.blob_of(task)?;
        let removed = self.store.zset_remove(&self.keys.dequeued, &blob).await?;
        debug!(queue = %self.name, id = task.id, removed, "released task");
        Ok(())
    }

    /// Move an in-flight task back to the queue. Sweeper-only; returns
    /// false when the task was released in the meantime.
    pub async fn requeue(&self, task: &Task) -> Result<bool, CourierError> {
        let blob = self.blob_of(task)?;
        let moved = self
            .store
            .requeue_inflight(&self.keys, &blob, now_ms())
            .await?;
        debug!(queue = %self.name, id = task.id, moved, "requeued task");
        Ok(moved)
    }

    /// Number of tasks currently waiting in the queue.
    pub async fn len(&self) -> Result<u64, CourierError> {
        self.store.list_len(&self.keys.queue).await
    }

    pub async fn is_empty(&self) -> Result<bool, CourierError> {
        Ok(self.len().await? == 0)
    }

    fn blob_of(&self, task: &Task) -> Result<Vec<u8>, CourierError> {
        // Tasks that went through enqueue or dequeue carry their exact
        // stored bytes; re-encoding is the fallback for hand-built ones.
        match task.raw() {
            Some(raw) => Ok(raw.to_vec()),
            None => Ok(self.codec.encode(task)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn queue() -> Queue {
        Queue::new("jobs", Arc::new(MemoryStore::new()))
    }

    fn task(func: &str) -> Task {
        Task::new(func).with_args(serde_json::json!([1, 2]))
    }

    #[tokio::test]
    async fn enqueue_assigns_sequential_ids() {
        let q = queue();
        let a = q.enqueue(task("a")).await.unwrap();
        let b = q.enqueue(task("b")).await.unwrap();
        let c = q.enqueue(task("c")).await.unwrap();
        assert_eq!(a.id, Some(1));
        assert_eq!(b.id, Some(2));
        assert_eq!(c.id, Some(3));
        assert_eq!(q.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn enqueue_keeps_an_existing_id() {
        let q = queue();
        let mut t = task("a");
        t.id = Some(99);
        let t = q.enqueue(t).await.unwrap();
        assert_eq!(t.id, Some(99));
    }

    #[tokio::test]
    async fn dequeue_returns_an_equal_task() {
        let q = queue();
        let enqueued = q
            .enqueue(task("add").with_kwargs(serde_json::json!({"x": 3})))
            .await
            .unwrap();

        let got = q
            .dequeue(Duration::from_millis(100))
            .await
            .unwrap()
            .expect("task should be ready");
        assert_eq!(got.id, enqueued.id);
        assert_eq!(got.func, enqueued.func);
        assert_eq!(got.args, enqueued.args);
        assert_eq!(got.kwargs, enqueued.kwargs);
    }

    #[tokio::test]
    async fn dequeue_moves_task_to_inflight() {
        let q = queue();
        q.enqueue(task("a")).await.unwrap();
        let got = q.dequeue(Duration::from_millis(100)).await.unwrap();
        assert!(got.is_some());

        let store = &q.store;
        assert_eq!(store.list_len(&q.keys.queue).await.unwrap(), 0);
        assert_eq!(store.list_len(&q.keys.noti).await.unwrap(), 0);
        assert!(store
            .zset_range_below(&q.keys.enqueued, f64::MAX)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .zset_range_below(&q.keys.dequeued, f64::MAX)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn dequeue_times_out_on_an_empty_queue() {
        let q = queue();
        let got = q.dequeue(Duration::from_millis(50)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn dequeue_tolerates_a_sentinel_without_a_task() {
        let q = queue();
        q.enqueue(task("a")).await.unwrap();
        // simulate a worker that died between the two dequeue steps
        q.store.pop_left(&q.keys.queue).await.unwrap();

        let got = q.dequeue(Duration::from_millis(50)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let q = queue();
        q.enqueue(task("a")).await.unwrap();
        let got = q.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();

        q.release(&got).await.unwrap();
        q.release(&got).await.unwrap();

        assert!(q
            .store
            .zset_range_below(&q.keys.dequeued, f64::MAX)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn requeue_moves_a_task_back() {
        let q = queue();
        q.enqueue(task("a")).await.unwrap();
        let got = q.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();

        assert!(q.requeue(&got).await.unwrap());
        assert_eq!(q.len().await.unwrap(), 1);
        assert_eq!(q.store.list_len(&q.keys.noti).await.unwrap(), 1);
        assert!(q
            .store
            .zset_range_below(&q.keys.dequeued, f64::MAX)
            .await
            .unwrap()
            .is_empty());

        // and it can be dequeued again with the same id
        let again = q.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(again.id, got.id);
    }

    #[tokio::test]
    async fn requeue_after_release_is_a_no_op() {
        let q = queue();
        q.enqueue(task("a")).await.unwrap();
        let got = q.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();
        q.release(&got).await.unwrap();

        assert!(!q.requeue(&got).await.unwrap());
        assert_eq!(q.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn drained_queue_leaves_only_the_id_counter() {
        let q = queue();
        for name in ["a", "b", "c"] {
            q.enqueue(task(name)).await.unwrap();
        }
        for _ in 0..3 {
            let got = q.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();
            q.release(&got).await.unwrap();
        }

        assert_eq!(q.len().await.unwrap(), 0);
        assert_eq!(q.store.list_len(&q.keys.noti).await.unwrap(), 0);
        assert!(q
            .store
            .zset_range_below(&q.keys.enqueued, f64::MAX)
            .await
            .unwrap()
            .is_empty());
        assert!(q
            .store
            .zset_range_below(&q.keys.dequeued, f64::MAX)
            .await
            .unwrap()
            .is_empty());
        // the counter survives so ids never repeat
        assert_eq!(q.store.incr(&q.keys.id).await.unwrap(), 4);
    }
}
