//! In-memory store.
//!
//! Single-process emulation of the store contract for tests of the queue
//! protocol and the sweeper. Everything runs under one mutex, so the
//! composite operations are trivially atomic; a `Notify` wakes blocked
//! pops the way a blocking list pop would.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{QueueKeys, Store, NOTI_SENTINEL};
use crate::error::CourierError;

#[derive(Default)]
struct MemoryState {
    counters: HashMap<String, u64>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    zsets: HashMap<String, Vec<(Vec<u8>, f64)>>,
}

impl MemoryState {
    fn push_right(&mut self, key: &str, value: &[u8]) {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_vec());
    }

    fn pop_left(&mut self, key: &str) -> Option<Vec<u8>> {
        self.lists.get_mut(key).and_then(|l| l.pop_front())
    }

    fn zset_add(&mut self, key: &str, score: f64, member: &[u8]) {
        let zset = self.zsets.entry(key.to_string()).or_default();
        if let Some(entry) = zset.iter_mut().find(|(m, _)| m == member) {
            entry.1 = score;
        } else {
            zset.push((member.to_vec(), score));
        }
    }

    fn zset_remove(&mut self, key: &str, member: &[u8]) -> bool {
        let Some(zset) = self.zsets.get_mut(key) else {
            return false;
        };
        let before = zset.len();
        zset.retain(|(m, _)| m != member);
        zset.len() < before
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    notify: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn incr(&self, key: &str) -> Result<u64, CourierError> {
        let mut state = self.state.lock().await;
        let counter = state.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn push_right(&self, key: &str, value: &[u8]) -> Result<(), CourierError> {
        self.state.lock().await.push_right(key, value);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn push_right_many(
        &self,
        key: &str,
        value: &[u8],
        count: u64,
    ) -> Result<(), CourierError> {
        let mut state = self.state.lock().await;
        for _ in 0..count {
            state.push_right(key, value);
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop_left(&self, key: &str) -> Result<Option<Vec<u8>>, CourierError> {
        Ok(self.state.lock().await.pop_left(key))
    }

    async fn pop_left_many(&self, key: &str, count: u64) -> Result<(), CourierError> {
        let mut state = self.state.lock().await;
        for _ in 0..count {
            if state.pop_left(key).is_none() {
                break;
            }
        }
        Ok(())
    }

    async fn blocking_pop_left(
        &self,
        key: &str,
        wait: Duration,
    ) -> Result<Option<Vec<u8>>, CourierError> {
        let deadline = Instant::now() + wait;
        loop {
            // Arm the waiter before checking, so a push between the check
            // and the await cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.state.lock().await.pop_left(key) {
                return Ok(Some(value));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn list_len(&self, key: &str) -> Result<u64, CourierError> {
        let state = self.state.lock().await;
        Ok(state.lists.get(key).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn zset_add(&self, key: &str, score: f64, member: &[u8]) -> Result<(), CourierError> {
        self.state.lock().await.zset_add(key, score, member);
        Ok(())
    }

    async fn zset_remove(&self, key: &str, member: &[u8]) -> Result<bool, CourierError> {
        Ok(self.state.lock().await.zset_remove(key, member))
    }

    async fn zset_range_below(
        &self,
        key: &str,
        max_score: f64,
    ) -> Result<Vec<(Vec<u8>, f64)>, CourierError> {
        let state = self.state.lock().await;
        let mut members: Vec<(Vec<u8>, f64)> = state
            .zsets
            .get(key)
            .map(|z| {
                z.iter()
                    .filter(|(_, score)| *score <= max_score)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(members)
    }

    async fn enqueue_parts(
        &self,
        keys: &QueueKeys,
        blob: &[u8],
        now_ms: f64,
    ) -> Result<(), CourierError> {
        let mut state = self.state.lock().await;
        state.push_right(&keys.queue, blob);
        state.push_right(&keys.noti, NOTI_SENTINEL);
        state.zset_add(&keys.enqueued, now_ms, blob);
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn take_head(
        &self,
        keys: &QueueKeys,
        now_ms: f64,
    ) -> Result<Option<Vec<u8>>, CourierError> {
        let mut state = self.state.lock().await;
        let Some(blob) = state.pop_left(&keys.queue) else {
            return Ok(None);
        };
        state.zset_remove(&keys.enqueued, &blob);
        state.zset_add(&keys.dequeued, now_ms, &blob);
        Ok(Some(blob))
    }

    async fn requeue_inflight(
        &self,
        keys: &QueueKeys,
        blob: &[u8],
        now_ms: f64,
    ) -> Result<bool, CourierError> {
        let mut state = self.state.lock().await;
        if !state.zset_remove(&keys.dequeued, blob) {
            return Ok(false);
        }
        state.push_right(&keys.queue, blob);
        state.push_right(&keys.noti, NOTI_SENTINEL);
        state.zset_add(&keys.enqueued, now_ms, blob);
        drop(state);
        self.notify.notify_waiters();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counter_is_monotonic() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("q_id").await.unwrap(), 1);
        assert_eq!(store.incr("q_id").await.unwrap(), 2);
        assert_eq!(store.incr("q_id").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn list_push_pop_is_fifo() {
        let store = MemoryStore::new();
        store.push_right("l", b"a").await.unwrap();
        store.push_right("l", b"b").await.unwrap();
        assert_eq!(store.list_len("l").await.unwrap(), 2);
        assert_eq!(store.pop_left("l").await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(store.pop_left("l").await.unwrap(), Some(b"b".to_vec()));
        assert_eq!(store.pop_left("l").await.unwrap(), None);
    }

    #[tokio::test]
    async fn blocking_pop_times_out_when_empty() {
        let store = MemoryStore::new();
        let popped = store
            .blocking_pop_left("l", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(popped, None);
    }

    #[tokio::test]
    async fn blocking_pop_wakes_on_push() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .blocking_pop_left("l", Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.push_right("l", b"x").await.unwrap();
        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn zset_add_updates_score_in_place() {
        let store = MemoryStore::new();
        store.zset_add("z", 1.0, b"m").await.unwrap();
        store.zset_add("z", 9.0, b"m").await.unwrap();
        let all = store.zset_range_below("z", f64::MAX).await.unwrap();
        assert_eq!(all, vec![(b"m".to_vec(), 9.0)]);
    }

    #[tokio::test]
    async fn zset_range_below_filters_and_sorts() {
        let store = MemoryStore::new();
        store.zset_add("z", 30.0, b"c").await.unwrap();
        store.zset_add("z", 10.0, b"a").await.unwrap();
        store.zset_add("z", 20.0, b"b").await.unwrap();
        let below = store.zset_range_below("z", 25.0).await.unwrap();
        assert_eq!(
            below,
            vec![(b"a".to_vec(), 10.0), (b"b".to_vec(), 20.0)]
        );
    }

    #[tokio::test]
    async fn take_head_moves_bookkeeping() {
        let store = MemoryStore::new();
        let keys = QueueKeys::for_queue("q");
        store.enqueue_parts(&keys, b"t1", 100.0).await.unwrap();

        let taken = store.take_head(&keys, 200.0).await.unwrap();
        assert_eq!(taken, Some(b"t1".to_vec()));
        assert_eq!(store.list_len(&keys.queue).await.unwrap(), 0);
        assert!(store
            .zset_range_below(&keys.enqueued, f64::MAX)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store.zset_range_below(&keys.dequeued, f64::MAX).await.unwrap(),
            vec![(b"t1".to_vec(), 200.0)]
        );
    }

    #[tokio::test]
    async fn take_head_on_empty_queue_is_none() {
        let store = MemoryStore::new();
        let keys = QueueKeys::for_queue("q");
        assert_eq!(store.take_head(&keys, 1.0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn requeue_inflight_guards_on_membership() {
        let store = MemoryStore::new();
        let keys = QueueKeys::for_queue("q");
        store.enqueue_parts(&keys, b"t1", 100.0).await.unwrap();
        store.take_head(&keys, 200.0).await.unwrap();
        // drain the sentinel so the refill below is observable
        store.pop_left(&keys.noti).await.unwrap();

        assert!(store.requeue_inflight(&keys, b"t1", 300.0).await.unwrap());
        assert_eq!(store.list_len(&keys.queue).await.unwrap(), 1);
        assert_eq!(store.list_len(&keys.noti).await.unwrap(), 1);
        assert!(store
            .zset_range_below(&keys.dequeued, f64::MAX)
            .await
            .unwrap()
            .is_empty());

        // released (or already requeued) blob: no-op
        store.zset_remove(&keys.enqueued, b"t1").await.unwrap();
        store.pop_left(&keys.queue).await.unwrap();
        assert!(!store.requeue_inflight(&keys, b"t1", 400.0).await.unwrap());
        assert_eq!(store.list_len(&keys.queue).await.unwrap(), 0);
    }
}
