//! Sweeper: the reconciliation loop that restores queue invariants after
//! a crash.
//!
//! Each cycle runs two repairs, in this order:
//!
//! 1. notification refill - make `len(<name>_noti)` match `len(<name>)`,
//!    repairing a worker that popped a notification and died before the
//!    paired pop from the queue;
//! 2. timeout requeue - move in-flight tasks whose dequeue age exceeds
//!    `timeout + slack` back to the queue.
//!
//! R1 before R2 guarantees a requeued task's notification exists before
//! any worker could re-dequeue it. Both repairs are idempotent; a clean
//! queue is a no-op. A still-running task whose timeout outlives
//! `slack + interval` may be requeued and executed a second time - tasks
//! are expected to be idempotent, and the queue only guarantees at most
//! one successful release, so no suppression is attempted.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::codec::TaskCodec;
use crate::config::SweeperConfig;
use crate::error::CourierError;
use crate::queue::Queue;
use crate::store::{now_ms, Store};

pub struct Sweeper {
    queue: Arc<Queue>,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(queue: Arc<Queue>, config: SweeperConfig) -> Self {
        Self { queue, config }
    }

    /// Reconcile until the shutdown flag flips. Store errors are logged
    /// and retried next cycle; repair is idempotent, so a crashed sweeper
    /// simply re-reconciles on restart.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = self.queue.name(), "starting sweeper");
        while !*shutdown.borrow() {
            if let Err(e) = self.sweep().await {
                warn!(queue = self.queue.name(), error = %e, "sweep failed");
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
        info!(queue = self.queue.name(), "sweeper stopped");
    }

    /// One reconciliation pass: R1 then R2.
    pub async fn sweep(&self) -> Result<(), CourierError> {
        self.refill_notifications().await?;
        self.requeue_lost().await
    }

    /// R1: one sentinel per queued task, no more, no fewer.
    async fn refill_notifications(&self) -> Result<(), CourierError> {
        let keys = self.queue.keys();
        let store = self.queue.store();
        let queue_len = store.list_len(&keys.queue).await? as i64;
        let noti_len = store.list_len(&keys.noti).await? as i64;

        let delta = queue_len - noti_len;
        if delta > 0 {
            debug!(queue = self.queue.name(), missing = delta, "refilling notifications");
            store
                .push_right_many(&keys.noti, crate::store::NOTI_SENTINEL, delta as u64)
                .await?;
        } else if delta < 0 {
            debug!(queue = self.queue.name(), spurious = -delta, "draining notifications");
            store.pop_left_many(&keys.noti, (-delta) as u64).await?;
        }
        Ok(())
    }

    /// R2: requeue in-flight tasks whose dequeue age exceeds their timeout
    /// plus the slack.
    async fn requeue_lost(&self) -> Result<(), CourierError> {
        let keys = self.queue.keys();
        let store = self.queue.store();
        let now = now_ms();
        let slack_ms = self.config.slack.as_millis() as f64;

        // every candidate is at least slack old; the per-task timeout is
        // checked after decoding
        let candidates = store
            .zset_range_below(&keys.dequeued, now - slack_ms)
            .await?;

        for (blob, dequeued_at) in candidates {
            let task = match self.queue.codec().decode(&blob) {
                Ok(task) => task,
                Err(e) => {
                    // an undecodable blob can never run; drop it loudly
                    // rather than requeue it forever
                    warn!(queue = self.queue.name(), error = %e, "dropping undecodable in-flight entry");
                    store.zset_remove(&keys.dequeued, &blob).await?;
                    continue;
                }
            };
            let timeout_ms =
                task.timeout_or(self.queue.default_timeout()).as_millis() as f64;
            let age_ms = now - dequeued_at;
            if age_ms <= timeout_ms + slack_ms {
                // might still be running within its timeout
                continue;
            }

            if self.queue.requeue(&task).await? {
                info!(
                    queue = self.queue.name(),
                    id = task.id,
                    age_ms = age_ms as u64,
                    "requeued lost task"
                );
            }
        }
        Ok(())
    }
}
