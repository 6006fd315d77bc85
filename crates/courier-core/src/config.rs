//! Worker and sweeper configuration.

use std::time::Duration;

use crate::queue::DEFAULT_TASK_TIMEOUT;

/// Configuration shared by both worker variants.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Store URL, also handed to spawned child runners.
    pub store_url: String,

    /// How long one dequeue call blocks waiting for a notification.
    pub dequeue_wait: Duration,

    /// Grace between the soft kill (SIGTERM) and the hard kill (SIGKILL)
    /// of a child that ran out of time.
    pub kill_grace: Duration,

    /// Timeout applied to tasks that carry none.
    pub default_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(store_url: impl Into<String>) -> Self {
        Self {
            store_url: store_url.into(),
            dequeue_wait: Duration::from_secs(1),
            kill_grace: Duration::from_secs(5),
            default_timeout: DEFAULT_TASK_TIMEOUT,
        }
    }

    pub fn dequeue_wait(mut self, wait: Duration) -> Self {
        self.dequeue_wait = wait;
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Sweeper pacing.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Pause between reconciliation cycles.
    pub interval: Duration,

    /// Extra age beyond a task's timeout before it counts as lost. Covers
    /// clock skew and scheduling jitter; a task younger than
    /// `timeout + slack` is never requeued.
    pub slack: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            slack: Duration::from_secs(2),
        }
    }
}
