//! Task record: identity + payload + timeout.
//!
//! A task is value-immutable once enqueued; all state (queued, in-flight)
//! lives in the queue's index structures, never in the task itself.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A unit of work: a named callable plus its arguments.
///
/// `id` is assigned by the queue at enqueue time (`INCR` on the queue's id
/// counter) and is unique within one queue. `timeout_ms` bounds one
/// execution attempt; tasks without one fall back to the queue default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Registered handler name, resolved by the child runner.
    pub func: String,

    #[serde(default)]
    pub args: serde_json::Value,

    #[serde(default)]
    pub kwargs: serde_json::Value,

    /// Serialized form this task was decoded from (or encoded to).
    ///
    /// Release and requeue must remove the exact bytes that were stored, so
    /// the raw blob is carried alongside the decoded fields instead of being
    /// re-encoded on every store write.
    #[serde(skip)]
    pub(crate) data: Option<Vec<u8>>,
}

impl Task {
    pub fn new(func: impl Into<String>) -> Self {
        Self {
            id: None,
            timeout_ms: None,
            func: func.into(),
            args: serde_json::Value::Null,
            kwargs: serde_json::Value::Null,
            data: None,
        }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: serde_json::Value) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Execution timeout, falling back to `default` when the task carries
    /// none.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    /// The raw serialized bytes, if this task has been through a codec.
    pub(crate) fn raw(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_falls_back_to_default() {
        let t = Task::new("noop");
        assert_eq!(t.timeout_or(Duration::from_secs(7)), Duration::from_secs(7));

        let t = Task::new("noop").with_timeout(Duration::from_millis(250));
        assert_eq!(
            t.timeout_or(Duration::from_secs(7)),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn builder_sets_payload_fields() {
        let t = Task::new("add")
            .with_args(serde_json::json!([1, 2]))
            .with_kwargs(serde_json::json!({"x": 3}));
        assert_eq!(t.func, "add");
        assert_eq!(t.args, serde_json::json!([1, 2]));
        assert_eq!(t.kwargs, serde_json::json!({"x": 3}));
        assert!(t.id.is_none());
    }
}
