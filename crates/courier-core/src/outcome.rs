//! Execution outcome: what the child runner reports back to the monitor.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A task-level failure: deserialization error, unresolvable callable or an
/// error returned by the handler. All three travel the same error path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskFailure {
    pub message: String,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.message.fmt(f)
    }
}

/// One reply frame per task on the child->monitor pipe.
///
/// Written by the child *before* it releases the task, so the monitor can
/// invoke the success handler on the strength of the result while release
/// stays the child's job on the happy path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Ok {
        #[serde(default)]
        result: serde_json::Value,
    },
    Err {
        failure: TaskFailure,
    },
}

impl TaskOutcome {
    pub fn ok(result: serde_json::Value) -> Self {
        Self::Ok { result }
    }

    pub fn err(failure: TaskFailure) -> Self {
        Self::Err { failure }
    }
}
