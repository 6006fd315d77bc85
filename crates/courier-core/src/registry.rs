//! Handler registry: callable resolution for the child runner.
//!
//! A task's `func` names a handler registered here. The registry is built
//! during initialization (mutable) and used during execution (immutable),
//! which keeps it lock-free.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CourierError;
use crate::outcome::{TaskFailure, TaskOutcome};
use crate::task::Task;

/// User task code. Runs inside the child process only.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(
        &self,
        args: &serde_json::Value,
        kwargs: &serde_json::Value,
    ) -> Result<serde_json::Value, TaskFailure>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        func: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), CourierError> {
        let func = func.into();
        if self.handlers.contains_key(&func) {
            return Err(CourierError::DuplicateHandler(func));
        }
        self.handlers.insert(func, handler);
        Ok(())
    }

    pub fn get(&self, func: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(func)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Resolve and run one task. An unresolvable callable and a handler
    /// error both come back as an error outcome; nothing is retried here.
    pub async fn execute(&self, task: &Task) -> TaskOutcome {
        let Some(handler) = self.get(&task.func) else {
            return TaskOutcome::err(TaskFailure::new(format!(
                "no handler registered for func={}",
                task.func
            )));
        };
        match handler.run(&task.args, &task.kwargs).await {
            Ok(result) => TaskOutcome::ok(result),
            Err(failure) => TaskOutcome::err(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AddHandler;

    #[async_trait]
    impl TaskHandler for AddHandler {
        async fn run(
            &self,
            args: &serde_json::Value,
            _kwargs: &serde_json::Value,
        ) -> Result<serde_json::Value, TaskFailure> {
            let a = args[0].as_i64().ok_or_else(|| TaskFailure::new("bad args"))?;
            let b = args[1].as_i64().ok_or_else(|| TaskFailure::new("bad args"))?;
            Ok(serde_json::json!(a + b))
        }
    }

    #[tokio::test]
    async fn execute_runs_the_registered_handler() {
        let mut reg = HandlerRegistry::new();
        reg.register("add", Arc::new(AddHandler)).unwrap();

        let task = Task::new("add").with_args(serde_json::json!([1, 2]));
        match reg.execute(&task).await {
            TaskOutcome::Ok { result } => assert_eq!(result, serde_json::json!(3)),
            TaskOutcome::Err { failure } => panic!("unexpected failure: {failure}"),
        }
    }

    #[tokio::test]
    async fn execute_reports_a_missing_handler() {
        let reg = HandlerRegistry::new();
        let task = Task::new("missing");
        match reg.execute(&task).await {
            TaskOutcome::Err { failure } => assert!(failure.message.contains("missing")),
            TaskOutcome::Ok { .. } => panic!("should not succeed"),
        }
    }

    #[tokio::test]
    async fn execute_reports_a_handler_error() {
        let mut reg = HandlerRegistry::new();
        reg.register("add", Arc::new(AddHandler)).unwrap();

        let task = Task::new("add").with_args(serde_json::json!(["x"]));
        assert!(matches!(
            reg.execute(&task).await,
            TaskOutcome::Err { failure } if failure.message == "bad args"
        ));
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let mut reg = HandlerRegistry::new();
        reg.register("add", Arc::new(AddHandler)).unwrap();
        let err = reg.register("add", Arc::new(AddHandler)).unwrap_err();
        assert!(matches!(err, CourierError::DuplicateHandler(f) if f == "add"));
    }
}
