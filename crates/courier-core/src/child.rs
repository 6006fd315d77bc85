//! Child runner: the process that actually invokes user task code.
//!
//! Rust has no cheap fork, so the monitor re-executes the current binary
//! and marks it as a child through the environment. The embedding binary
//! hands control to [`reenter`] first thing in `main`; in a child process
//! it never returns.
//!
//! Per task the child reads one frame from stdin, executes, writes the
//! result frame to stdout and *then* releases the task. Release is the only
//! store write the child owns, and the frame-before-release ordering lets
//! the monitor act on the result while keeping release idempotent against
//! the monitor's own safety-net call. The child never spawns further
//! children and keeps the default signal disposition, so the monitor's
//! soft kill terminates it.

use std::sync::Arc;

use tracing::{debug, error};

use crate::codec::TaskCodec;
use crate::error::CourierError;
use crate::outcome::{TaskFailure, TaskOutcome};
use crate::pipe;
use crate::queue::Queue;
use crate::registry::HandlerRegistry;
use crate::store::RedisStore;

pub const ENV_MODE: &str = "COURIER_CHILD_MODE";
pub const ENV_QUEUE: &str = "COURIER_CHILD_QUEUE";
pub const ENV_STORE_URL: &str = "COURIER_CHILD_STORE_URL";

/// How a child consumes its pipe: one task, or tasks until EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildMode {
    Oneshot,
    Persistent,
}

impl ChildMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oneshot => "oneshot",
            Self::Persistent => "persistent",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "oneshot" => Some(Self::Oneshot),
            "persistent" => Some(Self::Persistent),
            _ => None,
        }
    }
}

/// Become a child runner if this process was spawned as one.
///
/// Returns the registry untouched when the child marker is absent; when it
/// is present this runs the child loop and exits the process.
pub async fn reenter(registry: HandlerRegistry) -> Result<HandlerRegistry, CourierError> {
    let Ok(mode) = std::env::var(ENV_MODE) else {
        return Ok(registry);
    };
    let mode = ChildMode::parse(&mode)
        .ok_or_else(|| CourierError::Child(format!("unknown child mode {mode:?}")))?;
    let queue_name = std::env::var(ENV_QUEUE)
        .map_err(|_| CourierError::Child(format!("{ENV_QUEUE} is not set")))?;
    let store_url = std::env::var(ENV_STORE_URL)
        .map_err(|_| CourierError::Child(format!("{ENV_STORE_URL} is not set")))?;

    let store = RedisStore::connect(&store_url).await?;
    let queue = Queue::new(queue_name, Arc::new(store));

    let code = run(mode, &registry, &queue).await;
    std::process::exit(code);
}

async fn run(mode: ChildMode, registry: &HandlerRegistry, queue: &Queue) -> i32 {
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    loop {
        let frame = match pipe::read_frame(&mut stdin).await {
            Ok(Some(frame)) => frame,
            // EOF: the monitor hung up, we are done
            Ok(None) => return 0,
            Err(e) => {
                error!(error = %e, "task channel is broken");
                return 1;
            }
        };

        let task = match queue.codec().decode(&frame) {
            Ok(task) => task,
            Err(e) => {
                // Without a decoded task there is no id to release; report
                // and bail, the monitor holds the safety net.
                error!(error = %e, "deserialize task failed");
                let outcome = TaskOutcome::err(TaskFailure::new(format!(
                    "deserialize task failed: {e}"
                )));
                let _ = write_outcome(&mut stdout, &outcome).await;
                return 1;
            }
        };

        debug!(id = task.id, func = %task.func, "running task");
        let outcome = registry.execute(&task).await;

        // Result frame first, release second.
        if let Err(e) = write_outcome(&mut stdout, &outcome).await {
            error!(id = task.id, error = %e, "result channel is broken");
            return 1;
        }
        if let Err(e) = queue.release(&task).await {
            // The monitor releases unconditionally after the cycle.
            error!(id = task.id, error = %e, "release failed");
        }

        if mode == ChildMode::Oneshot {
            return 0;
        }
    }
}

async fn write_outcome(
    stdout: &mut tokio::io::Stdout,
    outcome: &TaskOutcome,
) -> Result<(), CourierError> {
    let payload = serde_json::to_vec(outcome)
        .map_err(|e| CourierError::Child(format!("encode result frame failed: {e}")))?;
    pipe::write_frame(stdout, &payload)
        .await
        .map_err(CourierError::Pipe)
}
