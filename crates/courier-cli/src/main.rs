//! courier: worker, sweeper and producer in one binary.
//!
//! Modes:
//! - `courier worker <queue> [--persistent]`
//! - `courier sweeper <queue>`
//! - `courier enqueue <queue> <func> [args-json] [kwargs-json] [--timeout-ms N]`
//! - `courier len <queue>`
//!
//! The store URL comes from `COURIER_STORE_URL` (default
//! `redis://127.0.0.1:6379`). The same executable doubles as the child
//! runner: the worker spawns it with the child marker set, and
//! `child::reenter` takes over before any mode dispatch.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use courier_core::{
    child, shutdown_channel, HandlerRegistry, PersistentWorker, Queue, RedisStore, SpawnedWorker,
    Sweeper, SweeperConfig, Task, TaskFailure, TaskHandler, WorkerConfig,
};
use tracing::{info, warn};

const DEFAULT_STORE_URL: &str = "redis://127.0.0.1:6379";

/// `add(a, b)` - the canonical demo task.
struct AddHandler;

#[async_trait]
impl TaskHandler for AddHandler {
    async fn run(
        &self,
        args: &serde_json::Value,
        _kwargs: &serde_json::Value,
    ) -> Result<serde_json::Value, TaskFailure> {
        let a = args[0]
            .as_i64()
            .ok_or_else(|| TaskFailure::new("add: args[0] must be an integer"))?;
        let b = args[1]
            .as_i64()
            .ok_or_else(|| TaskFailure::new("add: args[1] must be an integer"))?;
        Ok(serde_json::json!(a + b))
    }
}

/// `sleep(ms)` - holds the child busy; useful for timeout and crash drills.
struct SleepHandler;

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn run(
        &self,
        args: &serde_json::Value,
        kwargs: &serde_json::Value,
    ) -> Result<serde_json::Value, TaskFailure> {
        let ms = kwargs["ms"]
            .as_u64()
            .or_else(|| args[0].as_u64())
            .ok_or_else(|| TaskFailure::new("sleep: pass ms as args[0] or kwargs.ms"))?;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(serde_json::Value::Null)
    }
}

/// `fail()` - always errors.
struct FailHandler;

#[async_trait]
impl TaskHandler for FailHandler {
    async fn run(
        &self,
        _args: &serde_json::Value,
        _kwargs: &serde_json::Value,
    ) -> Result<serde_json::Value, TaskFailure> {
        Err(TaskFailure::new("intentional failure"))
    }
}

/// `echo(...)` - returns its args.
struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn run(
        &self,
        args: &serde_json::Value,
        _kwargs: &serde_json::Value,
    ) -> Result<serde_json::Value, TaskFailure> {
        Ok(args.clone())
    }
}

fn registry() -> Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register("add", Arc::new(AddHandler))?;
    registry.register("sleep", Arc::new(SleepHandler))?;
    registry.register("fail", Arc::new(FailHandler))?;
    registry.register("echo", Arc::new(EchoHandler))?;
    Ok(registry)
}

fn store_url() -> String {
    std::env::var("COURIER_STORE_URL").unwrap_or_else(|_| DEFAULT_STORE_URL.to_string())
}

async fn open_queue(name: &str) -> Result<Arc<Queue>> {
    let url = store_url();
    let store = RedisStore::connect(&url)
        .await
        .with_context(|| format!("connecting to {url}"))?;
    Ok(Arc::new(Queue::new(name, Arc::new(store))))
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to the pipe protocol when we run as a child runner;
    // logs always go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let registry = registry()?;
    // in a child runner process this never returns
    let _registry = child::reenter(registry).await?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("worker") => {
            let queue = positional(&args, 1).unwrap_or("default");
            let persistent = args.iter().any(|a| a == "--persistent");
            run_worker(queue, persistent).await
        }
        Some("sweeper") => {
            let queue = positional(&args, 1).unwrap_or("default");
            run_sweeper(queue).await
        }
        Some("enqueue") => {
            let queue = positional(&args, 1).context("enqueue: missing queue name")?;
            let func = positional(&args, 2).context("enqueue: missing func")?;
            run_enqueue(queue, func, &args).await
        }
        Some("len") => {
            let queue = positional(&args, 1).unwrap_or("default");
            let queue = open_queue(queue).await?;
            println!("{}", queue.len().await?);
            Ok(())
        }
        _ => {
            bail!(
                "usage: courier worker <queue> [--persistent] | courier sweeper <queue> | \
                 courier enqueue <queue> <func> [args-json] [kwargs-json] [--timeout-ms N] | \
                 courier len <queue>"
            );
        }
    }
}

/// Positional argument `idx`, skipping flags and their values.
fn positional(args: &[String], idx: usize) -> Option<&str> {
    let mut found = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            // flags that consume the next token
            "--timeout-ms" => i += 1,
            a if a.starts_with("--") => {}
            a => found.push(a),
        }
        i += 1;
    }
    found.get(idx).copied()
}

fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

async fn run_worker(queue_name: &str, persistent: bool) -> Result<()> {
    let queue = open_queue(queue_name).await?;
    let config = WorkerConfig::new(store_url())
        .dequeue_wait(Duration::from_millis(500))
        .kill_grace(Duration::from_secs(2));
    let shutdown = shutdown_channel()?;

    let on_success = |task: &Task| {
        info!(id = task.id, func = %task.func, "task succeeded");
    };
    let on_error = |task: &Task, signal: Option<i32>, failure: Option<&TaskFailure>| {
        warn!(
            id = task.id,
            func = %task.func,
            kill_signal = signal,
            failure = failure.map(|f| f.message.clone()),
            "task failed"
        );
    };

    if persistent {
        PersistentWorker::new(queue, config)
            .on_success(on_success)
            .on_error(on_error)
            .run(shutdown)
            .await;
    } else {
        SpawnedWorker::new(queue, config)
            .on_success(on_success)
            .on_error(on_error)
            .run(shutdown)
            .await;
    }
    Ok(())
}

async fn run_sweeper(queue_name: &str) -> Result<()> {
    let queue = open_queue(queue_name).await?;
    let shutdown = shutdown_channel()?;
    Sweeper::new(queue, SweeperConfig::default())
        .run(shutdown)
        .await;
    Ok(())
}

async fn run_enqueue(queue_name: &str, func: &str, args: &[String]) -> Result<()> {
    let task_args: serde_json::Value = match positional(args, 3) {
        Some(raw) => serde_json::from_str(raw).context("enqueue: args must be JSON")?,
        None => serde_json::Value::Null,
    };
    let task_kwargs: serde_json::Value = match positional(args, 4) {
        Some(raw) => serde_json::from_str(raw).context("enqueue: kwargs must be JSON")?,
        None => serde_json::Value::Null,
    };

    let mut task = Task::new(func).with_args(task_args).with_kwargs(task_kwargs);
    if let Some(ms) = flag_value(args, "--timeout-ms") {
        let ms: u64 = ms.parse().context("enqueue: --timeout-ms must be an integer")?;
        task = task.with_timeout(Duration::from_millis(ms));
    }

    let queue = open_queue(queue_name).await?;
    let task = queue.enqueue(task).await?;
    println!("enqueued task {} on {}", task.id.unwrap_or(0), queue_name);
    Ok(())
}
