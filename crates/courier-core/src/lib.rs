//! courier-core
//!
//! A Redis-backed task queue with process-isolated workers.
//!
//! The guarantee: if any worker process (monitor or child) is killed at
//! any instant, no task is lost - every task either completes or is
//! returned to the queue by the sweeper for another attempt, and release
//! is at-most-once-successful.
//!
//! Modules:
//! - store: store port + Redis and in-memory implementations
//! - task / codec / outcome: the task record and its wire forms
//! - queue: the enqueue/dequeue/release/requeue protocol
//! - registry: callable resolution for the child runner
//! - worker: the monitor processes (spawned and persistent variants)
//! - child: the child runner entry point
//! - sweeper: crash reconciliation
//! - pipe / shutdown / config / error: plumbing
//!
//! An embedding binary wires it together like this:
//!
//! ```ignore
//! let mut registry = HandlerRegistry::new();
//! registry.register("add", Arc::new(AddHandler))?;
//! // becomes the child runner when spawned as one, never returning
//! let registry = child::reenter(registry).await?;
//!
//! let store = Arc::new(RedisStore::connect("redis://127.0.0.1:6379").await?);
//! let queue = Arc::new(Queue::new("default", store));
//! let shutdown = shutdown_channel()?;
//! SpawnedWorker::new(queue, WorkerConfig::new("redis://127.0.0.1:6379"))
//!     .run(shutdown)
//!     .await;
//! ```

pub mod child;
pub mod codec;
pub mod config;
pub mod error;
pub mod outcome;
pub mod pipe;
pub mod queue;
pub mod registry;
pub mod shutdown;
pub mod store;
pub mod sweeper;
pub mod task;
pub mod worker;

pub use codec::{JsonCodec, TaskCodec};
pub use config::{SweeperConfig, WorkerConfig};
pub use error::{CodecError, CourierError};
pub use outcome::{TaskFailure, TaskOutcome};
pub use queue::Queue;
pub use registry::{HandlerRegistry, TaskHandler};
pub use shutdown::shutdown_channel;
pub use store::{MemoryStore, QueueKeys, RedisStore, Store};
pub use sweeper::Sweeper;
pub use task::Task;
pub use worker::{PersistentWorker, SpawnedWorker};
