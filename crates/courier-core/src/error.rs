use thiserror::Error;

/// Crate-level error type.
///
/// Store errors are retriable (the worker loop backs off and tries again);
/// everything else is reported through the error path and the task is
/// released.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("no handler registered for func={0}")]
    HandlerNotFound(String),

    #[error("duplicate handler for func={0}")]
    DuplicateHandler(String),

    #[error("pipe error: {0}")]
    Pipe(#[source] std::io::Error),

    #[error("failed to spawn child runner: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("child runner protocol violation: {0}")]
    Child(String),
}

/// Errors from task (de)serialization.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialize task failed: {0}")]
    SerializeFailed(String),

    #[error("deserialize task failed: {0}")]
    DeserializeFailed(String),
}
