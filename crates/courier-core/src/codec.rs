//! Task codec: `Task` <-> opaque bytes.
//!
//! The queue treats a serialized task as an opaque blob; this seam lets an
//! embedding application swap the wire format without touching the queue
//! protocol. The default is JSON.

use crate::error::CodecError;
use crate::task::Task;

/// Round-trips a task through its serialized form.
///
/// Implementations must preserve id, timeout and enough information to
/// invoke the callable with its arguments.
pub trait TaskCodec: Send + Sync {
    fn encode(&self, task: &Task) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, data: &[u8]) -> Result<Task, CodecError>;
}

/// JSON codec via serde.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl TaskCodec for JsonCodec {
    fn encode(&self, task: &Task) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(task).map_err(|e| CodecError::SerializeFailed(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<Task, CodecError> {
        let mut task: Task = serde_json::from_slice(data)
            .map_err(|e| CodecError::DeserializeFailed(e.to_string()))?;
        // keep the exact bytes for later release/requeue
        task.data = Some(data.to_vec());
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn roundtrip_preserves_identity_and_payload() {
        let codec = JsonCodec;
        let mut task = Task::new("add")
            .with_args(serde_json::json!([1, 2]))
            .with_kwargs(serde_json::json!({"x": 3}))
            .with_timeout(Duration::from_secs(10));
        task.id = Some(42);

        let data = codec.encode(&task).unwrap();
        let decoded = codec.decode(&data).unwrap();

        assert_eq!(decoded.id, Some(42));
        assert_eq!(decoded.timeout_ms, Some(10_000));
        assert_eq!(decoded.func, "add");
        assert_eq!(decoded.args, task.args);
        assert_eq!(decoded.kwargs, task.kwargs);
        assert_eq!(decoded.raw(), Some(data.as_slice()));
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = JsonCodec.decode(b"not json").unwrap_err();
        assert!(matches!(err, CodecError::DeserializeFailed(_)));
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let task = JsonCodec.decode(br#"{"func":"noop"}"#).unwrap();
        assert!(task.id.is_none());
        assert!(task.timeout_ms.is_none());
        assert!(task.args.is_null());
    }
}
