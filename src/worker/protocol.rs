//! Newline-delimited JSON protocol between the dispatcher and worker processes.
//!
//! The parent writes [`TaskMessage`]s to the worker's stdin. The worker writes
//! one [`WorkerMessage`] per line to stdout: a single readiness message at
//! startup, then one result per task. Stdout lines that are not protocol
//! messages are treated as function log output.

use fezz_sdk::ErrorDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Monotonically increasing invocation identifier.
pub type InvocationId = u64;

/// A unit of work sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Invocation id.
    pub id: InvocationId,
    /// Function directory.
    pub path: PathBuf,
    /// Handler module: a built-in module name or a shared library file.
    pub module: String,
    /// Exported handler name.
    pub handler: String,
    /// Invocation payload.
    #[serde(default)]
    pub payload: Value,
    /// Whether the worker is shared with other invocations.
    #[serde(default)]
    pub multi: bool,
}

/// Outcome of one task, reported by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    /// Invocation id, present when the task was multiplexed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<InvocationId>,
    /// Handler failure, if any.
    #[serde(default)]
    pub err: Option<ErrorDescriptor>,
    /// Handler return value.
    #[serde(default)]
    pub return_value: Value,
    /// Formatted wall time.
    pub time: String,
    /// Wall time in milliseconds.
    pub ms: f64,
    /// Formatted resident memory delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<String>,
    /// Resident memory delta in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_bytes: Option<i64>,
}

/// Readiness signal sent once by a freshly started worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadyMessage {
    pub ready: bool,
}

/// Any message a worker writes to stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    Ready(ReadyMessage),
    Result(ResultMessage),
}

impl WorkerMessage {
    /// The readiness message.
    pub fn ready() -> Self {
        WorkerMessage::Ready(ReadyMessage { ready: true })
    }

    /// Parse one stdout line. Returns `None` for non-protocol output.
    pub fn decode(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }
}

/// Serialize a message as a single protocol line, newline included.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ready_line() {
        let line = encode_line(&WorkerMessage::ready()).unwrap();
        assert_eq!(line, "{\"ready\":true}\n");
        assert_eq!(WorkerMessage::decode(&line), Some(WorkerMessage::ready()));
    }

    #[test]
    fn test_result_wire_names() {
        let line = r#"{"id":7,"err":null,"returnValue":{"ok":true},"time":"1.5 ms","ms":1.5,"mem":"4 kB","memBytes":4096}"#;
        match WorkerMessage::decode(line) {
            Some(WorkerMessage::Result(result)) => {
                assert_eq!(result.id, Some(7));
                assert!(result.err.is_none());
                assert_eq!(result.return_value, json!({"ok": true}));
                assert_eq!(result.mem_bytes, Some(4096));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_untagged_result_without_memory() {
        let line = r#"{"err":{"name":"Error","message":"nope"},"returnValue":null,"time":"2 ms","ms":2.0}"#;
        let Some(WorkerMessage::Result(result)) = WorkerMessage::decode(line) else {
            panic!("expected a result");
        };
        assert_eq!(result.id, None);
        assert_eq!(result.err.unwrap().message, "nope");
        assert_eq!(result.mem_bytes, None);
    }

    #[test]
    fn test_log_lines_are_not_messages() {
        assert_eq!(WorkerMessage::decode("hello from a handler"), None);
        assert_eq!(WorkerMessage::decode(r#"{"level":"info"}"#), None);
        assert_eq!(WorkerMessage::decode(""), None);
    }

    #[test]
    fn test_task_defaults() {
        let task: TaskMessage =
            serde_json::from_str(r#"{"id":1,"path":"/fns/ok","module":"echo","handler":"handler"}"#)
                .unwrap();
        assert_eq!(task.payload, Value::Null);
        assert!(!task.multi);
    }
}
