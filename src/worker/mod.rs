//! Worker processes: the wire protocol and the spawner.

pub mod protocol;
pub mod spawner;

pub use protocol::{encode_line, InvocationId, ReadyMessage, ResultMessage, TaskMessage, WorkerMessage};
pub use spawner::{spawn, Completion, SpawnConfig, WorkerHandle, WorkerId, DEBUG_ENV};
