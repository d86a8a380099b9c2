//! Error types for the fezz-local runtime.

use crate::worker::InvocationId;
use fezz_sdk::ErrorDescriptor;
use std::path::PathBuf;
use thiserror::Error;

/// Failure reported to an invocation's acceptance or completion channel.
#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    /// No function is registered under the requested name.
    #[error("Function '{0}' not found")]
    FunctionNotFound(String),

    /// The dispatcher is draining and does not take new work.
    #[error("Dispatcher is draining; invocation rejected")]
    Draining,

    /// A worker process never signalled readiness.
    #[error("Timed out waiting for worker process to get ready")]
    SpawnTimeout,

    /// A worker process could not be started.
    #[error("Failed to start worker process: {0}")]
    Spawn(String),

    /// The worker process exited while the invocation was running.
    #[error("Worker exited with code {}", display_code(.code))]
    WorkerCrashed { code: Option<i32> },

    /// The channel to the worker process failed.
    #[error("Worker channel error: {0}")]
    Channel(String),

    /// The handler completed with an error.
    #[error("{0}")]
    Handler(ErrorDescriptor),

    /// The invocation exceeded its deadline and its worker was reclaimed.
    #[error("Function timed out after {seconds} seconds; killed.")]
    InvocationTimeout { seconds: u64 },
}

impl InvokeError {
    /// Short machine readable kind, used in logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            InvokeError::FunctionNotFound(_) => "FunctionNotFound",
            InvokeError::Draining => "Draining",
            InvokeError::SpawnTimeout => "SpawnTimeout",
            InvokeError::Spawn(_) => "SpawnError",
            InvokeError::WorkerCrashed { .. } => "WorkerCrashed",
            InvokeError::Channel(_) => "ChannelError",
            InvokeError::Handler(_) => "HandlerError",
            InvokeError::InvocationTimeout { .. } => "InvocationTimeout",
        }
    }
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "null".to_string(),
    }
}

/// Failure to bring up a worker process.
#[derive(Debug, Clone, Error)]
pub enum SpawnError {
    #[error("Timed out waiting for worker process to get ready")]
    Timeout,

    #[error("Failed to spawn worker process: {0}")]
    Io(String),

    #[error("Worker process exited before becoming ready (code {})", display_code(.0))]
    ExitedEarly(Option<i32>),
}

impl From<std::io::Error> for SpawnError {
    fn from(err: std::io::Error) -> Self {
        SpawnError::Io(err.to_string())
    }
}

/// Failure observed on a running worker.
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    #[error("Worker exited with code {}", display_code(.code))]
    Crashed { code: Option<i32> },

    #[error("Worker channel error: {0}")]
    Channel(String),

    #[error("Worker was destroyed")]
    Destroyed,
}

/// Failure to obtain a worker from a pool.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("Pool is draining; cannot accept work")]
    Draining,

    #[error("Pool was destroyed")]
    Closed,
}

/// Failure to read the function folder.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read function folder {}: {source}", path.display())]
    Folder {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure to read a single descriptor. Logged and skipped by the registry.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid descriptor {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Invalid runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_workers must be at least 1")]
    NoWorkers,

    #[error("max_per_process must be at least 1")]
    NoSlots,

    #[error("The multitenant pool does not support debug mode")]
    DebugMultiTenancy,

    #[error("Invalid function name prefix pattern: {0}")]
    Prefix(#[from] regex::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// A handler called its completion function more than once.
#[derive(Debug, Clone, Copy, Error)]
#[error("Invocation {0} completed more than once")]
pub struct DoubleCompletion(pub InvocationId);

impl From<SpawnError> for InvokeError {
    fn from(err: SpawnError) -> Self {
        match err {
            SpawnError::Timeout => InvokeError::SpawnTimeout,
            other => InvokeError::Spawn(other.to_string()),
        }
    }
}

impl From<PoolError> for InvokeError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Spawn(spawn) => spawn.into(),
            PoolError::Draining | PoolError::Closed => InvokeError::Draining,
        }
    }
}

impl From<WorkerError> for InvokeError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Crashed { code } => InvokeError::WorkerCrashed { code },
            WorkerError::Channel(msg) => InvokeError::Channel(msg),
            WorkerError::Destroyed => InvokeError::Channel(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_message_keeps_exit_code() {
        let err = InvokeError::from(WorkerError::Crashed { code: Some(3) });
        assert_eq!(err.to_string(), "Worker exited with code 3");
        assert_eq!(err.kind(), "WorkerCrashed");

        let signalled = InvokeError::WorkerCrashed { code: None };
        assert_eq!(signalled.to_string(), "Worker exited with code null");
    }

    #[test]
    fn test_spawn_timeout_maps_to_its_own_kind() {
        let err = InvokeError::from(PoolError::Spawn(SpawnError::Timeout));
        assert_eq!(err.kind(), "SpawnTimeout");

        let err = InvokeError::from(PoolError::Spawn(SpawnError::Io("denied".into())));
        assert_eq!(err.kind(), "SpawnError");
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_timeout_message() {
        let err = InvokeError::InvocationTimeout { seconds: 1 };
        assert_eq!(err.to_string(), "Function timed out after 1 seconds; killed.");
    }

    #[test]
    fn test_handler_error_displays_descriptor() {
        let err = InvokeError::Handler(ErrorDescriptor::with_name("TypeError", "bad input"));
        assert_eq!(err.to_string(), "TypeError: bad input");
    }
}
