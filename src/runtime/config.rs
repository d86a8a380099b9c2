//! Runtime configuration.

use crate::error::ConfigError;
use crate::worker::SpawnConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Name of the worker executable looked up next to the current binary.
pub const WORKER_BINARY: &str = "fezz-worker";

/// Configuration for one dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Folder holding one directory per function.
    pub folder: PathBuf,
    /// Maximum concurrent worker processes.
    pub max_workers: usize,
    /// Maximum concurrent invocations per worker process.
    pub max_per_process: usize,
    /// Debug mode: a single worker, no deadlines, fresh process per call.
    pub debug: bool,
    /// Regex stripped from requested function names.
    pub prefix: Option<String>,
    /// Log verbosity, 0-4.
    pub verbosity: u8,
    /// Worker executable. Defaults to `fezz-worker` next to this binary.
    pub worker_program: Option<PathBuf>,
    /// Extra worker arguments.
    pub worker_args: Vec<String>,
    /// Environment variables for every worker.
    pub env: HashMap<String, String>,
    /// Deadline for a worker's readiness handshake.
    pub handshake_timeout: Duration,
    /// Quiet period after a source change before reloading.
    pub reload_debounce: Duration,
    /// How often the function folder is polled for changes.
    pub poll_interval: Duration,
    /// Host address for the HTTP façade.
    pub host: String,
    /// Port for the HTTP façade.
    pub port: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            folder: PathBuf::from("."),
            max_workers: default_max_workers(),
            max_per_process: 1,
            debug: false,
            prefix: None,
            verbosity: 4,
            worker_program: None,
            worker_args: Vec::new(),
            env: HashMap::new(),
            handshake_timeout: Duration::from_secs(30),
            reload_debounce: Duration::from_millis(200),
            poll_interval: Duration::from_millis(500),
            host: "127.0.0.1".to_string(),
            port: 3033,
        }
    }
}

/// Twice the available parallelism.
pub fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
}

impl RuntimeConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the function folder.
    pub fn folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.folder = folder.into();
        self
    }

    /// Set the worker process limit.
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Set the per-process invocation limit. More than one selects the
    /// multiplexed pool.
    pub fn max_per_process(mut self, max_per_process: usize) -> Self {
        self.max_per_process = max_per_process;
        self
    }

    /// Enable debug mode. Forces a single worker.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        if debug {
            self.max_workers = 1;
        }
        self
    }

    /// Set the function name prefix pattern.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set the verbosity level.
    pub fn verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Set the worker executable.
    pub fn worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    /// Add a worker argument.
    pub fn worker_arg(mut self, arg: impl Into<String>) -> Self {
        self.worker_args.push(arg.into());
        self
    }

    /// Add an environment variable for workers.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the handshake deadline.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the reload debounce window.
    pub fn reload_debounce(mut self, debounce: Duration) -> Self {
        self.reload_debounce = debounce;
        self
    }

    /// Set the folder poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the host address.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check the settings and compile the prefix pattern.
    pub fn validate(&self) -> Result<Option<Regex>, ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.max_per_process == 0 {
            return Err(ConfigError::NoSlots);
        }
        if self.debug && self.max_per_process > 1 {
            return Err(ConfigError::DebugMultiTenancy);
        }
        Ok(self.prefix.as_deref().map(Regex::new).transpose()?)
    }

    /// Worker count actually used: debug mode runs a single worker.
    pub fn effective_max_workers(&self) -> usize {
        if self.debug {
            1
        } else {
            self.max_workers
        }
    }

    /// Resolve the worker executable.
    pub fn worker_path(&self) -> PathBuf {
        if let Some(program) = &self.worker_program {
            return program.clone();
        }
        let binary = format!("{}{}", WORKER_BINARY, std::env::consts::EXE_SUFFIX);
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&binary)))
            .unwrap_or_else(|| PathBuf::from(binary))
    }

    /// Spawn settings for this config's workers.
    pub fn spawn_config(&self) -> SpawnConfig {
        let mut spawn = SpawnConfig::new(self.worker_path())
            .debug(self.debug)
            .verbosity(self.verbosity)
            .handshake_timeout(self.handshake_timeout);
        for arg in &self.worker_args {
            spawn = spawn.arg(arg.clone());
        }
        for (key, value) in &self.env {
            spawn = spawn.env(key.clone(), value.clone());
        }
        spawn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert!(config.max_workers >= 2);
        assert_eq!(config.max_per_process, 1);
        assert_eq!(config.verbosity, 4);
        assert_eq!(config.handshake_timeout, Duration::from_secs(30));
        assert_eq!(config.reload_debounce, Duration::from_millis(200));
        assert_eq!(config.bind_addr(), "127.0.0.1:3033");
        assert!(config.validate().unwrap().is_none());
    }

    #[test]
    fn test_debug_forces_single_worker() {
        let config = RuntimeConfig::new().max_workers(8).debug(true);
        assert_eq!(config.max_workers, 1);
        assert_eq!(config.effective_max_workers(), 1);
        assert!(config.spawn_config().debug);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        assert!(matches!(
            RuntimeConfig::new().max_workers(0).validate(),
            Err(ConfigError::NoWorkers)
        ));
        assert!(matches!(
            RuntimeConfig::new().max_per_process(0).validate(),
            Err(ConfigError::NoSlots)
        ));
        assert!(matches!(
            RuntimeConfig::new().max_per_process(4).debug(true).validate(),
            Err(ConfigError::DebugMultiTenancy)
        ));
        assert!(matches!(
            RuntimeConfig::new().prefix("(").validate(),
            Err(ConfigError::Prefix(_))
        ));
    }

    #[test]
    fn test_prefix_compiles() {
        let prefix = RuntimeConfig::new().prefix("^dev-").validate().unwrap().unwrap();
        assert_eq!(prefix.replace("dev-hello", ""), "hello");
    }

    #[test]
    fn test_spawn_config_carries_worker_settings() {
        let spawn = RuntimeConfig::new()
            .worker_program("/opt/fezz-worker")
            .worker_arg("--quiet")
            .env("STAGE", "local")
            .verbosity(2)
            .spawn_config();
        assert_eq!(spawn.program, PathBuf::from("/opt/fezz-worker"));
        assert_eq!(spawn.args, vec!["--quiet".to_string()]);
        assert_eq!(spawn.env, vec![("STAGE".to_string(), "local".to_string())]);
        assert_eq!(spawn.verbosity, 2);
    }

    #[test]
    fn test_serde_round_trip_keeps_paths() {
        let config = RuntimeConfig::new().folder("/srv/functions").port(9000);
        let json = serde_json::to_string(&config).unwrap();
        let back: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.folder, PathBuf::from("/srv/functions"));
        assert_eq!(back.port, 9000);
    }
}
