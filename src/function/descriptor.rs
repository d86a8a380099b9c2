//! Function descriptors.
//!
//! Each function lives in its own directory under the function folder and
//! carries a `fezz.json` descriptor:
//!
//! ```json
//! {
//!     "name": "resize-image",
//!     "lambdaFunction": "handler",
//!     "timeout": 10,
//!     "entry": "libresize.so"
//! }
//! ```

use crate::error::DescriptorError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Descriptor file name inside a function directory.
pub const DESCRIPTOR_FILE: &str = "fezz.json";

/// Export used when the descriptor names none.
pub const DEFAULT_HANDLER: &str = "handler";

/// Deadline used when the descriptor gives none (or zero).
pub const DEFAULT_TIMEOUT_SECS: u64 = 3;
pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 60;

/// On-disk shape of `fezz.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub lambda_function: Option<String>,
    #[serde(default)]
    pub timeout: Option<Value>,
    #[serde(default)]
    pub entry: Option<String>,
}

/// Rolling per-function counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionStats {
    pub runs: u64,
    pub errors: u64,
    /// Cumulative wall time in milliseconds.
    pub time: f64,
    /// Cumulative resident memory delta in bytes.
    pub mem: i64,
}

impl FunctionStats {
    /// Count one finished invocation. Timing is accumulated whenever the
    /// worker reported a result, including handler errors.
    pub fn record(&mut self, failed: bool, ms: Option<f64>, mem_bytes: Option<i64>) {
        self.runs += 1;
        if failed {
            self.errors += 1;
        }
        if let Some(ms) = ms {
            self.time += ms;
        }
        if let Some(mem) = mem_bytes {
            self.mem += mem;
        }
    }
}

/// Stats cell shared between generations of the same function.
pub type SharedStats = Arc<Mutex<FunctionStats>>;

/// A registered function.
#[derive(Debug, Clone)]
pub struct FunctionDescriptor {
    /// Directory name; the registry key.
    pub name: String,
    /// Function directory.
    pub path: PathBuf,
    /// Exported handler name.
    pub handler: String,
    /// Handler module: the descriptor's `entry`, or the directory name.
    pub module: String,
    /// Deadline in whole seconds.
    pub timeout_secs: u64,
    stats: SharedStats,
}

impl FunctionDescriptor {
    /// Build a descriptor by hand.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let name = name.into();
        Self {
            module: name.clone(),
            name,
            path: path.into(),
            handler: DEFAULT_HANDLER.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            stats: SharedStats::default(),
        }
    }

    /// Set the handler module.
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    /// Set the exported handler name.
    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = handler.into();
        self
    }

    /// Set the deadline, normalized like a descriptor value.
    pub fn with_timeout(mut self, secs: f64) -> Self {
        self.timeout_secs = normalize_timeout(Some(&Value::from(secs)));
        self
    }

    /// Reuse an existing stats cell.
    pub fn with_stats(mut self, stats: SharedStats) -> Self {
        self.stats = stats;
        self
    }

    /// Read `<dir>/fezz.json`. The directory name becomes the function name.
    pub fn load(dir: &Path) -> Result<Self, DescriptorError> {
        let file = dir.join(DESCRIPTOR_FILE);
        let raw = std::fs::read_to_string(&file).map_err(|source| DescriptorError::Read {
            path: file.clone(),
            source,
        })?;
        let parsed: DescriptorFile =
            serde_json::from_str(&raw).map_err(|source| DescriptorError::Parse {
                path: file.clone(),
                source,
            })?;

        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            module: parsed.entry.unwrap_or_else(|| name.clone()),
            handler: parsed
                .lambda_function
                .unwrap_or_else(|| DEFAULT_HANDLER.to_string()),
            timeout_secs: normalize_timeout(parsed.timeout.as_ref()),
            path: dir.to_path_buf(),
            name,
            stats: SharedStats::default(),
        })
    }

    /// Invocation deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The shared stats cell.
    pub fn shared_stats(&self) -> &SharedStats {
        &self.stats
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> FunctionStats {
        *self.stats.lock()
    }
}

/// Round, default zero or missing to 3 seconds, clamp to 1..=60.
pub fn normalize_timeout(value: Option<&Value>) -> u64 {
    let secs = value
        .and_then(Value::as_f64)
        .map(f64::round)
        .filter(|secs| *secs != 0.0 && !secs.is_nan())
        .unwrap_or(DEFAULT_TIMEOUT_SECS as f64);
    secs.clamp(MIN_TIMEOUT_SECS as f64, MAX_TIMEOUT_SECS as f64) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_timeout_normalization() {
        assert_eq!(normalize_timeout(None), 3);
        assert_eq!(normalize_timeout(Some(&json!(0))), 3);
        assert_eq!(normalize_timeout(Some(&json!(0.4))), 3);
        assert_eq!(normalize_timeout(Some(&json!("ten"))), 3);
        assert_eq!(normalize_timeout(Some(&json!(1.6))), 2);
        assert_eq!(normalize_timeout(Some(&json!(-5))), 1);
        assert_eq!(normalize_timeout(Some(&json!(90))), 60);
        assert_eq!(normalize_timeout(Some(&json!(10))), 10);
    }

    #[test]
    fn test_load_applies_defaults() {
        let dir = TempDir::new().unwrap();
        let fn_dir = dir.path().join("hello");
        std::fs::create_dir(&fn_dir).unwrap();
        std::fs::write(fn_dir.join(DESCRIPTOR_FILE), r#"{"name":"hello"}"#).unwrap();

        let descriptor = FunctionDescriptor::load(&fn_dir).unwrap();
        assert_eq!(descriptor.name, "hello");
        assert_eq!(descriptor.module, "hello");
        assert_eq!(descriptor.handler, "handler");
        assert_eq!(descriptor.timeout(), Duration::from_secs(3));
        assert_eq!(descriptor.stats(), FunctionStats::default());
    }

    #[test]
    fn test_load_reads_all_fields() {
        let dir = TempDir::new().unwrap();
        let fn_dir = dir.path().join("resize");
        std::fs::create_dir(&fn_dir).unwrap();
        std::fs::write(
            fn_dir.join(DESCRIPTOR_FILE),
            r#"{"name":"resize-image","lambdaFunction":"resize","timeout":10,"entry":"libresize.so"}"#,
        )
        .unwrap();

        let descriptor = FunctionDescriptor::load(&fn_dir).unwrap();
        assert_eq!(descriptor.name, "resize");
        assert_eq!(descriptor.module, "libresize.so");
        assert_eq!(descriptor.handler, "resize");
        assert_eq!(descriptor.timeout_secs, 10);
    }

    #[test]
    fn test_load_errors() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            FunctionDescriptor::load(dir.path()),
            Err(DescriptorError::Read { .. })
        ));

        std::fs::write(dir.path().join(DESCRIPTOR_FILE), "{nope").unwrap();
        assert!(matches!(
            FunctionDescriptor::load(dir.path()),
            Err(DescriptorError::Parse { .. })
        ));
    }

    #[test]
    fn test_stats_record() {
        let mut stats = FunctionStats::default();
        stats.record(false, Some(1.5), Some(1024));
        stats.record(true, Some(2.0), None);
        stats.record(true, None, None);
        assert_eq!(stats.runs, 3);
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.time, 3.5);
        assert_eq!(stats.mem, 1024);
    }
}
