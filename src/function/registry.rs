//! Function registry built from a directory scan.

use crate::error::{DescriptorError, RegistryError};
use crate::function::descriptor::{FunctionDescriptor, DESCRIPTOR_FILE};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Directories that never hold functions.
pub const EXCLUDED_DIRS: &[&str] = &["node_modules", "target"];

/// Immutable name → descriptor map for one generation.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    folder: PathBuf,
    functions: BTreeMap<String, Arc<FunctionDescriptor>>,
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            functions: BTreeMap::new(),
        }
    }

    /// Scan `folder` for functions.
    ///
    /// When `previous` is given, functions keep its stats cell by name so
    /// counters survive a reload.
    pub fn scan(folder: &Path, previous: Option<&FunctionRegistry>) -> Result<Self, RegistryError> {
        let entries = std::fs::read_dir(folder).map_err(|source| RegistryError::Folder {
            path: folder.to_path_buf(),
            source,
        })?;

        let mut registry = Self::new(folder);
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if EXCLUDED_DIRS.contains(&name.as_str()) || name.starts_with('.') || !path.is_dir() {
                continue;
            }
            if !path.join(DESCRIPTOR_FILE).exists() {
                debug!(dir = %path.display(), "Skipping directory without {}", DESCRIPTOR_FILE);
                continue;
            }

            match FunctionDescriptor::load(&path) {
                Ok(mut descriptor) => {
                    if let Some(old) = previous.and_then(|p| p.get(&name)) {
                        descriptor = descriptor.with_stats(old.shared_stats().clone());
                    }
                    debug!(
                        function = %descriptor.name,
                        module = %descriptor.module,
                        handler = %descriptor.handler,
                        timeout = descriptor.timeout_secs,
                        "Registered function"
                    );
                    registry.insert(descriptor);
                }
                Err(err) => log_skipped(&name, &err),
            }
        }

        info!(folder = %folder.display(), count = registry.len(), "Loaded functions");
        Ok(registry)
    }

    /// Add or replace a function.
    pub fn insert(&mut self, descriptor: FunctionDescriptor) {
        self.functions
            .insert(descriptor.name.clone(), Arc::new(descriptor));
    }

    /// Look up a function by name.
    pub fn get(&self, name: &str) -> Option<&Arc<FunctionDescriptor>> {
        self.functions.get(name)
    }

    /// Function names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<FunctionDescriptor>> {
        self.functions.values()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// The scanned folder.
    pub fn folder(&self) -> &Path {
        &self.folder
    }
}

fn log_skipped(name: &str, err: &DescriptorError) {
    warn!(function = %name, error = %err, "Could not read metadata for function");
}
