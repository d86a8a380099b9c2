//! Mapping a task's module and export to a [`Handler`].

use super::handler::{Context, Handler};
use crate::worker::TaskMessage;
use fezz_sdk::{decode_outcome, ErrorDescriptor, FezzSlice, FreeFn, HandleFn, FREE_SYMBOL};
use libloading::{Library, Symbol};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// File extensions loaded as shared-library functions.
pub const DYLIB_EXTENSIONS: [&str; 3] = ["so", "dylib", "dll"];

/// Finds the handler for a task.
pub trait HandlerResolver: Send + Sync {
    fn resolve(&self, task: &TaskMessage) -> Result<Arc<dyn Handler>, ErrorDescriptor>;
}

/// In-process handlers keyed by module and export name.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<(String, String), Arc<dyn Handler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        module: impl Into<String>,
        export: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> &mut Self {
        self.handlers
            .insert((module.into(), export.into()), Arc::new(handler));
        self
    }

    pub fn with(
        mut self,
        module: impl Into<String>,
        export: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> Self {
        self.register(module, export, handler);
        self
    }

    pub fn get(&self, module: &str, export: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .get(&(module.to_string(), export.to_string()))
            .cloned()
    }

    fn has_module(&self, module: &str) -> bool {
        self.handlers.keys().any(|(m, _)| m == module)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl HandlerResolver for HandlerTable {
    fn resolve(&self, task: &TaskMessage) -> Result<Arc<dyn Handler>, ErrorDescriptor> {
        if let Some(handler) = self.get(&task.module, &task.handler) {
            return Ok(handler);
        }
        if self.has_module(&task.module) {
            Err(missing_export(&task.module, &task.handler))
        } else {
            Err(ErrorDescriptor::new(format!(
                "Cannot find module '{}'",
                task.module
            )))
        }
    }
}

fn missing_export(module: &str, export: &str) -> ErrorDescriptor {
    ErrorDescriptor::with_name(
        "TypeError",
        format!("'{}' is not exported by module '{}'", export, module),
    )
}

/// Whether `module` names a shared library.
pub fn is_dylib(module: &str) -> bool {
    Path::new(module)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| DYLIB_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Resolves shared-library functions exporting `fezz-sdk` entry points.
#[derive(Debug, Clone, Copy, Default)]
pub struct DylibResolver;

impl HandlerResolver for DylibResolver {
    fn resolve(&self, task: &TaskMessage) -> Result<Arc<dyn Handler>, ErrorDescriptor> {
        let library = task.path.join(&task.module);
        if !library.is_file() {
            return Err(ErrorDescriptor::new(format!(
                "Cannot find module '{}'",
                library.display()
            )));
        }
        Ok(Arc::new(DylibHandler {
            library,
            symbol: task.handler.clone(),
        }))
    }
}

/// One exported handler of a shared library. The library is loaded for the
/// call and unloaded afterwards, on a blocking thread.
struct DylibHandler {
    library: PathBuf,
    symbol: String,
}

impl Handler for DylibHandler {
    fn call(&self, payload: Value, ctx: Context) -> Result<(), ErrorDescriptor> {
        let input = serde_json::to_vec(&payload).map_err(|e| ErrorDescriptor::from_error(&e))?;
        let library = self.library.clone();
        let symbol = self.symbol.clone();

        let running = tokio::task::spawn_blocking(move || call_library(&library, &symbol, &input));
        tokio::spawn(async move {
            match running.await {
                Ok(result) => ctx.done(result),
                Err(err) if err.is_panic() => {
                    ctx.done(Err(ErrorDescriptor::from_panic(&*err.into_panic())))
                }
                Err(err) => ctx.done(Err(ErrorDescriptor::from_error(&err))),
            }
        });
        Ok(())
    }
}

fn call_library(library: &Path, symbol: &str, input: &[u8]) -> Result<Value, ErrorDescriptor> {
    debug!(library = %library.display(), symbol, "Loading function library");

    // SAFETY: loading runs the library's initializers; functions are trusted
    // local code built against fezz-sdk.
    let lib = unsafe { Library::new(library) }.map_err(|e| ErrorDescriptor::from_error(&e))?;

    let handle: Symbol<HandleFn> = unsafe { lib.get(symbol.as_bytes()) }
        .map_err(|_| missing_export(&library.display().to_string(), symbol))?;
    let free: Symbol<FreeFn> = unsafe { lib.get(FREE_SYMBOL.as_bytes()) }.map_err(|_| {
        missing_export(&library.display().to_string(), FREE_SYMBOL)
    })?;

    // SAFETY: both symbols follow the fezz-sdk ABI; the returned buffer is
    // copied before it is handed back to the library that allocated it.
    let bytes = unsafe {
        let owned = handle(FezzSlice::from_bytes(input));
        let bytes = owned.to_vec();
        free(owned);
        bytes
    };

    decode_outcome(&bytes)
        .map_err(|e| ErrorDescriptor::from_error(&e))?
        .into_result()
}

/// Built-in handlers first, shared libraries for `.so`, `.dylib` and `.dll`
/// modules.
#[derive(Clone, Default)]
pub struct DefaultResolver {
    table: HandlerTable,
    dylib: DylibResolver,
}

impl DefaultResolver {
    pub fn new(table: HandlerTable) -> Self {
        Self {
            table,
            dylib: DylibResolver,
        }
    }
}

impl HandlerResolver for DefaultResolver {
    fn resolve(&self, task: &TaskMessage) -> Result<Arc<dyn Handler>, ErrorDescriptor> {
        if is_dylib(&task.module) {
            self.dylib.resolve(task)
        } else {
            self.table.resolve(task)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::handler::{HandlerResult, SyncHandler};
    use serde_json::json;

    fn task(module: &str, handler: &str) -> TaskMessage {
        TaskMessage {
            id: 1,
            path: PathBuf::from("/tmp/fn"),
            module: module.to_string(),
            handler: handler.to_string(),
            payload: json!({}),
            multi: false,
        }
    }

    fn table() -> HandlerTable {
        HandlerTable::new().with(
            "echo",
            "handler",
            SyncHandler(|payload: Value| -> HandlerResult { Ok(payload) }),
        )
    }

    #[test]
    fn test_table_resolves_registered_handler() {
        assert!(table().resolve(&task("echo", "handler")).is_ok());
        assert_eq!(table().len(), 1);
    }

    #[test]
    fn test_table_reports_missing_module_and_export() {
        let err = table().resolve(&task("nope", "handler")).err().unwrap();
        assert_eq!(err.message, "Cannot find module 'nope'");

        let err = table().resolve(&task("echo", "other")).err().unwrap();
        assert_eq!(err.name, "TypeError");
    }

    #[test]
    fn test_is_dylib() {
        assert!(is_dylib("libgreet.so"));
        assert!(is_dylib("greet.dylib"));
        assert!(is_dylib("greet.dll"));
        assert!(!is_dylib("index"));
        assert!(!is_dylib("index.js"));
    }

    #[test]
    fn test_missing_library_fails_resolution() {
        let resolver = DefaultResolver::new(table());
        let err = resolver.resolve(&task("libmissing.so", "handler")).err().unwrap();
        assert!(err.message.contains("libmissing.so"));
        assert!(resolver.resolve(&task("echo", "handler")).is_ok());
    }
}
