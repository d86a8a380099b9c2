//! Handlers compiled into the worker binary.
//!
//! Each is registered under its own module name with the `handler` export,
//! so a function directory selects one through its `fezz.json` `module`.

use super::handler::{AsyncHandler, Context, ContextHandler, HandlerResult, SyncHandler};
use super::resolver::HandlerTable;
use crate::function::descriptor::DEFAULT_HANDLER;
use fezz_sdk::ErrorDescriptor;
use serde_json::{json, Value};
use std::time::Duration;

/// Default `sleep` duration when the payload carries no `ms`.
pub const DEFAULT_SLEEP_MS: u64 = 500;

/// Delay before `crash` takes the process down.
pub const CRASH_DELAY: Duration = Duration::from_millis(50);

pub fn builtin_handlers() -> HandlerTable {
    HandlerTable::new()
        // Returns its payload.
        .with(
            "echo",
            DEFAULT_HANDLER,
            SyncHandler(|payload: Value| -> HandlerResult { Ok(payload) }),
        )
        .with(
            "fail",
            DEFAULT_HANDLER,
            ContextHandler(|_payload: Value, ctx: Context| -> Result<(), ErrorDescriptor> {
                ctx.fail(ErrorDescriptor::new("Function failed"));
                Ok(())
            }),
        )
        // Never completes.
        .with(
            "never",
            DEFAULT_HANDLER,
            ContextHandler(|_payload: Value, ctx: Context| -> Result<(), ErrorDescriptor> {
                tokio::spawn(async move {
                    std::future::pending::<()>().await;
                    drop(ctx);
                });
                Ok(())
            }),
        )
        .with(
            "sleep",
            DEFAULT_HANDLER,
            AsyncHandler(|payload: Value| async move {
                let ms = payload["ms"].as_u64().unwrap_or(DEFAULT_SLEEP_MS);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok::<_, ErrorDescriptor>(json!({ "slept": ms }))
            }),
        )
        .with(
            "panic",
            DEFAULT_HANDLER,
            SyncHandler(|_payload: Value| -> HandlerResult {
                panic!("Function panicked")
            }),
        )
        .with(
            "throw",
            DEFAULT_HANDLER,
            ContextHandler(|_payload: Value, _ctx: Context| -> Result<(), ErrorDescriptor> {
                Err(ErrorDescriptor::with_name(
                    "TypeError",
                    "Function threw synchronously",
                ))
            }),
        )
        // Exits the worker shortly after starting, leaving the task unanswered.
        .with(
            "crash",
            DEFAULT_HANDLER,
            ContextHandler(|_payload: Value, ctx: Context| -> Result<(), ErrorDescriptor> {
                tokio::spawn(async move {
                    tokio::time::sleep(CRASH_DELAY).await;
                    tracing::error!(invocation = ctx.invoke_id(), "Function crashed its worker");
                    std::process::exit(1);
                });
                Ok(())
            }),
        )
        .with(
            "twice",
            DEFAULT_HANDLER,
            ContextHandler(|_payload: Value, ctx: Context| -> Result<(), ErrorDescriptor> {
                ctx.succeed(json!("first"));
                ctx.succeed(json!("second"));
                Ok(())
            }),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::resolver::HandlerResolver;
    use crate::worker::TaskMessage;

    fn task(module: &str) -> TaskMessage {
        TaskMessage {
            id: 1,
            path: "/tmp".into(),
            module: module.to_string(),
            handler: DEFAULT_HANDLER.to_string(),
            payload: Value::Null,
            multi: false,
        }
    }

    #[test]
    fn test_every_builtin_resolves() {
        let table = builtin_handlers();
        for module in ["echo", "fail", "never", "sleep", "panic", "throw", "crash", "twice"] {
            assert!(table.resolve(&task(module)).is_ok(), "{}", module);
        }
    }
}
