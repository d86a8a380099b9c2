//! Handler trait and the per-invocation context.

use crate::error::DoubleCompletion;
use crate::worker::InvocationId;
use fezz_sdk::ErrorDescriptor;
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::warn;

/// What a handler completes with.
pub type HandlerResult = Result<Value, ErrorDescriptor>;

/// A completed invocation as seen by the harness.
#[derive(Debug)]
pub(crate) struct Done {
    pub result: HandlerResult,
    pub at: Instant,
}

/// Context handed to a handler.
///
/// Completion is exactly-once: the first [`Context::done`] wins and later
/// calls are logged and ignored. Clones share the same completion. If every
/// clone is dropped without completing, the invocation fails.
#[derive(Clone)]
pub struct Context {
    invoke_id: InvocationId,
    completion: Arc<Mutex<Option<oneshot::Sender<Done>>>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("invoke_id", &self.invoke_id)
            .field("done", &self.is_done())
            .finish()
    }
}

impl Context {
    pub(crate) fn new(invoke_id: InvocationId) -> (Self, oneshot::Receiver<Done>) {
        let (tx, rx) = oneshot::channel();
        let ctx = Self {
            invoke_id,
            completion: Arc::new(Mutex::new(Some(tx))),
        };
        (ctx, rx)
    }

    pub fn invoke_id(&self) -> InvocationId {
        self.invoke_id
    }

    /// Whether the invocation already completed.
    pub fn is_done(&self) -> bool {
        self.completion.lock().is_none()
    }

    /// Complete the invocation, reporting a repeated completion.
    pub fn try_done(&self, result: HandlerResult) -> Result<(), DoubleCompletion> {
        let tx = self
            .completion
            .lock()
            .take()
            .ok_or(DoubleCompletion(self.invoke_id))?;
        let _ = tx.send(Done {
            result,
            at: Instant::now(),
        });
        Ok(())
    }

    /// Complete the invocation. A repeated completion is logged and ignored.
    pub fn done(&self, result: HandlerResult) {
        if let Err(err) = self.try_done(result) {
            warn!(invocation = self.invoke_id, "{}", err);
        }
    }

    pub fn succeed(&self, value: Value) {
        self.done(Ok(value));
    }

    pub fn fail(&self, err: ErrorDescriptor) {
        self.done(Err(err));
    }
}

/// A function entry point.
///
/// `call` starts the invocation; the handler completes it through `ctx`,
/// now or later. Returning `Err` completes the invocation with that error.
pub trait Handler: Send + Sync {
    fn call(&self, payload: Value, ctx: Context) -> Result<(), ErrorDescriptor>;
}

/// Handler that completes through its context.
pub struct ContextHandler<F>(pub F);

impl<F> Handler for ContextHandler<F>
where
    F: Fn(Value, Context) -> Result<(), ErrorDescriptor> + Send + Sync,
{
    fn call(&self, payload: Value, ctx: Context) -> Result<(), ErrorDescriptor> {
        (self.0)(payload, ctx)
    }
}

/// Handler returning its result directly.
pub struct SyncHandler<F>(pub F);

impl<F> Handler for SyncHandler<F>
where
    F: Fn(Value) -> HandlerResult + Send + Sync,
{
    fn call(&self, payload: Value, ctx: Context) -> Result<(), ErrorDescriptor> {
        ctx.done((self.0)(payload));
        Ok(())
    }
}

/// Handler returning a future. Runs on its own task; a panic inside the
/// future fails the invocation.
pub struct AsyncHandler<F>(pub F);

impl<F, Fut> Handler for AsyncHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, payload: Value, ctx: Context) -> Result<(), ErrorDescriptor> {
        let running = tokio::spawn((self.0)(payload));
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_second_completion_is_rejected() {
        let (ctx, rx) = Context::new(9);
        assert!(ctx.try_done(Ok(json!(1))).is_ok());
        let err = ctx.try_done(Ok(json!(2))).unwrap_err();
        assert_eq!(err.0, 9);
        ctx.done(Ok(json!(3)));

        assert_eq!(rx.await.unwrap().result.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_clones_share_completion() {
        let (ctx, rx) = Context::new(1);
        let clone = ctx.clone();
        clone.fail(ErrorDescriptor::new("nope"));
        assert!(ctx.is_done());
        assert_eq!(rx.await.unwrap().result.unwrap_err().message, "nope");
    }

    #[tokio::test]
    async fn test_sync_handler_completes_immediately() {
        let handler =
            SyncHandler(|payload: Value| -> HandlerResult { Ok(json!({ "got": payload })) });
        let (ctx, rx) = Context::new(1);
        handler.call(json!(5), ctx).unwrap();
        assert_eq!(rx.await.unwrap().result.unwrap(), json!({"got": 5}));
    }

    #[tokio::test]
    async fn test_async_handler_panic_fails_invocation() {
        let handler = AsyncHandler(|_payload: Value| async move {
            if true {
                panic!("async boom");
            }
            Ok::<_, ErrorDescriptor>(Value::Null)
        });
        let (ctx, rx) = Context::new(1);
        handler.call(Value::Null, ctx).unwrap();

        let err = rx.await.unwrap().result.unwrap_err();
        assert_eq!(err.name, "Panic");
        assert_eq!(err.message, "async boom");
    }

    #[tokio::test]
    async fn test_dropping_every_context_closes_completion() {
        let handler =
            ContextHandler(|_payload: Value, _ctx: Context| -> Result<(), ErrorDescriptor> {
                Ok(())
            });
        let (ctx, rx) = Context::new(1);
        handler.call(Value::Null, ctx).unwrap();
        assert!(rx.await.is_err());
    }
}
