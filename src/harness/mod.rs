//! The worker side of the protocol.
//!
//! A [`Harness`] announces readiness, then reads [`TaskMessage`] lines from
//! its input and runs each task concurrently. Every task produces exactly
//! one result line carrying its wall time and, for single-tenant tasks, the
//! resident memory delta. Results of multiplexed tasks are tagged with the
//! task id. The harness stops when its input reaches EOF.

pub mod builtins;
mod handler;
pub mod memory;
mod resolver;

pub use builtins::builtin_handlers;
pub use handler::{
    AsyncHandler, Context, ContextHandler, Handler, HandlerResult, SyncHandler,
};
pub use resolver::{
    is_dylib, DefaultResolver, DylibResolver, HandlerResolver, HandlerTable, DYLIB_EXTENSIONS,
};

use crate::worker::{encode_line, ResultMessage, TaskMessage, WorkerMessage};
use fezz_sdk::ErrorDescriptor;
use memory::{format_bytes, format_duration, resident_bytes};
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Runs tasks from the dispatcher against resolved handlers.
#[derive(Clone)]
pub struct Harness {
    resolver: Arc<dyn HandlerResolver>,
}

impl Harness {
    pub fn new(resolver: impl HandlerResolver + 'static) -> Self {
        Self {
            resolver: Arc::new(resolver),
        }
    }

    /// Serve the process's stdin and stdout.
    pub async fn run(self) -> io::Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve tasks read from `input`, writing protocol lines to `output`.
    ///
    /// Returns once `input` reaches EOF. Tasks still running at that point
    /// are not waited for.
    pub async fn serve<R, W>(self, input: R, output: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            let mut output = output;
            while let Some(line) = rx.recv().await {
                output.write_all(line.as_bytes()).await?;
                output.flush().await?;
            }
            Ok::<_, io::Error>(())
        });

        let _ = tx.send(encode_line(&WorkerMessage::ready())?);
        debug!("Worker ready");

        let mut lines = BufReader::new(input).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TaskMessage>(&line) {
                Ok(task) => {
                    tokio::spawn(run_task(self.resolver.clone(), task, tx.clone()));
                }
                Err(err) => warn!(error = %err, "Ignoring malformed task"),
            }
        }

        debug!("Input closed, stopping worker");
        if writer.is_finished() {
            // The writer only stops early on an output error.
            writer
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        }
        Ok(())
    }
}

async fn run_task(
    resolver: Arc<dyn HandlerResolver>,
    mut task: TaskMessage,
    out: mpsc::UnboundedSender<String>,
) {
    let baseline = if task.multi { None } else { resident_bytes() };
    let started = Instant::now();
    let (ctx, completion) = Context::new(task.id);
    let payload = std::mem::take(&mut task.payload);

    let started_call = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let handler = resolver.resolve(&task)?;
        handler.call(payload, ctx.clone())
    }));
    match started_call {
        Ok(Ok(())) => {}
        Ok(Err(err)) => ctx.done(Err(err)),
        Err(panic) => ctx.done(Err(ErrorDescriptor::from_panic(&*panic))),
    }
    drop(ctx);

    let (result, finished) = match completion.await {
        Ok(done) => (done.result, done.at),
        Err(_) => (
            Err(ErrorDescriptor::new(
                "Handler released its context without completing",
            )),
            Instant::now(),
        ),
    };
    // Let work queued by the handler run before sampling memory.
    tokio::task::yield_now().await;

    let elapsed = finished.saturating_duration_since(started);
    let mem_bytes = baseline
        .and_then(|before| resident_bytes().map(|after| after as i64 - before as i64));
    let (err, return_value) = match result {
        Ok(value) => (None, value),
        Err(err) => (Some(err), serde_json::Value::Null),
    };

    let message = ResultMessage {
        id: task.multi.then_some(task.id),
        err,
        return_value,
        time: format_duration(elapsed),
        ms: elapsed.as_secs_f64() * 1000.0,
        mem: mem_bytes.map(format_bytes),
        mem_bytes,
    };
    match encode_line(&WorkerMessage::Result(message)) {
        Ok(line) => {
            let _ = out.send(line);
        }
        Err(err) => error!(invocation = task.id, error = %err, "Failed to encode result"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};

    struct Session {
        input: DuplexStream,
        output: Lines<BufReader<DuplexStream>>,
    }

    impl Session {
        fn start() -> Self {
            let (input, worker_in) = duplex(64 * 1024);
            let (worker_out, output) = duplex(64 * 1024);
            let harness = Harness::new(DefaultResolver::new(builtin_handlers()));
            tokio::spawn(harness.serve(worker_in, worker_out));
            Self {
                input,
                output: BufReader::new(output).lines(),
            }
        }

        async fn send(&mut self, id: u64, module: &str, payload: Value, multi: bool) {
            let task = TaskMessage {
                id,
                path: "/tmp".into(),
                module: module.to_string(),
                handler: "handler".to_string(),
                payload,
                multi,
            };
            let line = encode_line(&task).unwrap();
            self.input.write_all(line.as_bytes()).await.unwrap();
        }

        async fn next(&mut self) -> WorkerMessage {
            let line = self.output.next_line().await.unwrap().unwrap();
            WorkerMessage::decode(&line).unwrap()
        }

        async fn next_result(&mut self) -> ResultMessage {
            match self.next().await {
                WorkerMessage::Result(result) => result,
                other => panic!("expected a result, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_ready_then_result() {
        let mut session = Session::start();
        assert_eq!(session.next().await, WorkerMessage::ready());

        session.send(1, "echo", json!({"a": 1}), false).await;
        let result = session.next_result().await;
        assert_eq!(result.id, None);
        assert!(result.err.is_none());
        assert_eq!(result.return_value, json!({"a": 1}));
        assert!(result.ms >= 0.0);
        assert!(!result.time.is_empty());
        if cfg!(target_os = "linux") {
            assert!(result.mem_bytes.is_some());
        }
    }

    #[tokio::test]
    async fn test_multiplexed_results_are_tagged_without_memory() {
        let mut session = Session::start();
        session.next().await;

        session.send(7, "sleep", json!({"ms": 100}), true).await;
        session.send(8, "echo", json!("fast"), true).await;

        let first = session.next_result().await;
        assert_eq!(first.id, Some(8));
        assert_eq!(first.return_value, json!("fast"));
        assert!(first.mem_bytes.is_none());

        let second = session.next_result().await;
        assert_eq!(second.id, Some(7));
        assert_eq!(second.return_value, json!({"slept": 100}));
    }

    #[tokio::test]
    async fn test_failures_become_error_results() {
        let mut session = Session::start();
        session.next().await;

        for (id, module) in [(1, "fail"), (2, "throw"), (3, "panic"), (4, "missing")] {
            session.send(id, module, Value::Null, true).await;
            let result = session.next_result().await;
            assert_eq!(result.id, Some(id));
            assert!(result.err.is_some(), "{} should fail", module);
            assert_eq!(result.return_value, Value::Null);
        }
    }

    #[tokio::test]
    async fn test_panic_is_described() {
        let mut session = Session::start();
        session.next().await;

        session.send(1, "panic", Value::Null, false).await;
        let err = session.next_result().await.err.unwrap();
        assert_eq!(err.name, "Panic");
        assert_eq!(err.message, "Function panicked");
    }

    #[tokio::test]
    async fn test_double_completion_reports_first_result_once() {
        let mut session = Session::start();
        session.next().await;

        session.send(1, "twice", Value::Null, true).await;
        session.send(2, "echo", json!(2), true).await;

        let mut results = vec![session.next_result().await, session.next_result().await];
        // A trailing task flushes any stray second result for id 1.
        session.send(3, "echo", json!(3), true).await;
        results.push(session.next_result().await);

        let ones: Vec<_> = results.iter().filter(|r| r.id == Some(1)).collect();
        assert_eq!(ones.len(), 1);
        assert_eq!(ones[0].return_value, json!("first"));
        assert!(results.iter().any(|r| r.id == Some(2) && r.return_value == json!(2)));
        assert!(results.iter().any(|r| r.id == Some(3)));
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let mut session = Session::start();
        session.next().await;

        session.input.write_all(b"not json\n\n").await.unwrap();
        session.send(3, "echo", json!(3), false).await;
        assert_eq!(session.next_result().await.return_value, json!(3));
    }
}
