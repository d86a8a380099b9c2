//! Worker process spawner.
//!
//! [`spawn`] starts one worker process, waits for its readiness handshake and
//! returns a [`WorkerHandle`]. After the handshake three background tasks
//! serve the process: a writer feeding stdin, a reader routing result lines
//! to the invocation that is waiting on them, and a supervisor that turns an
//! unexpected exit into a crash error for every pending invocation.

use super::protocol::{encode_line, InvocationId, ResultMessage, TaskMessage, WorkerMessage};
use crate::error::{SpawnError, WorkerError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Environment variable set on workers started in debug mode.
pub const DEBUG_ENV: &str = "FEZZ_WORKER_DEBUG";

/// Identifier of a worker, unique within the parent process.
pub type WorkerId = u64;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

const RUNNING: u8 = 0;
const DESTROYED: u8 = 1;
const EXITED: u8 = 2;

/// How to start a worker process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Worker executable.
    pub program: PathBuf,
    /// Extra arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Debug mode: no handshake deadline.
    pub debug: bool,
    /// 0-4; stderr is logged from 2, stdout from 3.
    pub verbosity: u8,
    /// Deadline for the readiness handshake.
    pub handshake_timeout: Duration,
}

impl SpawnConfig {
    /// Create a config for the given worker executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            debug: false,
            verbosity: 4,
            handshake_timeout: Duration::from_secs(30),
        }
    }

    /// Add a command line argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set debug mode.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the verbosity level.
    pub fn verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Set the handshake deadline.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

type Notifier = oneshot::Sender<Result<ResultMessage, WorkerError>>;

/// Invocations waiting on this worker, in dispatch order.
#[derive(Default)]
struct Routes {
    pending: HashMap<InvocationId, Notifier>,
    order: VecDeque<InvocationId>,
}

impl Routes {
    fn insert(&mut self, id: InvocationId, notifier: Notifier) {
        self.pending.insert(id, notifier);
        self.order.push_back(id);
    }

    fn take(&mut self, id: InvocationId) -> Option<Notifier> {
        let notifier = self.pending.remove(&id)?;
        self.order.retain(|queued| *queued != id);
        Some(notifier)
    }

    fn take_oldest(&mut self) -> Option<Notifier> {
        while let Some(id) = self.order.pop_front() {
            if let Some(notifier) = self.pending.remove(&id) {
                return Some(notifier);
            }
        }
        None
    }

    fn drain(&mut self) -> Vec<Notifier> {
        self.order.clear();
        self.pending.drain().map(|(_, notifier)| notifier).collect()
    }
}

struct WorkerInner {
    id: WorkerId,
    pid: Option<u32>,
    tasks: mpsc::UnboundedSender<String>,
    routes: Mutex<Routes>,
    state: AtomicU8,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl WorkerInner {
    fn route(&self, result: ResultMessage) {
        let notifier = {
            let mut routes = self.routes.lock();
            match result.id {
                Some(id) => routes.take(id),
                None => routes.take_oldest(),
            }
        };
        match notifier {
            Some(notifier) => {
                let _ = notifier.send(Ok(result));
            }
            None => debug!(
                worker = self.id,
                invocation = ?result.id,
                "Dropping result for an abandoned invocation"
            ),
        }
    }

    fn fail_all(&self, err: WorkerError) {
        let notifiers = self.routes.lock().drain();
        for notifier in notifiers {
            let _ = notifier.send(Err(err.clone()));
        }
    }
}

/// Handle to a running worker process.
///
/// Cloning the handle shares the same process. When the last handle is
/// dropped the process is killed.
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<WorkerInner>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.inner.id)
            .field("pid", &self.inner.pid)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl WorkerHandle {
    /// Worker identifier.
    pub fn id(&self) -> WorkerId {
        self.inner.id
    }

    /// OS process id.
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// Liveness predicate used by pool validation.
    pub fn is_alive(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == RUNNING
    }

    /// Number of tasks waiting for a result.
    pub fn in_flight(&self) -> usize {
        self.inner.routes.lock().pending.len()
    }

    /// Send a task. The returned [`Completion`] resolves exactly once.
    pub fn send(&self, task: &TaskMessage) -> Result<Completion, WorkerError> {
        self.check_alive()?;
        let line = encode_line(task).map_err(|e| WorkerError::Channel(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.inner.routes.lock().insert(task.id, tx);

        // The supervisor flips the state before failing pending routes, so an
        // exit racing this send is always observed here or by fail_all.
        if let Err(err) = self.check_alive() {
            self.forget(task.id);
            return Err(err);
        }

        if self.inner.tasks.send(line).is_err() {
            self.forget(task.id);
            return Err(WorkerError::Channel("worker stdin is closed".to_string()));
        }

        Ok(Completion { rx })
    }

    /// Stop waiting for an invocation's result.
    pub fn forget(&self, id: InvocationId) {
        self.inner.routes.lock().take(id);
    }

    /// Kill the process. Idempotent; pending completions resolve with
    /// [`WorkerError::Destroyed`].
    pub fn destroy(&self) {
        if self.inner.state.swap(DESTROYED, Ordering::SeqCst) == DESTROYED {
            return;
        }
        debug!(worker = self.inner.id, pid = ?self.inner.pid, "Destroying worker");
        self.inner.routes.lock().drain();
        if let Some(kill) = self.inner.kill.lock().take() {
            let _ = kill.send(());
        }
    }

    fn check_alive(&self) -> Result<(), WorkerError> {
        match self.inner.state.load(Ordering::SeqCst) {
            RUNNING => Ok(()),
            EXITED => Err(WorkerError::Channel("worker has exited".to_string())),
            _ => Err(WorkerError::Destroyed),
        }
    }

    fn start(
        id: WorkerId,
        child: Child,
        stdin: ChildStdin,
        stdout: Lines<BufReader<ChildStdout>>,
        verbosity: u8,
    ) -> Self {
        let (tasks, task_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let inner = Arc::new(WorkerInner {
            id,
            pid: child.id(),
            tasks,
            routes: Mutex::new(Routes::default()),
            state: AtomicU8::new(RUNNING),
            kill: Mutex::new(Some(kill_tx)),
        });

        tokio::spawn(write_tasks(Arc::downgrade(&inner), stdin, task_rx));
        let reader = tokio::spawn(read_results(Arc::downgrade(&inner), stdout, verbosity));
        tokio::spawn(supervise(Arc::downgrade(&inner), child, kill_rx, reader));

        Self { inner }
    }
}

/// Single-fire notification for one task.
pub struct Completion {
    rx: oneshot::Receiver<Result<ResultMessage, WorkerError>>,
}

impl Future for Completion {
    type Output = Result<ResultMessage, WorkerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(WorkerError::Destroyed)))
    }
}

/// Start a worker and wait for its readiness handshake.
pub async fn spawn(config: &SpawnConfig) -> Result<WorkerHandle, SpawnError> {
    let mut command = Command::new(&config.program);
    command
        .args(&config.args)
        .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if config.debug {
        command.env(DEBUG_ENV, "1");
    }

    let mut child = command.spawn()?;
    let id = NEXT_WORKER_ID.fetch_add(1, Ordering::SeqCst);
    debug!(worker = id, pid = ?child.id(), program = %config.program.display(), "Spawned worker");

    let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take())
    {
        (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
        _ => {
            let _ = child.kill().await;
            return Err(SpawnError::Io("worker stdio is unavailable".to_string()));
        }
    };
    tokio::spawn(forward_stderr(id, stderr, config.verbosity));

    let mut lines = BufReader::new(stdout).lines();
    let handshake = wait_ready(id, &mut lines, config.verbosity);
    let ready = if config.debug {
        handshake.await
    } else {
        tokio::time::timeout(config.handshake_timeout, handshake)
            .await
            .unwrap_or(Err(SpawnError::Timeout))
    };

    match ready {
        Ok(()) => Ok(WorkerHandle::start(id, child, stdin, lines, config.verbosity)),
        Err(SpawnError::ExitedEarly(_)) => {
            let code = tokio::time::timeout(Duration::from_secs(1), child.wait())
                .await
                .ok()
                .and_then(|status| status.ok())
                .and_then(|status| status.code());
            let _ = child.kill().await;
            warn!(worker = id, code = ?code, "Worker exited before becoming ready");
            Err(SpawnError::ExitedEarly(code))
        }
        Err(err) => {
            let _ = child.kill().await;
            warn!(worker = id, error = %err, "Discarding worker that failed its handshake");
            Err(err)
        }
    }
}

async fn wait_ready(
    id: WorkerId,
    lines: &mut Lines<BufReader<ChildStdout>>,
    verbosity: u8,
) -> Result<(), SpawnError> {
    while let Some(line) = lines.next_line().await? {
        match WorkerMessage::decode(&line) {
            Some(WorkerMessage::Ready(ready)) if ready.ready => return Ok(()),
            Some(_) => debug!(worker = id, "Ignoring message received before handshake"),
            None => log_stdout(id, &line, verbosity),
        }
    }
    Err(SpawnError::ExitedEarly(None))
}

async fn write_tasks(
    inner: Weak<WorkerInner>,
    mut stdin: ChildStdin,
    mut tasks: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = tasks.recv().await {
        let written = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            if let Some(inner) = inner.upgrade() {
                warn!(worker = inner.id, error = %err, "Failed to write task to worker");
                inner.fail_all(WorkerError::Channel(err.to_string()));
            }
            break;
        }
    }
}

async fn read_results(inner: Weak<WorkerInner>, mut lines: Lines<BufReader<ChildStdout>>, verbosity: u8) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Some(worker) = inner.upgrade() else {
                    break;
                };
                match WorkerMessage::decode(&line) {
                    Some(WorkerMessage::Result(result)) => worker.route(result),
                    Some(WorkerMessage::Ready(_)) => {
                        debug!(worker = worker.id, "Ignoring repeated readiness message")
                    }
                    None => log_stdout(worker.id, &line, verbosity),
                }
            }
            Ok(None) => break,
            Err(err) => {
                if let Some(worker) = inner.upgrade() {
                    if verbosity >= 1 {
                        warn!(worker = worker.id, error = %err, "Strange worker process error");
                    }
                    worker.fail_all(WorkerError::Channel(err.to_string()));
                }
                break;
            }
        }
    }
}

async fn supervise(
    inner: Weak<WorkerInner>,
    mut child: Child,
    kill: oneshot::Receiver<()>,
    reader: JoinHandle<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            let _ = child.kill().await;
            return;
        }
    };

    // Let the reader route results written just before the exit.
    let _ = tokio::time::timeout(Duration::from_secs(1), reader).await;

    let code = status.ok().and_then(|status| status.code());
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if inner
        .state
        .compare_exchange(RUNNING, EXITED, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        warn!(worker = inner.id, pid = ?inner.pid, code = ?code, "Worker exited unexpectedly");
        inner.fail_all(WorkerError::Crashed { code });
    }
}

async fn forward_stderr(id: WorkerId, stderr: ChildStderr, verbosity: u8) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if verbosity >= 2 {
            info!(target: "fezz_local::worker::stderr", worker = id, "{}", line);
        }
    }
}

fn log_stdout(id: WorkerId, line: &str, verbosity: u8) {
    if verbosity >= 3 {
        info!(target: "fezz_local::worker::stdout", worker = id, "{}", line);
    }
}
