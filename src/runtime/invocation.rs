//! Invocation handles and the per-invocation state machine.

use crate::error::InvokeError;
use crate::worker::{InvocationId, ResultMessage};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

/// Progress of one invocation.
///
/// `Pending → Dispatched → {Completed | TimedOut | Crashed}`. An invocation
/// that never obtains a worker goes straight from `Pending` to `Crashed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    Pending,
    Dispatched,
    Completed,
    TimedOut,
    Crashed,
}

impl InvocationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InvocationState::Completed | InvocationState::TimedOut | InvocationState::Crashed
        )
    }
}

/// Successful invocation result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationOutput {
    pub id: InvocationId,
    pub return_value: Value,
    /// Formatted wall time.
    pub duration: String,
    pub ms: f64,
    /// Formatted resident memory delta, when sampled.
    pub memory: Option<String>,
    pub memory_bytes: Option<i64>,
}

impl InvocationOutput {
    pub(crate) fn new(id: InvocationId, result: ResultMessage) -> Self {
        Self {
            id,
            return_value: result.return_value,
            duration: result.time,
            ms: result.ms,
            memory: result.mem,
            memory_bytes: result.mem_bytes,
        }
    }
}

type Acceptance = Result<InvocationId, InvokeError>;
type Outcome = Result<InvocationOutput, InvokeError>;

fn abandoned() -> InvokeError {
    InvokeError::Channel("invocation was abandoned".to_string())
}

/// Caller's handle on a running invocation.
#[derive(Debug)]
pub struct Invocation {
    id: InvocationId,
    function: String,
    accepted_rx: Option<oneshot::Receiver<Acceptance>>,
    acceptance: Option<Acceptance>,
    completion_rx: oneshot::Receiver<Outcome>,
}

impl Invocation {
    /// Create a handle and the dispatcher-side half that resolves it.
    pub(crate) fn channel(id: InvocationId, function: impl Into<String>) -> (Self, Completer) {
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let (completion_tx, completion_rx) = oneshot::channel();
        let invocation = Self {
            id,
            function: function.into(),
            accepted_rx: Some(accepted_rx),
            acceptance: None,
            completion_rx,
        };
        let completer = Completer {
            id,
            state: InvocationState::Pending,
            accepted: Some(accepted_tx),
            completion: Some(completion_tx),
        };
        (invocation, completer)
    }

    pub fn id(&self) -> InvocationId {
        self.id
    }

    /// Function name after prefix stripping.
    pub fn function(&self) -> &str {
        &self.function
    }

    /// Resolve once a worker has been obtained, or with the error that
    /// prevented it.
    pub async fn accepted(&mut self) -> Result<InvocationId, InvokeError> {
        if let Some(rx) = self.accepted_rx.take() {
            self.acceptance = Some(rx.await.unwrap_or_else(|_| Err(abandoned())));
        }
        self.acceptance.clone().unwrap_or_else(|| Err(abandoned()))
    }

    /// Resolve with the invocation's result.
    pub async fn completion(self) -> Result<InvocationOutput, InvokeError> {
        self.completion_rx.await.unwrap_or_else(|_| Err(abandoned()))
    }
}

/// Dispatcher-side half of an [`Invocation`]. Owns the state machine and
/// fires each notification at most once.
#[derive(Debug)]
pub(crate) struct Completer {
    id: InvocationId,
    state: InvocationState,
    accepted: Option<oneshot::Sender<Acceptance>>,
    completion: Option<oneshot::Sender<Outcome>>,
}

impl Completer {
    pub fn id(&self) -> InvocationId {
        self.id
    }

    pub fn state(&self) -> InvocationState {
        self.state
    }

    /// Signal that a worker was obtained.
    pub fn accept(&mut self) {
        if let Some(tx) = self.accepted.take() {
            let _ = tx.send(Ok(self.id));
        }
    }

    /// `Pending → Dispatched`.
    pub fn dispatch(&mut self) -> bool {
        if self.state != InvocationState::Pending {
            return false;
        }
        self.state = InvocationState::Dispatched;
        true
    }

    /// Move to a terminal state and deliver the outcome. Returns false when
    /// the invocation had already finished. A caller still waiting for
    /// acceptance receives the error as well.
    pub fn finish(&mut self, terminal: InvocationState, outcome: Outcome) -> bool {
        debug_assert!(terminal.is_terminal());
        if self.state.is_terminal() {
            return false;
        }
        self.state = terminal;

        if let Some(tx) = self.accepted.take() {
            let _ = tx.send(match &outcome {
                Ok(_) => Ok(self.id),
                Err(err) => Err(err.clone()),
            });
        }
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(outcome);
        }
        true
    }
}
