//! The dispatcher: function lookup, invocation lifecycle and hot reload.
//!
//! A dispatcher owns one current *generation* (a registry scan plus the pool
//! running it). Reloading builds a fresh generation and swaps it in; the old
//! one keeps serving its in-flight invocations and is torn down in the
//! background once they have settled.

use crate::error::{ConfigError, InvokeError};
use crate::function::{FunctionDescriptor, FunctionRegistry, FunctionStats, SourceWatcher};
use crate::pool::{create_pool, Lease, WorkerPool};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::events::{DispatcherEvent, EventBus, Outcome, RuntimeStats};
use crate::runtime::invocation::{Completer, Invocation, InvocationOutput, InvocationState};
use crate::worker::{InvocationId, ResultMessage, SpawnConfig, TaskMessage};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Entry of [`Dispatcher::list_functions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionSummary {
    pub name: String,
}

/// Counter of unsettled invocations that can be awaited down to zero.
struct InFlight(watch::Sender<usize>);

impl InFlight {
    fn new() -> Self {
        Self(watch::channel(0).0)
    }

    fn enter(&self) {
        self.0.send_modify(|n| *n += 1);
    }

    fn leave(&self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn count(&self) -> usize {
        *self.0.borrow()
    }

    async fn settled(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

struct Generation {
    number: u64,
    registry: FunctionRegistry,
    pool: Arc<dyn WorkerPool>,
    in_flight: InFlight,
}

struct DispatcherInner {
    config: RuntimeConfig,
    prefix: Option<Regex>,
    spawn: SpawnConfig,
    current: RwLock<Arc<Generation>>,
    retired: Mutex<Vec<Arc<Generation>>>,
    in_flight: InFlight,
    accepting: AtomicBool,
    next_id: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
    events: EventBus,
    watcher: Mutex<Option<JoinHandle<()>>>,
    reloading: tokio::sync::Mutex<()>,
}

impl Drop for DispatcherInner {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
    }
}

/// Handle to a running function runtime. Cloning is cheap and shares state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

/// Result of the worker-facing part of an invocation.
struct Finished {
    state: InvocationState,
    result: Option<ResultMessage>,
    error: Option<InvokeError>,
}

impl Finished {
    fn failed(state: InvocationState, error: InvokeError) -> Self {
        Self {
            state,
            result: None,
            error: Some(error),
        }
    }

    fn outcome(&self) -> Outcome {
        match (self.state, &self.error) {
            (InvocationState::TimedOut, _) => Outcome::TimedOut,
            (InvocationState::Crashed, _) => Outcome::Crashed,
            (_, Some(_)) => Outcome::Failed,
            (_, None) => Outcome::Succeeded,
        }
    }
}

impl Dispatcher {
    /// Scan the configured folder and build the first generation.
    pub fn new(config: RuntimeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = FunctionRegistry::scan(&config.folder, None)?;
        Self::with_registry(config, registry)
    }

    /// Build a dispatcher around an already loaded registry.
    pub fn with_registry(config: RuntimeConfig, registry: FunctionRegistry) -> Result<Self, ConfigError> {
        let prefix = config.validate()?;
        let spawn = config.spawn_config();
        let generation = build_generation(&config, &spawn, 0, registry)?;

        if config.debug {
            info!("Debug mode: one worker, no invocation deadlines");
        }

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                prefix,
                spawn,
                current: RwLock::new(Arc::new(generation)),
                retired: Mutex::new(Vec::new()),
                in_flight: InFlight::new(),
                accepting: AtomicBool::new(true),
                next_id: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                events: EventBus::new(),
                watcher: Mutex::new(None),
                reloading: tokio::sync::Mutex::new(()),
                config,
            }),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Number of reloads so far.
    pub fn generation(&self) -> u64 {
        self.current().number
    }

    fn current(&self) -> Arc<Generation> {
        self.inner.current.read().clone()
    }

    /// Apply the configured prefix pattern, removing its first match.
    pub fn resolve_name(&self, name: &str) -> String {
        match &self.inner.prefix {
            Some(prefix) => prefix.replacen(name, 1, "").into_owned(),
            None => name.to_string(),
        }
    }

    /// Start an invocation.
    ///
    /// Unknown functions and a draining dispatcher are rejected right away.
    /// Otherwise the invocation runs on its own task and the returned handle
    /// reports acceptance and completion. Must be called inside a Tokio
    /// runtime.
    pub fn invoke(&self, name: &str, payload: Value) -> Result<Invocation, InvokeError> {
        let name = self.resolve_name(name);

        // Entering under the read lock ties the invocation to this
        // generation before a reload can retire it.
        let generation = {
            let current = self.inner.current.read();
            current.in_flight.enter();
            current.clone()
        };

        let Some(function) = generation.registry.get(&name).cloned() else {
            generation.in_flight.leave();
            warn!(function = %name, "Could not find function");
            return Err(InvokeError::FunctionNotFound(name));
        };

        self.inner.in_flight.enter();
        if !self.inner.accepting.load(Ordering::SeqCst) {
            self.inner.in_flight.leave();
            generation.in_flight.leave();
            return Err(InvokeError::Draining);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (invocation, completer) = Invocation::channel(id, name);
        tokio::spawn(self.clone().run(generation, function, payload, completer));
        self.publish_queue();
        Ok(invocation)
    }

    async fn run(
        self,
        generation: Arc<Generation>,
        function: Arc<FunctionDescriptor>,
        payload: Value,
        mut completer: Completer,
    ) {
        let id = completer.id();
        let finished = self
            .execute(&generation, &function, id, payload, &mut completer)
            .await;
        self.finish(&function, id, completer, finished);

        generation.in_flight.leave();
        self.inner.in_flight.leave();
    }

    async fn execute(
        &self,
        generation: &Generation,
        function: &FunctionDescriptor,
        id: InvocationId,
        payload: Value,
        completer: &mut Completer,
    ) -> Finished {
        let pool = &generation.pool;
        let lease = match pool.acquire(id).await {
            Ok(lease) => lease,
            Err(err) => return Finished::failed(InvocationState::Crashed, err.into()),
        };

        completer.accept();
        self.inner.events.publish(DispatcherEvent::Accepted {
            id,
            function: function.name.clone(),
        });
        self.publish_queue();
        info!(invocation = id, function = %function.name, "START");

        let task = TaskMessage {
            id,
            path: function.path.clone(),
            module: function.module.clone(),
            handler: function.handler.clone(),
            payload,
            multi: false,
        };
        let completion = match lease.send(task) {
            Ok(completion) => completion,
            Err(err) => {
                pool.destroy(lease);
                return Finished::failed(InvocationState::Crashed, err.into());
            }
        };
        completer.dispatch();

        let settled = if self.inner.config.debug {
            Some(completion.await)
        } else {
            tokio::select! {
                settled = completion => Some(settled),
                _ = tokio::time::sleep(function.timeout()) => None,
            }
        };

        match settled {
            None => {
                debug!(invocation = id, worker = lease.worker().id(), "Revoking timed out lease");
                pool.revoke(lease);
                Finished::failed(
                    InvocationState::TimedOut,
                    InvokeError::InvocationTimeout {
                        seconds: function.timeout_secs,
                    },
                )
            }
            Some(Ok(result)) => {
                self.give_back(pool.as_ref(), lease);
                let error = result.err.clone().map(InvokeError::Handler);
                Finished {
                    state: InvocationState::Completed,
                    result: Some(result),
                    error,
                }
            }
            Some(Err(err)) => {
                pool.destroy(lease);
                Finished::failed(InvocationState::Crashed, err.into())
            }
        }
    }

    fn give_back(&self, pool: &dyn WorkerPool, lease: Lease) {
        if self.inner.config.debug {
            pool.destroy(lease);
        } else {
            pool.release(lease);
        }
    }

    fn finish(&self, function: &FunctionDescriptor, id: InvocationId, mut completer: Completer, finished: Finished) {
        let outcome = finished.outcome();
        let failed = finished.error.is_some();
        let ms = finished.result.as_ref().map(|r| r.ms);
        let stats = {
            let mut stats = function.shared_stats().lock();
            stats.record(
                failed,
                ms,
                finished.result.as_ref().and_then(|r| r.mem_bytes),
            );
            *stats
        };
        self.inner.completed.fetch_add(1, Ordering::SeqCst);
        if failed {
            self.inner.errors.fetch_add(1, Ordering::SeqCst);
        }

        let duration = finished.result.as_ref().map(|r| r.time.as_str()).unwrap_or("-");
        let memory = finished
            .result
            .as_ref()
            .and_then(|r| r.mem.as_deref())
            .unwrap_or("-");
        match &finished.error {
            Some(err) => error!(
                invocation = id,
                function = %function.name,
                duration,
                memory,
                kind = err.kind(),
                error = %err,
                "ERROR"
            ),
            None => info!(invocation = id, function = %function.name, duration, memory, "END"),
        }

        let Finished { state, result, error } = finished;
        let delivered = match (error, result) {
            (Some(err), _) => Err(err),
            (None, Some(result)) => Ok(InvocationOutput::new(id, result)),
            (None, None) => Err(InvokeError::Channel("worker sent no result".to_string())),
        };
        debug!(invocation = id, from = ?completer.state(), to = ?state, "Settling invocation");
        completer.finish(state, delivered);

        self.inner.events.publish(DispatcherEvent::Completed {
            id,
            function: function.name.clone(),
            outcome,
            ms,
        });
        self.publish_queue();
        self.inner.events.publish(DispatcherEvent::Function {
            name: function.name.clone(),
            stats,
        });
    }

    fn publish_queue(&self) {
        self.inner.events.publish(DispatcherEvent::Queue(self.stats()));
    }

    /// Registered function names.
    pub fn list_functions(&self) -> Vec<FunctionSummary> {
        self.current()
            .registry
            .names()
            .map(|name| FunctionSummary {
                name: name.to_string(),
            })
            .collect()
    }

    /// Aggregate counters and current pool occupancy.
    pub fn stats(&self) -> RuntimeStats {
        let status = self.current().pool.status();
        RuntimeStats {
            workers: status.size,
            available: status.available,
            queued: status.queued,
            completed: self.inner.completed.load(Ordering::SeqCst),
            errors: self.inner.errors.load(Ordering::SeqCst),
        }
    }

    /// Counters of one function.
    pub fn function_stats(&self, name: &str) -> Option<FunctionStats> {
        self.current()
            .registry
            .get(&self.resolve_name(name))
            .map(|function| function.stats())
    }

    /// Invocations that have not settled yet.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatcherEvent> {
        self.inner.events.subscribe()
    }

    /// Stop accepting invocations and wait until every earlier one settled.
    pub async fn drain(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        info!(in_flight = self.in_flight(), "Draining dispatcher");
        self.inner.in_flight.settled().await;
        self.current().pool.drain().await;
        info!("Dispatcher drained");
    }

    /// Rescan the function folder and swap in a new generation.
    ///
    /// Stats carry over by function name. The old generation finishes its
    /// in-flight invocations and is then drained and destroyed in the
    /// background.
    pub async fn reload(&self) -> Result<(), ConfigError> {
        let _reloading = self.inner.reloading.lock().await;
        let old = self.current();
        let registry = FunctionRegistry::scan(&self.inner.config.folder, Some(&old.registry))?;

        let generation = Arc::new(build_generation(
            &self.inner.config,
            &self.inner.spawn,
            old.number + 1,
            registry,
        )?);
        let functions = generation.registry.len();
        {
            let mut current = self.inner.current.write();
            *current = generation;
        }
        self.inner.retired.lock().push(old.clone());
        info!(generation = old.number + 1, functions, "Reloaded functions");
        self.inner
            .events
            .publish(DispatcherEvent::Reloaded { functions });

        let dispatcher = self.clone();
        tokio::spawn(async move {
            old.in_flight.settled().await;
            old.pool.drain().await;
            info!(generation = old.number, "Drained old worker pool");
            old.pool.destroy_all();
            dispatcher
                .inner
                .retired
                .lock()
                .retain(|retired| !Arc::ptr_eq(retired, &old));
        });
        Ok(())
    }

    /// Reload whenever the function folder changes. Idempotent.
    pub fn watch(&self) {
        let mut slot = self.inner.watcher.lock();
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let folder = self.inner.config.folder.clone();
        let poll = self.inner.config.poll_interval;
        let debounce = self.inner.config.reload_debounce;

        *slot = Some(tokio::spawn(async move {
            let mut watcher = SourceWatcher::new(folder, poll, debounce).await;
            loop {
                watcher.changed().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let dispatcher = Dispatcher { inner };
                if let Err(err) = dispatcher.reload().await {
                    warn!(error = %err, "Reload failed; keeping current functions");
                }
            }
        }));
    }

    /// Stop watching and kill every worker of every generation.
    pub fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        if let Some(watcher) = self.inner.watcher.lock().take() {
            watcher.abort();
        }
        self.current().pool.destroy_all();
        for generation in self.inner.retired.lock().drain(..) {
            generation.pool.destroy_all();
        }
        info!("Dispatcher shut down");
    }
}

fn build_generation(
    config: &RuntimeConfig,
    spawn: &SpawnConfig,
    number: u64,
    registry: FunctionRegistry,
) -> Result<Generation, ConfigError> {
    let pool = create_pool(
        spawn.clone(),
        config.effective_max_workers(),
        config.max_per_process,
    )?;
    Ok(Generation {
        number,
        registry,
        pool,
        in_flight: InFlight::new(),
    })
}
