//! Single-tenancy pool: one invocation per worker process.

use super::{wait_for_lease, Lease, PoolStatus, Waiter, WorkerPool};
use crate::error::PoolError;
use crate::worker::{spawn, InvocationId, SpawnConfig, WorkerHandle, WorkerId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Pool handing each worker to at most one invocation at a time.
#[derive(Clone)]
pub struct SinglePool {
    inner: Arc<Inner>,
}

struct Inner {
    spawn: SpawnConfig,
    max_workers: usize,
    state: Mutex<State>,
    drained: watch::Sender<bool>,
}

struct State {
    idle: VecDeque<WorkerHandle>,
    leased: HashMap<WorkerId, WorkerHandle>,
    spawning: usize,
    waiters: VecDeque<Waiter>,
    accepting: bool,
    closed: bool,
}

impl State {
    fn size(&self) -> usize {
        self.idle.len() + self.leased.len() + self.spawning
    }

    fn pop_idle(&mut self) -> Option<WorkerHandle> {
        while let Some(worker) = self.idle.pop_front() {
            if worker.is_alive() {
                return Some(worker);
            }
            debug!(worker = worker.id(), "Discarding dead idle worker");
        }
        None
    }

    fn is_drained(&self) -> bool {
        !self.accepting && self.leased.is_empty() && self.spawning == 0 && self.waiters.is_empty()
    }
}

enum Next {
    Spawn(Waiter),
    Wait,
}

impl SinglePool {
    /// Create a pool of at most `max_workers` processes.
    pub fn new(spawn: SpawnConfig, max_workers: usize) -> Self {
        let (drained, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                spawn,
                max_workers,
                state: Mutex::new(State {
                    idle: VecDeque::new(),
                    leased: HashMap::new(),
                    spawning: 0,
                    waiters: VecDeque::new(),
                    accepting: true,
                    closed: false,
                }),
                drained,
            }),
        }
    }

    /// Lease an idle worker, reserve a spawn slot, or report that the caller
    /// must wait.
    fn next(&self, state: &mut State, waiter: Waiter) -> Result<Next, Waiter> {
        if let Some(worker) = state.pop_idle() {
            state.leased.insert(worker.id(), worker.clone());
            let lease = Lease::new(worker, waiter.invocation, false);
            return match waiter.tx.send(Ok(lease)) {
                Ok(()) => Ok(Next::Wait),
                Err(Ok(lease)) => {
                    // Receiver went away; keep the worker for the next caller.
                    state.leased.remove(&lease.worker().id());
                    state.idle.push_front(lease.worker().clone());
                    Ok(Next::Wait)
                }
                Err(Err(_)) => Ok(Next::Wait),
            };
        }
        if state.size() < self.inner.max_workers {
            state.spawning += 1;
            return Ok(Next::Spawn(waiter));
        }
        Err(waiter)
    }

    /// Hand freed capacity to the oldest waiters.
    fn settle(&self, state: &mut State) {
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.is_closed() {
                continue;
            }
            match self.next(state, waiter) {
                Ok(Next::Spawn(waiter)) => {
                    tokio::spawn(self.clone().spawn_for(waiter));
                }
                Ok(_) => {}
                Err(waiter) => {
                    state.waiters.push_front(waiter);
                    break;
                }
            }
        }
        if state.is_drained() {
            self.inner.drained.send_replace(true);
        }
    }

    async fn spawn_for(self, waiter: Waiter) {
        let spawned = spawn(&self.inner.spawn).await;

        let mut state = self.inner.state.lock();
        state.spawning -= 1;
        match spawned {
            Ok(worker) if state.closed => {
                worker.destroy();
                let _ = waiter.tx.send(Err(PoolError::Closed));
            }
            Ok(worker) => {
                debug!(worker = worker.id(), pid = ?worker.pid(), "Worker joined pool");
                state.leased.insert(worker.id(), worker.clone());
                let lease = Lease::new(worker, waiter.invocation, false);
                if let Err(Ok(lease)) = waiter.tx.send(Ok(lease)) {
                    state.leased.remove(&lease.worker().id());
                    state.idle.push_back(lease.worker().clone());
                }
            }
            Err(err) => {
                let _ = waiter.tx.send(Err(err.into()));
            }
        }
        self.settle(&mut state);
    }

    fn give_back(&self, lease: Lease, kill: bool) {
        let mut state = self.inner.state.lock();
        let worker = lease.worker().clone();
        state.leased.remove(&worker.id());

        if state.closed || kill || !worker.is_alive() {
            worker.destroy();
        } else {
            state.idle.push_back(worker);
        }
        self.settle(&mut state);
    }
}

#[async_trait]
impl WorkerPool for SinglePool {
    async fn acquire(&self, invocation: InvocationId) -> Result<Lease, PoolError> {
        let (waiter, rx) = Waiter::new(invocation);
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            if !state.accepting {
                return Err(PoolError::Draining);
            }
            // Earlier waiters keep their place in line.
            if state.waiters.is_empty() {
                match self.next(&mut state, waiter) {
                    Ok(Next::Spawn(waiter)) => {
                        tokio::spawn(self.clone().spawn_for(waiter));
                    }
                    Ok(_) => {}
                    Err(waiter) => state.waiters.push_back(waiter),
                }
            } else {
                state.waiters.push_back(waiter);
            }
        }
        wait_for_lease(rx).await
    }

    fn release(&self, lease: Lease) {
        self.give_back(lease, false);
    }

    fn destroy(&self, lease: Lease) {
        self.give_back(lease, true);
    }

    async fn drain(&self) {
        let mut drained = self.inner.drained.subscribe();
        {
            let mut state = self.inner.state.lock();
            state.accepting = false;
            self.settle(&mut state);
        }
        let _ = drained.wait_for(|drained| *drained).await;
    }

    fn destroy_all(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        state.accepting = false;
        for worker in state.idle.drain(..) {
            worker.destroy();
        }
        for (_, worker) in state.leased.drain() {
            worker.destroy();
        }
        for waiter in state.waiters.drain(..) {
            let _ = waiter.tx.send(Err(PoolError::Closed));
        }
        if state.spawning == 0 {
            self.inner.drained.send_replace(true);
        }
    }

    fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            size: state.size(),
            available: state.idle.len(),
            queued: state.waiters.len(),
        }
    }
}
