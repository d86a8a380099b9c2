//! Multi-tenancy pool: several concurrent invocations per worker process.
//!
//! Capacity is counted twice. At most `max_workers` processes are counted
//! against the process limit, and at most `max_workers * max_per_process`
//! leases are out at once. A reaped process stops being counted right away
//! so a replacement can start, but it keeps running until its remaining
//! invocations have finished.

use super::{wait_for_lease, Lease, PoolStatus, Waiter, WorkerPool};
use crate::error::{ConfigError, PoolError};
use crate::worker::{spawn, InvocationId, SpawnConfig, WorkerHandle, WorkerId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle of a multiplexed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessLifecycle {
    /// Takes new invocations.
    Active,
    /// Reaped; finishes its current invocations, then terminates.
    Draining,
    /// Exited on its own.
    Dead,
}

struct Process {
    worker: WorkerHandle,
    lifecycle: ProcessLifecycle,
    in_flight: HashSet<InvocationId>,
    counted: bool,
}

impl Process {
    fn multiplex(&self) -> usize {
        self.in_flight.len()
    }
}

/// Pool multiplexing up to `max_per_process` invocations onto each process.
#[derive(Clone)]
pub struct MultiPool {
    inner: Arc<Inner>,
}

struct Inner {
    spawn: SpawnConfig,
    max_workers: usize,
    max_per_process: usize,
    state: Mutex<State>,
    drained: watch::Sender<bool>,
}

struct State {
    processes: BTreeMap<WorkerId, Process>,
    proc_count: usize,
    in_use: usize,
    spawning: usize,
    waiters: VecDeque<Waiter>,
    accepting: bool,
    closed: bool,
}

impl State {
    fn uncount(&mut self, id: WorkerId) {
        if let Some(process) = self.processes.get_mut(&id) {
            if process.counted {
                process.counted = false;
                self.proc_count -= 1;
            }
        }
    }

    /// Kill and forget a process once nothing runs on it.
    fn remove_if_idle(&mut self, id: WorkerId) {
        let idle = self
            .processes
            .get(&id)
            .map(|process| process.in_flight.is_empty())
            .unwrap_or(false);
        if idle {
            if let Some(process) = self.processes.remove(&id) {
                debug!(worker = id, lifecycle = ?process.lifecycle, "Terminating multiplexed process");
                process.worker.destroy();
            }
        }
    }

    /// Mark processes that exited on their own and drop the empty ones.
    fn sweep_dead(&mut self) {
        let dead: Vec<WorkerId> = self
            .processes
            .iter()
            .filter(|(_, process)| {
                process.lifecycle != ProcessLifecycle::Dead && !process.worker.is_alive()
            })
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(process) = self.processes.get_mut(&id) {
                process.lifecycle = ProcessLifecycle::Dead;
            }
            self.uncount(id);
            self.remove_if_idle(id);
        }
    }

    fn is_drained(&self) -> bool {
        !self.accepting && self.in_use == 0 && self.spawning == 0 && self.waiters.is_empty()
    }
}

enum Next {
    Done,
    Spawn(Waiter),
}

impl MultiPool {
    /// Create a pool of at most `max_workers` processes running up to
    /// `max_per_process` invocations each.
    pub fn new(
        spawn: SpawnConfig,
        max_workers: usize,
        max_per_process: usize,
    ) -> Result<Self, ConfigError> {
        if spawn.debug {
            return Err(ConfigError::DebugMultiTenancy);
        }
        let (drained, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                spawn,
                max_workers,
                max_per_process,
                state: Mutex::new(State {
                    processes: BTreeMap::new(),
                    proc_count: 0,
                    in_use: 0,
                    spawning: 0,
                    waiters: VecDeque::new(),
                    accepting: true,
                    closed: false,
                }),
                drained,
            }),
        })
    }

    fn slot_capacity(&self) -> usize {
        self.inner.max_workers * self.inner.max_per_process
    }

    fn next(&self, state: &mut State, waiter: Waiter) -> Result<Next, Waiter> {
        if state.in_use + state.spawning >= self.slot_capacity() {
            return Err(waiter);
        }
        state.sweep_dead();

        let reusable = state
            .processes
            .iter()
            .find(|(_, process)| {
                process.lifecycle == ProcessLifecycle::Active
                    && process.multiplex() < self.inner.max_per_process
            })
            .map(|(id, _)| *id);

        if let Some(id) = reusable {
            let lease = self.attach(state, id, waiter.invocation);
            if let Err(Ok(lease)) = waiter.tx.send(lease) {
                self.detach(state, lease);
            }
            return Ok(Next::Done);
        }

        if state.proc_count < self.inner.max_workers {
            state.proc_count += 1;
            state.spawning += 1;
            return Ok(Next::Spawn(waiter));
        }
        Err(waiter)
    }

    fn attach(&self, state: &mut State, id: WorkerId, invocation: InvocationId) -> Result<Lease, PoolError> {
        let process = state.processes.get_mut(&id).ok_or(PoolError::Closed)?;
        process.in_flight.insert(invocation);
        state.in_use += 1;
        Ok(Lease::new(process.worker.clone(), invocation, true))
    }

    /// Drop a lease's claim on its process. Returns the process id when it
    /// is still tracked.
    fn detach(&self, state: &mut State, lease: Lease) -> Option<WorkerId> {
        let id = lease.worker().id();
        let process = state.processes.get_mut(&id)?;
        if process.in_flight.remove(&lease.invocation_id()) {
            state.in_use -= 1;
        }
        Some(id)
    }

    fn settle(&self, state: &mut State) {
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.is_closed() {
                continue;
            }
            match self.next(state, waiter) {
                Ok(Next::Spawn(waiter)) => {
                    tokio::spawn(self.clone().spawn_for(waiter));
                }
                Ok(Next::Done) => {}
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
                let id = worker.id();
                debug!(worker = id, pid = ?worker.pid(), "Multiplexed process joined pool");
                state.processes.insert(
                    id,
                    Process {
                        worker,
                        lifecycle: ProcessLifecycle::Active,
                        in_flight: HashSet::new(),
                        counted: true,
                    },
                );
                let lease = self.attach(&mut state, id, waiter.invocation);
                if let Err(Ok(lease)) = waiter.tx.send(lease) {
                    self.detach(&mut state, lease);
                }
            }
            Err(err) => {
                state.proc_count -= 1;
                let _ = waiter.tx.send(Err(err.into()));
            }
        }
        self.settle(&mut state);
    }

    /// Terminate the process of a timed-out invocation without disturbing
    /// its siblings. The process stops counting against the process limit
    /// immediately and is killed once its last sibling finishes.
    pub fn reap(&self, lease: Lease) {
        let mut state = self.inner.state.lock();
        lease.worker().forget(lease.invocation_id());
        if let Some(id) = self.detach(&mut state, lease) {
            if let Some(process) = state.processes.get_mut(&id) {
                if process.lifecycle == ProcessLifecycle::Active {
                    process.lifecycle = ProcessLifecycle::Draining;
                }
                debug!(worker = id, siblings = process.multiplex(), "Reaping multiplexed process");
            }
            state.uncount(id);
            state.remove_if_idle(id);
        }
        self.settle(&mut state);
    }
}

#[async_trait]
impl WorkerPool for MultiPool {
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
            if state.waiters.is_empty() {
                match self.next(&mut state, waiter) {
                    Ok(Next::Spawn(waiter)) => {
                        tokio::spawn(self.clone().spawn_for(waiter));
                    }
                    Ok(Next::Done) => {}
                    Err(waiter) => state.waiters.push_back(waiter),
                }
            } else {
                state.waiters.push_back(waiter);
            }
        }
        wait_for_lease(rx).await
    }

    fn release(&self, lease: Lease) {
        let mut state = self.inner.state.lock();
        if let Some(id) = self.detach(&mut state, lease) {
            let lifecycle = match state.processes.get_mut(&id) {
                Some(process) if !process.worker.is_alive() => {
                    process.lifecycle = ProcessLifecycle::Dead;
                    ProcessLifecycle::Dead
                }
                Some(process) => process.lifecycle,
                None => ProcessLifecycle::Dead,
            };
            match lifecycle {
                ProcessLifecycle::Active => {}
                ProcessLifecycle::Dead => {
                    state.uncount(id);
                    state.remove_if_idle(id);
                }
                ProcessLifecycle::Draining => state.remove_if_idle(id),
            }
        }
        self.settle(&mut state);
    }

    /// A multiplexed worker is shared, so destroying one lease reaps its
    /// process instead of killing it outright.
    fn destroy(&self, lease: Lease) {
        self.reap(lease);
    }

    fn revoke(&self, lease: Lease) {
        self.reap(lease);
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
        for (_, process) in std::mem::take(&mut state.processes) {
            process.worker.destroy();
        }
        state.proc_count = state.spawning;
        state.in_use = 0;
        for waiter in state.waiters.drain(..) {
            let _ = waiter.tx.send(Err(PoolError::Closed));
        }
        if state.spawning == 0 {
            self.inner.drained.send_replace(true);
        }
    }

    fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        let available = state
            .processes
            .values()
            .filter(|process| process.lifecycle == ProcessLifecycle::Active)
            .map(|process| self.inner.max_per_process.saturating_sub(process.multiplex()))
            .sum();
        PoolStatus {
            size: state.proc_count,
            available,
            queued: state.waiters.len(),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::super::test_support::idle_worker;
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_prefers_reusing_a_process() {
        let pool = MultiPool::new(idle_worker(), 2, 3).unwrap();

        let a = pool.acquire(1).await.unwrap();
        let b = pool.acquire(2).await.unwrap();
        let c = pool.acquire(3).await.unwrap();
        assert_eq!(a.worker().id(), b.worker().id());
        assert_eq!(b.worker().id(), c.worker().id());
        assert!(a.is_multiplexed());
        assert_eq!(pool.status(), PoolStatus { size: 1, available: 0, queued: 0 });

        let d = pool.acquire(4).await.unwrap();
        assert_ne!(d.worker().id(), a.worker().id());
        assert_eq!(pool.status().size, 2);

        for lease in [a, b, c, d] {
            pool.release(lease);
        }
        assert_eq!(pool.status(), PoolStatus { size: 2, available: 6, queued: 0 });
        pool.destroy_all();
    }

    #[tokio::test]
    async fn test_queues_beyond_slot_capacity() {
        let pool = MultiPool::new(idle_worker(), 1, 2).unwrap();
        let a = pool.acquire(1).await.unwrap();
        let b = pool.acquire(2).await.unwrap();

        let queued = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire(3).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.status().queued, 1);

        pool.release(a);
        let c = timeout(Duration::from_secs(5), queued).await.unwrap().unwrap().unwrap();
        assert_eq!(c.worker().id(), b.worker().id());

        pool.release(b);
        pool.release(c);
        pool.destroy_all();
    }

    #[tokio::test]
    async fn test_reap_frees_process_slot_before_siblings_finish() {
        let pool = MultiPool::new(idle_worker(), 1, 2).unwrap();
        let timed_out = pool.acquire(1).await.unwrap();
        let sibling = pool.acquire(2).await.unwrap();
        let old = sibling.worker().clone();

        pool.reap(timed_out);
        assert!(old.is_alive());
        assert_eq!(pool.status().size, 0);

        // A replacement may start while the reaped process finishes up.
        let fresh = timeout(Duration::from_secs(5), pool.acquire(3)).await.unwrap().unwrap();
        assert_ne!(fresh.worker().id(), old.id());
        assert_eq!(pool.status().size, 1);

        pool.release(sibling);
        assert!(!old.is_alive());

        pool.release(fresh);
        pool.destroy_all();
    }

    #[tokio::test]
    async fn test_crashed_process_is_replaced() {
        let pool = MultiPool::new(idle_worker(), 1, 2).unwrap();
        let a = pool.acquire(1).await.unwrap();
        let crashed = a.worker().clone();
        crashed.destroy();
        pool.release(a);
        assert_eq!(pool.status().size, 0);

        let b = timeout(Duration::from_secs(5), pool.acquire(2)).await.unwrap().unwrap();
        assert_ne!(b.worker().id(), crashed.id());
        pool.release(b);
        pool.destroy_all();
    }

    #[tokio::test]
    async fn test_drain_and_destroy_all() {
        let pool = MultiPool::new(idle_worker(), 1, 2).unwrap();
        let lease = pool.acquire(1).await.unwrap();
        let worker = lease.worker().clone();

        let draining = tokio::spawn({
            let pool = pool.clone();
            async move { pool.drain().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!draining.is_finished());
        assert!(matches!(pool.acquire(2).await, Err(PoolError::Draining)));

        pool.release(lease);
        timeout(Duration::from_secs(5), draining).await.unwrap().unwrap();

        pool.destroy_all();
        assert!(!worker.is_alive());
    }

    #[test]
    fn test_rejects_debug_mode() {
        assert!(matches!(
            MultiPool::new(idle_worker().debug(true), 1, 2),
            Err(ConfigError::DebugMultiTenancy)
        ));
    }
}
