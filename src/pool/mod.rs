//! Worker pools.
//!
//! A pool owns worker processes and hands them out as [`Lease`]s, one per
//! invocation. Two tenancy strategies exist:
//!
//! - [`SinglePool`]: one invocation per process.
//! - [`MultiPool`]: several concurrent invocations multiplexed onto one
//!   process.
//!
//! Both bound their capacity and queue acquisitions FIFO once it is reached.

mod multi;
mod single;

pub use multi::{MultiPool, ProcessLifecycle};
pub use single::SinglePool;

use crate::error::{ConfigError, PoolError, WorkerError};
use crate::worker::{Completion, InvocationId, SpawnConfig, TaskMessage, WorkerHandle};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Occupancy snapshot of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Live (or starting) worker processes.
    pub size: usize,
    /// Capacity that can be handed out without spawning.
    pub available: usize,
    /// Acquisitions waiting for capacity.
    pub queued: usize,
}

/// A pool's per-invocation claim on a worker.
///
/// Every lease must be handed back through exactly one of
/// [`WorkerPool::release`], [`WorkerPool::destroy`] or [`WorkerPool::revoke`].
#[must_use = "a lease must be returned to its pool"]
#[derive(Debug)]
pub struct Lease {
    worker: WorkerHandle,
    invocation: InvocationId,
    multiplexed: bool,
}

impl Lease {
    pub(crate) fn new(worker: WorkerHandle, invocation: InvocationId, multiplexed: bool) -> Self {
        Self {
            worker,
            invocation,
            multiplexed,
        }
    }

    /// The leased worker.
    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    /// The invocation holding this lease.
    pub fn invocation_id(&self) -> InvocationId {
        self.invocation
    }

    /// Whether the worker may run other invocations concurrently.
    pub fn is_multiplexed(&self) -> bool {
        self.multiplexed
    }

    /// Send a task to the leased worker, stamped with this lease's id and
    /// tenancy.
    pub fn send(&self, mut task: TaskMessage) -> Result<Completion, WorkerError> {
        task.id = self.invocation;
        task.multi = self.multiplexed;
        self.worker.send(&task)
    }
}

/// A bounded pool of worker processes.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Obtain a worker for an invocation, spawning or queueing as needed.
    async fn acquire(&self, invocation: InvocationId) -> Result<Lease, PoolError>;

    /// Return a lease after its invocation completed.
    fn release(&self, lease: Lease);

    /// Return a lease whose worker must not be reused.
    fn destroy(&self, lease: Lease);

    /// Reclaim a lease whose invocation missed its deadline.
    fn revoke(&self, lease: Lease) {
        self.destroy(lease)
    }

    /// Stop accepting acquisitions and wait until every lease came back and
    /// the wait queue is empty.
    async fn drain(&self);

    /// Kill every worker and fail every queued acquisition.
    fn destroy_all(&self);

    /// Current occupancy.
    fn status(&self) -> PoolStatus;
}

/// Queued acquisition.
pub(crate) struct Waiter {
    pub invocation: InvocationId,
    pub tx: oneshot::Sender<Result<Lease, PoolError>>,
}

impl Waiter {
    pub fn new(invocation: InvocationId) -> (Self, oneshot::Receiver<Result<Lease, PoolError>>) {
        let (tx, rx) = oneshot::channel();
        (Self { invocation, tx }, rx)
    }
}

pub(crate) async fn wait_for_lease(
    rx: oneshot::Receiver<Result<Lease, PoolError>>,
) -> Result<Lease, PoolError> {
    rx.await.unwrap_or(Err(PoolError::Closed))
}

/// Build the pool matching the tenancy settings: more than one invocation
/// per process selects the multiplexed pool.
pub fn create_pool(
    spawn: SpawnConfig,
    max_workers: usize,
    max_per_process: usize,
) -> Result<Arc<dyn WorkerPool>, ConfigError> {
    if max_workers == 0 {
        return Err(ConfigError::NoWorkers);
    }
    if max_per_process == 0 {
        return Err(ConfigError::NoSlots);
    }
    if max_per_process > 1 {
        Ok(Arc::new(MultiPool::new(spawn, max_workers, max_per_process)?))
    } else {
        Ok(Arc::new(SinglePool::new(spawn, max_workers)))
    }
}

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use crate::worker::SpawnConfig;
    use std::time::Duration;

    /// A worker that handshakes and then swallows tasks.
    pub fn idle_worker() -> SpawnConfig {
        SpawnConfig::new("/bin/sh")
            .arg("-c")
            .arg("echo '{\"ready\":true}'\nwhile read line; do :; done")
            .verbosity(0)
            .handshake_timeout(Duration::from_secs(5))
    }

    /// A worker that never handshakes.
    pub fn mute_worker() -> SpawnConfig {
        SpawnConfig::new("/bin/sh")
            .arg("-c")
            .arg("sleep 30")
            .verbosity(0)
            .handshake_timeout(Duration::from_millis(100))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::test_support::idle_worker;
    use super::*;

    #[tokio::test]
    async fn test_create_pool_selects_tenancy() {
        let single = create_pool(idle_worker(), 2, 1).unwrap();
        let lease = single.acquire(1).await.unwrap();
        assert!(!lease.is_multiplexed());
        single.release(lease);
        single.destroy_all();

        let multi = create_pool(idle_worker(), 1, 4).unwrap();
        let lease = multi.acquire(1).await.unwrap();
        assert!(lease.is_multiplexed());
        multi.release(lease);
        multi.destroy_all();
    }

    #[test]
    fn test_create_pool_rejects_bad_settings() {
        assert!(matches!(create_pool(idle_worker(), 0, 1), Err(ConfigError::NoWorkers)));
        assert!(matches!(create_pool(idle_worker(), 1, 0), Err(ConfigError::NoSlots)));
        assert!(matches!(
            create_pool(idle_worker().debug(true), 1, 2),
            Err(ConfigError::DebugMultiTenancy)
        ));
    }
}
