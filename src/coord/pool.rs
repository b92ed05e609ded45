//! Worker slots
//!
//! Each worker is one permit on a semaphore. A lease holds the permit for as
//! long as a block runs on that worker. A worker that fails for good is
//! retired: its permit is forgotten until `restore` puts it back.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::coord::guard::{lock_recover, write_recover};
use crate::coord::types::{RunState, RunStatus, WorkBlock, Worker, WorkerStatus};

/// Build `count` fresh idle workers
pub fn create_workers(count: usize) -> Vec<Worker> {
    (0..count).map(Worker::new).collect()
}

/// A worker bound to one block; the slot frees when this is dropped
#[derive(Debug)]
pub struct WorkerLease {
    pub worker_id: String,
    permit: OwnedSemaphorePermit,
}

pub struct WorkerPool {
    slots: Mutex<Arc<Semaphore>>,
    wait_timeout: Duration,
}

impl WorkerPool {
    pub fn new(size: usize, wait_timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(Arc::new(Semaphore::new(size))),
            wait_timeout,
        }
    }

    /// Replace the slot set. Outstanding leases keep their old permits.
    pub fn resize(&self, size: usize) {
        let mut slots = lock_recover(&self.slots);
        slots.close();
        *slots = Arc::new(Semaphore::new(size));
        debug!("Worker pool resized to {}", size);
    }

    /// Take a terminally failed worker's slot out of service. With no live
    /// worker left the pool closes so blocked waiters give up at once.
    pub fn retire(&self, lease: WorkerLease, live_workers: usize) {
        lease.permit.forget();
        if live_workers == 0 {
            lock_recover(&self.slots).close();
            warn!("Every worker has failed, worker pool closed");
        } else {
            debug!(worker_id = %lease.worker_id, "Worker retired");
        }
    }

    /// Return one retired slot to service
    pub fn restore(&self) {
        let mut slots = lock_recover(&self.slots);
        if slots.is_closed() {
            *slots = Arc::new(Semaphore::new(1));
        } else {
            slots.add_permits(1);
        }
    }

    /// Wait for a free slot and bind a worker to `block`.
    ///
    /// Only idle workers are bound. Returns `None` on timeout, on
    /// cancellation, or when no worker is eligible; the caller leaves the
    /// block pending.
    pub async fn acquire(
        &self,
        state: &RwLock<RunState>,
        block: &WorkBlock,
        mut status: watch::Receiver<RunStatus>,
    ) -> Option<WorkerLease> {
        let slots = lock_recover(&self.slots).clone();

        let permit = tokio::select! {
            waited = timeout(self.wait_timeout, slots.acquire_owned()) => match waited {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    debug!(block_id = %block.id, "Worker pool was resized while waiting");
                    return None;
                }
                Err(_) => {
                    warn!(
                        block_id = %block.id,
                        "No worker available after {:?}",
                        self.wait_timeout
                    );
                    return None;
                }
            },
            _ = status.wait_for(|s| *s == RunStatus::Cancelled) => {
                debug!(block_id = %block.id, "Run cancelled while waiting for a worker");
                return None;
            }
        };

        let mut state = write_recover(state);
        let Some(worker) = state
            .workers
            .iter_mut()
            .find(|w| w.status == WorkerStatus::Idle)
        else {
            warn!(block_id = %block.id, "Slot free but no idle worker to bind");
            return None;
        };

        worker.status = WorkerStatus::Assigned;
        worker.current_step = Some(block.step_id.clone());
        worker.current_block = Some(block.id.clone());
        worker.target_files = block.files.clone();
        worker.progress = 0;
        debug!(block_id = %block.id, worker_id = %worker.id, "Worker assigned");

        Some(WorkerLease {
            worker_id: worker.id.clone(),
            permit,
        })
    }
}
