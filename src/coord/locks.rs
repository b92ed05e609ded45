//! Per-file exclusive ownership
//!
//! A file is held by at most one worker. Waiters park on a `Notify` that
//! fires on every release, bounded by the configured lock timeout.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::core::errors::{CoordError, Result};
use crate::coord::types::FileLock;

pub struct FileLockManager {
    locks: DashMap<String, FileLock>,
    released: Notify,
    timeout: Duration,
}

impl FileLockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            released: Notify::new(),
            timeout,
        }
    }

    /// Grant the lock if the file is free or already held by `worker_id`
    pub fn try_acquire(&self, file: &str, worker_id: &str) -> bool {
        match self.locks.entry(file.to_string()) {
            Entry::Occupied(held) => held.get().worker_id == worker_id,
            Entry::Vacant(slot) => {
                slot.insert(FileLock {
                    file: file.to_string(),
                    worker_id: worker_id.to_string(),
                    acquired_at: Utc::now(),
                });
                true
            }
        }
    }

    /// Wait for the lock, failing with `LockTimeout` once the timeout elapses
    pub async fn acquire(&self, file: &str, worker_id: &str) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            // Register interest before checking so a release in between is not missed
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_acquire(file, worker_id) {
                debug!(file, worker_id, "Lock acquired");
                return Ok(());
            }
            trace!(file, worker_id, "Lock busy, waiting");

            if timeout_at(deadline, notified).await.is_err() {
                warn!(file, worker_id, "Lock wait timed out");
                return Err(CoordError::lock_timeout(
                    file,
                    worker_id,
                    self.timeout.as_millis() as u64,
                ));
            }
        }
    }

    /// Lock every file in order. On failure the locks taken so far are released.
    pub async fn acquire_all(&self, files: &[String], worker_id: &str) -> Result<LockSet<'_>> {
        let mut set = LockSet {
            manager: self,
            worker_id: worker_id.to_string(),
            files: Vec::with_capacity(files.len()),
        };
        for file in files {
            self.acquire(file, worker_id).await?;
            set.files.push(file.clone());
        }
        Ok(set)
    }

    /// Remove the lock only if `worker_id` owns it
    pub fn release(&self, file: &str, worker_id: &str) -> bool {
        let removed = self
            .locks
            .remove_if(file, |_, lock| lock.worker_id == worker_id)
            .is_some();
        if removed {
            debug!(file, worker_id, "Lock released");
            self.released.notify_waiters();
        }
        removed
    }

    /// Drop every lock regardless of owner
    pub fn clear(&self) {
        let count = self.locks.len();
        self.locks.clear();
        if count > 0 {
            debug!("Cleared {} file locks", count);
        }
        self.released.notify_waiters();
    }

    pub fn holder(&self, file: &str) -> Option<String> {
        self.locks.get(file).map(|lock| lock.worker_id.clone())
    }

    pub fn snapshot(&self) -> Vec<FileLock> {
        self.locks.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Locks held for one block; released when dropped, whatever the outcome
pub struct LockSet<'a> {
    manager: &'a FileLockManager,
    worker_id: String,
    files: Vec<String>,
}

impl LockSet<'_> {
    pub fn files(&self) -> &[String] {
        &self.files
    }
}

impl Drop for LockSet<'_> {
    fn drop(&mut self) {
        for file in &self.files {
            self.manager.release(file, &self.worker_id);
        }
    }
}
