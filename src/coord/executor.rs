//! Block execution on a leased worker
//!
//! One attempt runs: lock files, execute, verify, record. Any failure in
//! those stages goes through the retry policy. Locks are released on every
//! path, including cancellation.
//!
//! Executor and verifier calls run as their own tasks. Cancelling the run
//! detaches them: the delegated work finishes in the background and its
//! outcome is discarded.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::errors::{CoordError, Result};
use crate::coord::coordinator::CoordinatorInner;
use crate::coord::events::CoordinatorEvent;
use crate::coord::types::{
    BlockResult, BlockStatus, LogLevel, RunStatus, WorkBlock, WorkerStatus,
};

/// Obtain a worker for `block_id` and run one attempt.
///
/// Without a worker the block is left pending for the scheduler to retry.
pub(crate) async fn dispatch(inner: &CoordinatorInner, block_id: &str) {
    let Some(block) = inner.read(|state| state.block(block_id).cloned()) else {
        warn!(block_id, "Dispatch for unknown block");
        return;
    };

    let Some(lease) = inner
        .pool
        .acquire(&inner.state, &block, inner.status_receiver())
        .await
    else {
        debug!(block_id, "No worker obtained, block stays pending");
        return;
    };
    let worker_id = lease.worker_id.clone();
    inner.publish_worker(&worker_id);

    let terminal = match execute_block(inner, &block, &worker_id).await {
        Ok(()) => false,
        Err(err) if err.is_cancellation() => {
            abandon(inner, block_id);
            false
        }
        Err(err) => !apply_retry_policy(inner, block_id, &worker_id, &err),
    };

    if terminal {
        let live = inner.read(|state| state.live_workers());
        inner.pool.retire(lease, live);
    }
    // Otherwise the lease drops here, after the worker's final state is recorded
}

async fn execute_block(inner: &CoordinatorInner, block: &WorkBlock, worker_id: &str) -> Result<()> {
    let locks = if inner.config.allow_concurrent_file_edits {
        None
    } else {
        Some(inner.locks.acquire_all(&block.files, worker_id).await?)
    };

    let capacity = inner.config.worker_log_capacity;
    let started = inner.write(|state| {
        if state.status == RunStatus::Cancelled {
            return false;
        }
        if let Some(b) = state.block_mut(&block.id) {
            b.status = BlockStatus::Assigned;
            b.assigned_worker = Some(worker_id.to_string());
        }
        // A pause issued while this worker waited on locks still applies
        let status = if state.status == RunStatus::Paused {
            WorkerStatus::Paused
        } else {
            WorkerStatus::Working
        };
        if let Some(w) = state.worker_mut(worker_id) {
            w.status = status;
            w.log(LogLevel::Info, format!("Starting {}", block.id), capacity);
        }
        true
    });
    if !started {
        return Err(CoordError::cancelled("start block"));
    }
    inner.publish_worker(worker_id);

    inner.checkpoint("execute block").await?;

    let executor = Arc::clone(&inner.executor);
    let context = block.context.clone();
    let task = tokio::spawn(async move { executor.execute(&context).await });
    let execution = tokio::select! {
        joined = task => joined.map_err(|err| {
            CoordError::execution(&block.id, format!("executor task failed: {}", err))
        })??,
        _ = inner.cancelled() => {
            debug!(block_id = %block.id, "Executor detached by cancellation");
            return Err(CoordError::cancelled("execute block"));
        }
    };
    if !execution.success {
        let message = execution
            .error
            .clone()
            .unwrap_or_else(|| "executor reported failure".to_string());
        return Err(CoordError::execution(&block.id, message).with_context("worker", worker_id));
    }

    let verification = if inner.config.verify_before_merge {
        inner.update_worker(worker_id, |w| w.status = WorkerStatus::Verifying);
        let current = inner
            .read(|state| state.block(&block.id).cloned())
            .unwrap_or_else(|| block.clone());
        let verifier = Arc::clone(&inner.verifier);
        let candidate = execution.clone();
        let task = tokio::spawn(async move { verifier.verify(&current, &candidate).await });
        let verification = tokio::select! {
            joined = task => joined.map_err(|err| {
                CoordError::verification(&block.id, vec![format!("verifier task failed: {}", err)])
            })??,
            _ = inner.cancelled() => {
                debug!(block_id = %block.id, "Verifier detached by cancellation");
                return Err(CoordError::cancelled("verify block"));
            }
        };
        if !verification.passed {
            return Err(CoordError::verification(&block.id, verification.failed_checks()));
        }
        Some(verification)
    } else {
        None
    };

    let result = BlockResult {
        execution,
        verification,
    };
    let recorded = inner.write(|state| {
        if state.status == RunStatus::Cancelled {
            return false;
        }
        if let Some(b) = state.block_mut(&block.id) {
            b.status = BlockStatus::Completed;
            b.result = Some(result.clone());
            b.last_error = None;
        }
        if !state.completed_blocks.contains(&block.id) {
            state.completed_blocks.push(block.id.clone());
        }
        if let Some(w) = state.worker_mut(worker_id) {
            w.status = WorkerStatus::Completed;
            w.progress = 100;
            w.last_result = Some(result.clone());
            w.log(LogLevel::Info, format!("Completed {}", block.id), capacity);
        }
        true
    });
    if !recorded {
        return Err(CoordError::cancelled("record block"));
    }
    inner.publish_worker(worker_id);
    info!(
        block_id = %block.id,
        worker_id,
        tokens = result.execution.tokens_used,
        "Block completed"
    );
    inner.emit(CoordinatorEvent::BlockCompleted {
        block_id: block.id.clone(),
        result,
    });

    drop(locks);
    inner.update_worker(worker_id, |w| w.release());
    Ok(())
}

/// Send the block back to pending, or fail it for good once retries run
/// out or the error is not recoverable. Returns whether a retry is queued.
fn apply_retry_policy(
    inner: &CoordinatorInner,
    block_id: &str,
    worker_id: &str,
    err: &CoordError,
) -> bool {
    let config = &inner.config;
    let message = err.to_string();
    let capacity = config.worker_log_capacity;

    let retried = inner.write(|state| {
        let Some(block) = state.block_mut(block_id) else {
            return false;
        };
        block.assigned_worker = None;
        block.last_error = Some(message.clone());

        let retry = config.retry_failed_blocks
            && block.retry_count < config.max_retries
            && err.is_recoverable();
        if retry {
            block.retry_count += 1;
            block.status = BlockStatus::Pending;
        } else {
            block.status = BlockStatus::Failed;
        }
        let attempt = block.retry_count;

        if !retry && !state.failed_blocks.iter().any(|id| id == block_id) {
            state.failed_blocks.push(block_id.to_string());
        }

        if let Some(w) = state.worker_mut(worker_id) {
            w.last_error = Some(message.clone());
            if retry {
                w.log(
                    LogLevel::Warn,
                    format!("{} failed, retry {}/{}: {}", block_id, attempt, config.max_retries, message),
                    capacity,
                );
                w.release();
            } else {
                w.log(LogLevel::Error, format!("{} failed: {}", block_id, message), capacity);
                w.status = WorkerStatus::Failed;
            }
        }
        retry
    });

    if retried {
        warn!(block_id, worker_id, category = err.category(), "Block failed, will retry: {}", err);
    } else {
        warn!(block_id, worker_id, category = err.category(), "Block failed terminally: {}", err);
    }
    inner.publish_worker(worker_id);
    retried
}

/// Cancellation mid-attempt: the block goes back to pending untouched by
/// the retry counter, and the worker keeps the status cancel gave it
fn abandon(inner: &CoordinatorInner, block_id: &str) {
    inner.write(|state| {
        if let Some(block) = state.block_mut(block_id) {
            if block.status == BlockStatus::Assigned {
                block.status = BlockStatus::Pending;
            }
            block.assigned_worker = None;
        }
    });
    debug!(block_id, "Block abandoned after cancellation");
}
