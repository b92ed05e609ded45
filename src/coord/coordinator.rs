//! Coordinator - the control surface of a run
//!
//! The coordinator owns one Run State and drives it through
//! `planning -> executing -> merging -> verifying -> completed|failed`.
//! Control calls (pause, resume, cancel, ...) may arrive from any task while
//! a run is in flight; they act on the same shared state.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::core::config::CoordinatorConfig;
use crate::core::errors::{CoordError, Result};
use crate::coord::action::{Executor, PassingVerifier, SimulatedExecutor, Verifier};
use crate::coord::conflicts;
use crate::coord::events::{CoordinatorEvent, EventBus, EventEnvelope};
use crate::coord::graph::DependencyGraph;
use crate::coord::guard::{read_recover, write_recover};
use crate::coord::locks::FileLockManager;
use crate::coord::pool::{create_workers, WorkerPool};
use crate::coord::progress;
use crate::coord::scheduler;
use crate::coord::types::{
    BlockStatus, FileLock, LogLevel, MergeConflict, RunState, RunStatus, WorkBlock, Worker,
    WorkerStatus,
};
use crate::plan::{decompose, Plan};

/// State and services shared by the run flow and the control calls
pub(crate) struct CoordinatorInner {
    pub(crate) config: CoordinatorConfig,
    pub(crate) state: RwLock<RunState>,
    status: watch::Sender<RunStatus>,
    pub(crate) locks: FileLockManager,
    pub(crate) pool: WorkerPool,
    events: EventBus,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) verifier: Arc<dyn Verifier>,
    active: AtomicBool,
    disposed: AtomicBool,
}

impl CoordinatorInner {
    pub(crate) fn read<R>(&self, f: impl FnOnce(&RunState) -> R) -> R {
        f(&read_recover(&self.state))
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut RunState) -> R) -> R {
        f(&mut write_recover(&self.state))
    }

    pub(crate) fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    pub(crate) fn status_receiver(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    pub(crate) fn emit(&self, event: CoordinatorEvent) {
        let run_id = self.read(|state| state.run_id.clone());
        self.events.emit(&run_id, event);
    }

    /// Set the status while the state lock is held, keeping the watch
    /// channel in step with the state
    fn commit_status(&self, state: &mut RunState, status: RunStatus) -> RunStatus {
        let previous = std::mem::replace(&mut state.status, status);
        self.status.send_replace(status);
        previous
    }

    fn announce_status(&self, previous: RunStatus, status: RunStatus) {
        if previous != status {
            debug!("Run status {:?} -> {:?}", previous, status);
            self.emit(CoordinatorEvent::StatusChanged { status });
        }
    }

    /// Unconditional status change
    fn set_status(&self, status: RunStatus) {
        let previous = self.write(|state| self.commit_status(state, status));
        self.announce_status(previous, status);
    }

    /// Status change made by the run flow; refused once the run is cancelled
    fn advance(&self, status: RunStatus) -> bool {
        let previous = self.write(|state| {
            if state.status == RunStatus::Cancelled {
                return None;
            }
            Some(self.commit_status(state, status))
        });
        match previous {
            Some(previous) => {
                self.announce_status(previous, status);
                true
            }
            None => false,
        }
    }

    /// Notify subscribers with the worker's current snapshot
    pub(crate) fn publish_worker(&self, worker_id: &str) {
        if let Some(worker) = self.read(|state| state.worker(worker_id).cloned()) {
            self.emit(CoordinatorEvent::WorkerUpdated { worker });
        }
    }

    pub(crate) fn update_worker(&self, worker_id: &str, f: impl FnOnce(&mut Worker)) {
        let found = self.write(|state| match state.worker_mut(worker_id) {
            Some(worker) => {
                f(worker);
                true
            }
            None => false,
        });
        if found {
            self.publish_worker(worker_id);
        }
    }

    /// Park while paused. Fails with `Cancelled` once the run is cancelled.
    pub(crate) async fn wait_while_paused(&self, operation: &str) -> Result<()> {
        let mut rx = self.status_receiver();
        let status = match rx.wait_for(|s| *s != RunStatus::Paused).await {
            Ok(status) => *status,
            Err(_) => return Err(CoordError::cancelled(operation)),
        };
        if status == RunStatus::Cancelled {
            return Err(CoordError::cancelled(operation));
        }
        Ok(())
    }

    /// Pause and cancellation checkpoint inside a block attempt
    pub(crate) async fn checkpoint(&self, operation: &str) -> Result<()> {
        self.wait_while_paused(operation).await
    }

    /// Resolves once the run is cancelled
    pub(crate) async fn cancelled(&self) {
        let mut rx = self.status_receiver();
        let closed = rx.wait_for(|s| *s == RunStatus::Cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    /// Terminally fail blocks the scheduler can no longer dispatch
    pub(crate) fn fail_unschedulable(&self, block_ids: &[String], reason: &str) {
        self.write(|state| {
            for id in block_ids {
                if let Some(block) = state.block_mut(id) {
                    block.status = BlockStatus::Failed;
                    block.last_error = Some(reason.to_string());
                }
                if !state.failed_blocks.contains(id) {
                    state.failed_blocks.push(id.clone());
                }
            }
        });
    }

    /// Record the end of a run and notify
    fn finish(&self, status: RunStatus) {
        if !self.advance(status) {
            return;
        }
        let snapshot = self.write(|state| {
            state.completed_at = Some(Utc::now());
            state.clone()
        });
        info!(
            run_id = %snapshot.run_id,
            completed = snapshot.completed_blocks.len(),
            failed = snapshot.failed_blocks.len(),
            "Run finished: {:?}",
            status
        );
        self.emit(CoordinatorEvent::RunComplete {
            state: Box::new(snapshot),
        });
    }
}

/// Clears the active flag when an `execute()` call ends, including when the
/// caller drops its future
struct ActiveRun<'a>(&'a AtomicBool);

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Parallel plan coordinator.
///
/// Cloning is cheap and every clone controls the same run, so one task can
/// `execute()` while another pauses or cancels.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    /// Coordinator with the simulated executor and the passing verifier
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        Self::with_collaborators(
            config,
            Arc::new(SimulatedExecutor::default()),
            Arc::new(PassingVerifier),
        )
    }

    pub fn with_collaborators(
        config: CoordinatorConfig,
        executor: Arc<dyn Executor>,
        verifier: Arc<dyn Verifier>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            "Creating coordinator: {} workers, executor {}, verifier {}",
            config.max_workers,
            executor.name(),
            verifier.name()
        );

        let (status, _) = watch::channel(RunStatus::Idle);
        let inner = CoordinatorInner {
            state: RwLock::new(RunState::new(create_workers(config.max_workers))),
            status,
            locks: FileLockManager::new(config.lock_timeout()),
            pool: WorkerPool::new(config.max_workers, config.worker_wait_timeout()),
            events: EventBus::new(config.event_capacity),
            executor,
            verifier,
            active: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Rebuild the worker set with `count` workers (default `max_workers`)
    pub fn initialize_workers(&self, count: Option<usize>) -> Result<Vec<Worker>> {
        let count = count.unwrap_or(self.inner.config.max_workers);
        if count == 0 {
            return Err(CoordError::configuration_field(
                "worker count must be at least 1",
                "count",
            ));
        }
        if self.inner.active.load(Ordering::SeqCst) {
            return Err(CoordError::invalid_state(
                "initialize_workers",
                "a run is in progress",
            ));
        }

        let workers = create_workers(count);
        self.inner.write(|state| state.workers = workers.clone());
        self.inner.pool.resize(count);
        for worker in &workers {
            self.inner.emit(CoordinatorEvent::WorkerUpdated {
                worker: worker.clone(),
            });
        }
        info!("Initialized {} workers", count);
        Ok(workers)
    }

    /// Run `plan` to completion and return the final state.
    ///
    /// Fails immediately if a run is already in progress or has not been
    /// reset. A cancelled run returns `Ok` with the cancelled state.
    pub async fn execute(&self, plan: Plan) -> Result<RunState> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(CoordError::invalid_state("execute", "coordinator is disposed"));
        }

        if inner
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoordError::configuration(
                "cannot execute while a run is in progress",
            ));
        }
        let _active = ActiveRun(&inner.active);

        let claimed = inner.write(|state| {
            if state.status != RunStatus::Idle {
                return Err(state.status);
            }
            state.plan = Some(plan.clone());
            state.started_at = Some(Utc::now());
            state.completed_at = None;
            state.error = None;
            inner.commit_status(state, RunStatus::Planning);
            Ok(())
        });
        if let Err(status) = claimed {
            return Err(CoordError::configuration(format!(
                "cannot execute while run is {:?}; reset first",
                status
            )));
        }
        inner.announce_status(RunStatus::Idle, RunStatus::Planning);
        info!(plan_id = %plan.id, steps = plan.steps.len(), "Executing plan {}", plan.title);
        if !plan.is_approved() {
            warn!(plan_id = %plan.id, "Plan has not been approved");
        }

        let outcome = self.run_plan(&plan).await;

        match outcome {
            Ok(()) => Ok(self.get_state()),
            Err(err) => {
                error!(category = err.category(), "Run failed: {}", err);
                let message = err.to_string();
                inner.write(|state| state.error = Some(message.clone()));
                inner.emit(CoordinatorEvent::RunError { message });
                inner.finish(RunStatus::Failed);
                Err(err)
            }
        }
    }

    async fn run_plan(&self, plan: &Plan) -> Result<()> {
        let inner = &self.inner;

        let blocks = decompose(plan);
        let graph = DependencyGraph::build(&blocks);
        info!(
            "Plan decomposed into {} blocks across {} waves",
            blocks.len(),
            graph.waves().len()
        );
        inner.write(|state| {
            state.blocks = blocks;
            state.completed_blocks.clear();
            state.failed_blocks.clear();
            state.conflicts.clear();
        });

        if !inner.advance(RunStatus::Executing) {
            return Ok(());
        }
        let ticker = progress::spawn_progress_task(inner.clone());
        let waves = scheduler::run_waves(inner, &graph).await;
        ticker.abort();
        progress::refresh(inner);

        match waves {
            Err(err) if err.is_cancellation() => {
                debug!("Wave loop stopped by cancellation");
                return Ok(());
            }
            Err(err) => return Err(err),
            Ok(()) => {}
        }
        if inner.status() == RunStatus::Cancelled {
            return Ok(());
        }

        let failed = inner.read(|state| state.failed_blocks.len());
        if failed > 0 {
            let message = format!("{} blocks failed", failed);
            warn!("{}", message);
            inner.write(|state| state.error = Some(message));
            inner.finish(RunStatus::Failed);
            return Ok(());
        }

        if !inner.advance(RunStatus::Merging) {
            return Ok(());
        }
        let detected = inner.read(|state| conflicts::detect_conflicts(&state.blocks));
        inner.write(|state| state.conflicts = detected.clone());
        for conflict in detected {
            inner.emit(CoordinatorEvent::ConflictDetected { conflict });
        }

        if !inner.advance(RunStatus::Verifying) {
            return Ok(());
        }
        if !self.verify_final_result() {
            warn!("Run has unresolved merge conflicts");
        }
        inner.finish(RunStatus::Completed);
        Ok(())
    }

    /// Snapshot of the whole run
    pub fn get_state(&self) -> RunState {
        self.inner.read(|state| state.clone())
    }

    pub fn get_workers(&self) -> Vec<Worker> {
        self.inner.read(|state| state.workers.clone())
    }

    pub fn get_work_blocks(&self) -> Vec<WorkBlock> {
        self.inner.read(|state| state.blocks.clone())
    }

    pub fn status(&self) -> RunStatus {
        self.inner.status()
    }

    /// File locks currently held by workers
    pub fn held_locks(&self) -> Vec<FileLock> {
        self.inner.locks.snapshot()
    }

    /// Stop dispatching new work; working workers show as paused
    pub fn pause(&self) -> Result<()> {
        let paused = self.inner.write(|state| {
            if state.status != RunStatus::Executing {
                return Err(state.status);
            }
            let mut touched = Vec::new();
            for worker in state.workers.iter_mut() {
                if worker.status == WorkerStatus::Working {
                    worker.status = WorkerStatus::Paused;
                    touched.push(worker.id.clone());
                }
            }
            self.inner.commit_status(state, RunStatus::Paused);
            Ok(touched)
        });
        let touched = paused.map_err(|status| {
            CoordError::invalid_state("pause", format!("run is {:?}", status))
        })?;

        self.inner
            .announce_status(RunStatus::Executing, RunStatus::Paused);
        for worker_id in &touched {
            self.inner.publish_worker(worker_id);
        }
        info!("Run paused ({} workers)", touched.len());
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let resumed = self.inner.write(|state| {
            if state.status != RunStatus::Paused {
                return Err(state.status);
            }
            let mut touched = Vec::new();
            for worker in state.workers.iter_mut() {
                if worker.status == WorkerStatus::Paused {
                    worker.status = WorkerStatus::Working;
                    touched.push(worker.id.clone());
                }
            }
            self.inner.commit_status(state, RunStatus::Executing);
            Ok(touched)
        });
        let touched = resumed.map_err(|status| {
            CoordError::invalid_state("resume", format!("run is {:?}", status))
        })?;

        self.inner
            .announce_status(RunStatus::Paused, RunStatus::Executing);
        for worker_id in &touched {
            self.inner.publish_worker(worker_id);
        }
        info!("Run resumed");
        Ok(())
    }

    /// Stop the run where it stands. Executor and verifier calls already in
    /// flight finish in the background; their results are discarded.
    pub fn cancel(&self) -> Result<()> {
        let inner = &self.inner;
        let capacity = inner.config.worker_log_capacity;
        let cancelled = inner.write(|state| {
            if state.status == RunStatus::Idle || state.status.is_terminal() {
                return Err(state.status);
            }
            let mut touched = Vec::new();
            for worker in state.workers.iter_mut() {
                if !matches!(worker.status, WorkerStatus::Idle | WorkerStatus::Completed) {
                    worker.status = WorkerStatus::Cancelled;
                    worker.log(LogLevel::Warn, "Run cancelled", capacity);
                    touched.push(worker.id.clone());
                }
            }
            state.completed_at = Some(Utc::now());
            let previous = inner.commit_status(state, RunStatus::Cancelled);
            Ok((previous, touched))
        });
        let (previous, touched) = cancelled.map_err(|status| {
            CoordError::invalid_state("cancel", format!("run is {:?}", status))
        })?;

        inner.announce_status(previous, RunStatus::Cancelled);
        inner.locks.clear();
        for worker_id in &touched {
            inner.publish_worker(worker_id);
        }
        warn!("Run cancelled, {} workers stopped", touched.len());
        inner.emit(CoordinatorEvent::RunComplete {
            state: Box::new(self.get_state()),
        });
        Ok(())
    }

    /// Put a failed worker back to idle and its block back to pending
    pub fn retry_worker(&self, worker_id: &str) -> Result<()> {
        let retried = self.inner.write(|state| {
            let worker = state
                .worker_mut(worker_id)
                .ok_or_else(|| CoordError::not_found("worker", worker_id))?;
            if worker.status != WorkerStatus::Failed {
                return Err(CoordError::invalid_state(
                    "retry_worker",
                    format!("{} is {:?}, not failed", worker_id, worker.status),
                ));
            }
            let block_id = worker.current_block.clone();
            worker.release();
            worker.last_error = None;

            if let Some(block_id) = &block_id {
                if let Some(block) = state.block_mut(block_id) {
                    block.status = BlockStatus::Pending;
                    block.assigned_worker = None;
                    block.retry_count = 0;
                }
                state.failed_blocks.retain(|id| id != block_id);
            }
            Ok(block_id)
        })?;

        self.inner.pool.restore();
        info!(worker_id, block_id = ?retried, "Worker reset for retry");
        self.inner.publish_worker(worker_id);
        Ok(())
    }

    /// Mark conflict `index` resolved
    pub fn resolve_conflict(&self, index: usize, resolution: &str) -> Result<MergeConflict> {
        let resolved = self.inner.write(|state| {
            conflicts::resolve_conflict(&mut state.conflicts, index, resolution).cloned()
        })?;
        info!("Conflict on {} resolved as {}", resolved.file, resolution);
        Ok(resolved)
    }

    /// True when no conflict is left unresolved
    pub fn verify_final_result(&self) -> bool {
        self.inner.read(|state| conflicts::all_resolved(&state.conflicts))
    }

    /// Start over with a fresh idle state, keeping worker identities
    pub fn reset(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.active.load(Ordering::SeqCst) {
            return Err(CoordError::invalid_state("reset", "a run is in progress"));
        }
        let count = inner.write(|state| {
            let mut workers = std::mem::take(&mut state.workers);
            for worker in &mut workers {
                worker.clear();
            }
            *state = RunState::new(workers);
            state.workers.len()
        });
        inner.locks.clear();
        inner.pool.resize(count);
        inner.set_status(RunStatus::Idle);
        info!("Coordinator reset");
        Ok(())
    }

    /// Receive every event emitted from now on; drop the receiver to
    /// unsubscribe
    pub fn subscribe(&self) -> async_broadcast::Receiver<EventEnvelope> {
        self.inner.events.subscribe()
    }

    /// Block ids grouped into the waves a run of `plan` would execute
    pub fn preview_waves(&self, plan: &Plan) -> Vec<Vec<String>> {
        DependencyGraph::build(&decompose(plan)).waves()
    }

    /// Cancel any run and close every subscription
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let status = self.inner.status();
        if status != RunStatus::Idle && !status.is_terminal() {
            let _ = self.cancel();
        }
        self.inner.locks.clear();
        self.inner.events.close();
        info!("Coordinator disposed");
    }
}
