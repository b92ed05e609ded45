//! Periodic progress aggregation

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::coord::coordinator::CoordinatorInner;
use crate::coord::events::CoordinatorEvent;
use crate::coord::types::{BlockStatus, RunState, WorkerStatus};

/// `round(100 * (completed + 0.5 * working) / total)`, or `None` without blocks
pub fn compute_progress(state: &RunState) -> Option<u8> {
    let total = state.blocks.len();
    if total == 0 {
        return None;
    }
    let completed = state
        .blocks
        .iter()
        .filter(|b| b.status == BlockStatus::Completed)
        .count();
    let working = state.count_workers(WorkerStatus::Working);

    let pct = (100.0 * (completed as f64 + 0.5 * working as f64) / total as f64).round();
    Some(pct.clamp(0.0, 100.0) as u8)
}

/// Recompute progress and notify if it moved
pub(crate) fn refresh(inner: &CoordinatorInner) -> bool {
    let changed = inner.write(|state| match compute_progress(state) {
        Some(progress) if progress != state.progress => {
            state.progress = progress;
            Some(progress)
        }
        _ => None,
    });
    match changed {
        Some(progress) => {
            inner.emit(CoordinatorEvent::Progress { progress });
            true
        }
        None => false,
    }
}

/// Refresh on every interval tick until the run stops executing
pub(crate) fn spawn_progress_task(inner: Arc<CoordinatorInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.progress_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut status = inner.status_receiver();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !inner.status().is_running() {
                        break;
                    }
                    refresh(&inner);
                }
                changed = status.changed() => {
                    if changed.is_err() || !status.borrow().is_running() {
                        break;
                    }
                }
            }
        }
        debug!("Progress task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::pool::create_workers;
    use crate::plan::{decompose, Plan, Step};

    fn state_with(steps: usize) -> RunState {
        let mut plan = Plan::new("p", "progress");
        for i in 0..steps {
            plan = plan.with_step(Step::new(i.to_string(), "s"));
        }
        let mut state = RunState::new(create_workers(2));
        state.blocks = decompose(&plan);
        state
    }

    #[test]
    fn test_empty_run_has_no_progress() {
        assert_eq!(compute_progress(&state_with(0)), None);
    }

    #[test]
    fn test_working_counts_half() {
        let mut state = state_with(4);
        state.blocks[0].status = BlockStatus::Completed;
        state.workers[0].status = WorkerStatus::Working;
        // (1 + 0.5) / 4 = 37.5 -> 38
        assert_eq!(compute_progress(&state), Some(38));

        for block in &mut state.blocks {
            block.status = BlockStatus::Completed;
        }
        state.workers[0].status = WorkerStatus::Idle;
        assert_eq!(compute_progress(&state), Some(100));
    }

    #[test]
    fn test_failed_blocks_do_not_count() {
        let mut state = state_with(2);
        state.blocks[0].status = BlockStatus::Failed;
        assert_eq!(compute_progress(&state), Some(0));
    }
}
